use crate::bypass::StrategySummary;
use crate::tlv::{encode_length, TlvEdit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::debug;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// TLV carrier fields in extraction precedence order; the first one present
/// in the envelope is used.
pub const TLV_FIELDS: [&str; 5] = [
    "raw_tlv_hex",
    "raw_data",
    "tlv_hex",
    "tlv_bytes_b64",
    "tlv_data",
];

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("no TLV carrier field present in envelope")]
    MissingTlv,

    #[error("envelope field {field} is not valid {expected}")]
    BadField {
        field: &'static str,
        expected: &'static str,
    },
}

/// Inner NFC_DATA envelope: a JSON object carrying the TLV buffer in one of
/// several encodings plus ancillary fields relayed verbatim.
#[derive(Debug, Clone)]
pub struct NfcEnvelope {
    fields: Map<String, Value>,
}

impl NfcEnvelope {
    pub fn parse(payload: &[u8]) -> Result<NfcEnvelope, EnvelopeError> {
        let value: Value = serde_json::from_slice(payload)?;
        match value {
            Value::Object(fields) => Ok(NfcEnvelope { fields }),
            _ => Err(EnvelopeError::NotAnObject),
        }
    }

    /// TLV bytes per the precedence rule over `TLV_FIELDS`.
    pub fn extract_tlv(&self) -> Result<Vec<u8>, EnvelopeError> {
        for field in TLV_FIELDS {
            let Some(value) = self.fields.get(field) else {
                continue;
            };

            let text = value.as_str().ok_or(EnvelopeError::BadField {
                field,
                expected: "string",
            })?;

            debug!("extracting TLV from envelope field {}", field);

            return match field {
                "tlv_bytes_b64" => {
                    BASE64
                        .decode(text)
                        .map_err(|_| EnvelopeError::BadField {
                            field: "tlv_bytes_b64",
                            expected: "base64",
                        })
                }
                "tlv_data" => decode_tag_value_pairs(text),
                _ => decode_hex_field(field, text),
            };
        }

        Err(EnvelopeError::MissingTlv)
    }

    /// Fields other than the TLV carriers, relayed verbatim into the
    /// response.
    pub fn ancillary(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .filter(|(key, _)| !TLV_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

fn decode_hex_field(field: &'static str, text: &str) -> Result<Vec<u8>, EnvelopeError> {
    if text.len() % 2 != 0 {
        return Err(EnvelopeError::BadField {
            field,
            expected: "even-length hex",
        });
    }
    hex::decode(text).map_err(|_| EnvelopeError::BadField {
        field,
        expected: "even-length hex",
    })
}

fn is_hex(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_hexdigit())
}

/// `TAG:VALUE|TAG:VALUE` pairs; a VALUE that is even-length hex is taken as
/// hex, anything else as UTF-8 bytes.
fn decode_tag_value_pairs(text: &str) -> Result<Vec<u8>, EnvelopeError> {
    let mut out: Vec<u8> = Vec::new();

    for pair in text.split('|') {
        let (tag, value) = pair.split_once(':').ok_or(EnvelopeError::BadField {
            field: "tlv_data",
            expected: "TAG:VALUE pairs",
        })?;

        let tag_bytes = decode_hex_field("tlv_data", tag.trim())?;
        if tag_bytes.is_empty() {
            return Err(EnvelopeError::BadField {
                field: "tlv_data",
                expected: "TAG:VALUE pairs",
            });
        }

        let value_bytes = if value.len() % 2 == 0 && is_hex(value) {
            hex::decode(value).map_err(|_| EnvelopeError::BadField {
                field: "tlv_data",
                expected: "TAG:VALUE pairs",
            })?
        } else {
            value.as_bytes().to_vec()
        };

        out.extend_from_slice(&tag_bytes);
        out.extend_from_slice(&encode_length(value_bytes.len()));
        out.extend_from_slice(&value_bytes);
    }

    Ok(out)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AppliedEdit {
    pub op: String,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl From<&TlvEdit> for AppliedEdit {
    fn from(edit: &TlvEdit) -> Self {
        match edit {
            TlvEdit::Replace(tag, value) => AppliedEdit {
                op: "replace".to_string(),
                tag: tag.to_string(),
                value: Some(hex::encode_upper(value)),
            },
            TlvEdit::Remove(tag) => AppliedEdit {
                op: "remove".to_string(),
                tag: tag.to_string(),
                value: None,
            },
            TlvEdit::Insert(tag, value, _) => AppliedEdit {
                op: "insert".to_string(),
                tag: tag.to_string(),
                value: Some(hex::encode_upper(value)),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MitmSummary {
    pub applied_edits: Vec<AppliedEdit>,
    pub strategy: StrategySummary,
    pub signature_tag_present: bool,
    pub success_probability: f64,
}

/// Inner response envelope for a processed NFC_DATA payload.
#[derive(Debug, Clone, Serialize)]
pub struct NfcResponse {
    pub modified_tlv_hex: String,
    pub mitm: MitmSummary,
    #[serde(flatten)]
    pub ancillary: Map<String, Value>,
}

impl NfcResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        // serialization of a Serialize-only struct into a plain object
        // cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }
}
