use crate::bcdutil::bcd_to_ascii;
use crate::tlv::{Tag, TlvSet};
use crate::{constants, mask_pan};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str;

pub const TAG_PAN: Tag = Tag::of(0x5A);
pub const TAG_TRACK2_EQUIVALENT: Tag = Tag::of(0x57);
pub const TAG_AID: Tag = Tag::of(0x4F);
pub const TAG_DF_NAME: Tag = Tag::of(0x84);
pub const TAG_USAGE_CONTROL: Tag = Tag::of(0x9F07);
pub const TAG_CARDHOLDER_NAME: Tag = Tag::of(0x5F20);
pub const TAG_ISSUER_COUNTRY: Tag = Tag::of(0x5F28);
pub const TAG_TERMINAL_COUNTRY: Tag = Tag::of(0x9F1A);
pub const TAG_TRANSACTION_CURRENCY: Tag = Tag::of(0x5F2A);
pub const TAG_APPLICATION_CURRENCY: Tag = Tag::of(0x9F51);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardBrand {
    Visa,
    Mastercard,
    Amex,
    Discover,
    Jcb,
    UnionPay,
    DinersClub,
    Maestro,
    Unknown,
}

impl fmt::Display for CardBrand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CardBrand::Visa => "Visa",
            CardBrand::Mastercard => "Mastercard",
            CardBrand::Amex => "American Express",
            CardBrand::Discover => "Discover",
            CardBrand::Jcb => "JCB",
            CardBrand::UnionPay => "UnionPay",
            CardBrand::DinersClub => "Diners Club",
            CardBrand::Maestro => "Maestro",
            CardBrand::Unknown => "Unknown",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    Credit,
    Debit,
    Prepaid,
    Business,
    Unknown,
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CardType::Credit => "Credit",
            CardType::Debit => "Debit",
            CardType::Prepaid => "Prepaid",
            CardType::Business => "Business",
            CardType::Unknown => "Unknown",
        };
        write!(f, "{}", name)
    }
}

/// Country or currency code, 4 uppercase hex digits, with a label resolved
/// for logging only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeEntry {
    pub code: String,
    pub label: Option<String>,
}

impl fmt::Display for CodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{} ({})", self.code, label),
            None => write!(f, "{}", self.code),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CardInfo {
    pub brand: CardBrand,
    pub card_type: CardType,
    pub pan_masked: Option<String>,
    pub bin6: Option<String>,
    pub aid: Option<Vec<u8>>,
    pub issuer_country: Option<CodeEntry>,
    pub currency: Option<CodeEntry>,
}

struct BinRule {
    brand: CardBrand,
    lo: u32,
    hi: u32,
    digits: usize,
}

const fn bin(brand: CardBrand, lo: u32, hi: u32, digits: usize) -> BinRule {
    BinRule {
        brand,
        lo,
        hi,
        digits,
    }
}

// Tested in order; the first matching rule wins.
static BIN_RULES: &[BinRule] = &[
    bin(CardBrand::Amex, 34, 34, 2),
    bin(CardBrand::Amex, 37, 37, 2),
    bin(CardBrand::Discover, 6011, 6011, 4),
    bin(CardBrand::Discover, 644, 649, 3),
    bin(CardBrand::Discover, 65, 65, 2),
    bin(CardBrand::Discover, 622126, 622925, 6),
    bin(CardBrand::Jcb, 3528, 3589, 4),
    bin(CardBrand::Maestro, 5018, 5018, 4),
    bin(CardBrand::Maestro, 5020, 5020, 4),
    bin(CardBrand::Maestro, 5038, 5038, 4),
    bin(CardBrand::Maestro, 6304, 6304, 4),
    bin(CardBrand::DinersClub, 300, 305, 3),
    bin(CardBrand::DinersClub, 3095, 3095, 4),
    bin(CardBrand::DinersClub, 36, 36, 2),
    bin(CardBrand::DinersClub, 38, 38, 2),
    bin(CardBrand::DinersClub, 39, 39, 2),
    bin(CardBrand::Mastercard, 51, 55, 2),
    bin(CardBrand::Mastercard, 2221, 2720, 4),
    bin(CardBrand::Visa, 4, 4, 1),
    bin(CardBrand::UnionPay, 62, 62, 2),
];

// RID-level prefixes, longest first so Maestro wins over the generic
// Mastercard RID.
static AID_PREFIXES: &[(&str, CardBrand)] = &[
    ("A0000000043060", CardBrand::Maestro),
    ("A000000003", CardBrand::Visa),
    ("A000000004", CardBrand::Mastercard),
    ("A000000025", CardBrand::Amex),
    ("A000000152", CardBrand::Discover),
    ("A000000065", CardBrand::Jcb),
    ("A000000333", CardBrand::UnionPay),
    ("A000000324", CardBrand::DinersClub),
];

const DEBIT_AUC: [u8; 4] = [0x08, 0x18, 0x28, 0x48];
const CREDIT_AUC: [u8; 5] = [0x00, 0x01, 0x02, 0x04, 0x40];
const PREPAID_AUC: [u8; 4] = [0x20, 0x21, 0x22, 0x24];
const BUSINESS_AUC: [u8; 4] = [0x80, 0x81, 0x82, 0x84];

const CORPORATE_MARKERS: [&str; 5] = ["CORP", "LLC", "INC", "LTD", "BUSINESS"];

// ICC Track 2: PAN, 'D' separator, expiry, service code, discretionary data.
static TRACK2_PAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([0-9]{8,19})D").unwrap());

/// Derive card facts from a parsed TLV set. Pure; the full PAN never
/// outlives this call.
pub fn analyze(tlvs: &TlvSet) -> CardInfo {
    let pan = pan_digits(tlvs);
    let aid = tlvs
        .find_value(TAG_AID)
        .or_else(|| tlvs.find_value(TAG_DF_NAME))
        .map(|v| v.to_vec());

    let brand = detect_brand(pan.as_deref(), aid.as_deref());
    let card_type = detect_type(tlvs);

    let info = CardInfo {
        brand,
        card_type,
        pan_masked: pan.as_deref().map(|p| mask_pan(p)),
        bin6: pan
            .as_deref()
            .filter(|p| p.len() >= 6)
            .map(|p| p[..6].to_string()),
        aid,
        issuer_country: code_entry(
            tlvs,
            TAG_ISSUER_COUNTRY,
            TAG_TERMINAL_COUNTRY,
            &constants().numeric_country_codes,
        ),
        currency: code_entry(
            tlvs,
            TAG_TRANSACTION_CURRENCY,
            TAG_APPLICATION_CURRENCY,
            &constants().numeric_currency_codes,
        ),
    };

    debug!(
        "card analysis: {} {} pan:{} bin:{}",
        info.brand,
        info.card_type,
        info.pan_masked.as_deref().unwrap_or("-"),
        info.bin6.as_deref().unwrap_or("-")
    );

    info
}

fn pan_digits(tlvs: &TlvSet) -> Option<String> {
    if let Some(value) = tlvs.find_value(TAG_PAN) {
        if let Ok(ascii) = bcd_to_ascii(value) {
            return String::from_utf8(ascii).ok();
        }
    }

    // Track 2 Equivalent Data carries the PAN up to the 'D' separator.
    let track2 = tlvs.find_value(TAG_TRACK2_EQUIVALENT)?;
    let track2_hex = hex::encode_upper(track2);
    TRACK2_PAN
        .captures(&track2_hex)
        .map(|cap| cap[1].to_string())
}

fn detect_brand(pan: Option<&str>, aid: Option<&[u8]>) -> CardBrand {
    if let Some(digits) = pan {
        for rule in BIN_RULES {
            if digits.len() < rule.digits {
                continue;
            }
            if let Ok(prefix) = digits[..rule.digits].parse::<u32>() {
                if prefix >= rule.lo && prefix <= rule.hi {
                    debug!("brand {} from BIN prefix {}", rule.brand, prefix);
                    return rule.brand;
                }
            }
        }
    }

    if let Some(aid) = aid {
        let aid_hex = hex::encode_upper(aid);
        for (prefix, brand) in AID_PREFIXES {
            if aid_hex.starts_with(prefix) {
                debug!("brand {} from AID {}", brand, aid_hex);
                return *brand;
            }
        }
    }

    CardBrand::Unknown
}

fn detect_type(tlvs: &TlvSet) -> CardType {
    if let Some(auc) = tlvs.find_value(TAG_USAGE_CONTROL) {
        if let Some(&first) = auc.first() {
            if DEBIT_AUC.contains(&first) {
                return CardType::Debit;
            }
            if CREDIT_AUC.contains(&first) {
                return CardType::Credit;
            }
            if PREPAID_AUC.contains(&first) {
                return CardType::Prepaid;
            }
            if BUSINESS_AUC.contains(&first) {
                return CardType::Business;
            }
        }
    }

    // The name heuristic only ever promotes Unknown to Business.
    if let Some(name) = tlvs.find_value(TAG_CARDHOLDER_NAME) {
        if let Ok(name) = str::from_utf8(name) {
            let name = name.to_uppercase();
            if CORPORATE_MARKERS.iter().any(|marker| name.contains(marker)) {
                return CardType::Business;
            }
        }
    }

    CardType::Unknown
}

fn code_entry(
    tlvs: &TlvSet,
    tag: Tag,
    fallback: Tag,
    labels: &std::collections::HashMap<String, String>,
) -> Option<CodeEntry> {
    let value = tlvs.find_value(tag).or_else(|| tlvs.find_value(fallback))?;
    let code = normalize_code(value);
    let label = labels.get(&code).cloned();
    Some(CodeEntry { code, label })
}

// Zero-padded 4-hex-digit uppercase form regardless of raw byte length.
fn normalize_code(value: &[u8]) -> String {
    let mut code = hex::encode_upper(value);
    if code.len() < 4 {
        code = format!("{:0>4}", code);
    } else if code.len() > 4 {
        code = code[code.len() - 4..].to_string();
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::TlvSet;

    fn tlvs(hex_str: &str) -> TlvSet {
        TlvSet::parse(&hex::decode(hex_str).unwrap()).unwrap()
    }

    #[test]
    fn test_visa_credit_from_pan_and_auc() {
        let set = tlvs("5A0841111111111111119F0701005F280202465F2A020978");
        let info = analyze(&set);
        assert_eq!(info.brand, CardBrand::Visa);
        assert_eq!(info.card_type, CardType::Credit);
        assert_eq!(info.pan_masked.as_deref(), Some("************1111"));
        assert_eq!(info.bin6.as_deref(), Some("411111"));
        let country = info.issuer_country.unwrap();
        assert_eq!(country.code, "0246");
        assert_eq!(country.label.as_deref(), Some("Finland"));
        let currency = info.currency.unwrap();
        assert_eq!(currency.code, "0978");
        assert_eq!(currency.label.as_deref(), Some("Euro"));
    }

    #[test]
    fn test_mastercard_debit() {
        let set = tlvs("5A0855555555555544449F070108");
        let info = analyze(&set);
        assert_eq!(info.brand, CardBrand::Mastercard);
        assert_eq!(info.card_type, CardType::Debit);
    }

    #[test]
    fn test_bin_rule_order() {
        // Amex before Discover/Diners
        let set = tlvs("5A083700000000000000");
        assert_eq!(analyze(&set).brand, CardBrand::Amex);
        // 622126 falls into the Discover range even though 62 is UnionPay
        let set = tlvs("5A086221261111111111");
        assert_eq!(analyze(&set).brand, CardBrand::Discover);
        // plain 62 stays UnionPay
        let set = tlvs("5A086200001111111111");
        assert_eq!(analyze(&set).brand, CardBrand::UnionPay);
        // 2221 opens the extended Mastercard range
        let set = tlvs("5A082221001111111111");
        assert_eq!(analyze(&set).brand, CardBrand::Mastercard);
        // Maestro 5018 wins over Mastercard 51-55
        let set = tlvs("5A085018001111111111");
        assert_eq!(analyze(&set).brand, CardBrand::Maestro);
        // Diners 36
        let set = tlvs("5A083600001111111111");
        assert_eq!(analyze(&set).brand, CardBrand::DinersClub);
        // JCB 3528-3589
        let set = tlvs("5A083528001111111111");
        assert_eq!(analyze(&set).brand, CardBrand::Jcb);
    }

    #[test]
    fn test_brand_from_aid_when_pan_missing() {
        let set = tlvs("4F07A0000000041010");
        let info = analyze(&set);
        assert_eq!(info.brand, CardBrand::Mastercard);
        assert_eq!(info.aid, Some(hex::decode("A0000000041010").unwrap()));
        assert!(info.pan_masked.is_none());
    }

    #[test]
    fn test_maestro_aid_wins_over_mastercard_rid() {
        let set = tlvs("4F07A0000000043060");
        assert_eq!(analyze(&set).brand, CardBrand::Maestro);
    }

    #[test]
    fn test_pan_from_track2_equivalent() {
        // 4111111111111111 D 2512 201 ... padded with F
        let set = tlvs("57114111111111111111D2512201123456789F");
        let info = analyze(&set);
        assert_eq!(info.brand, CardBrand::Visa);
        assert_eq!(info.bin6.as_deref(), Some("411111"));
        assert_eq!(info.pan_masked.as_deref(), Some("************1111"));
    }

    #[test]
    fn test_unknown_brand() {
        let set = tlvs("5A089999999999999999");
        assert_eq!(analyze(&set).brand, CardBrand::Unknown);
    }

    #[test]
    fn test_business_promotion_from_cardholder_name() {
        // No AUC; corporate marker in the name promotes Unknown to Business.
        let set = TlvSet::parse(
            &[
                hex::decode("5A084111111111111111").unwrap(),
                vec![0x5F, 0x20, 0x08],
                b"ACME LLC".to_vec(),
            ]
            .concat(),
        )
        .unwrap();
        assert_eq!(analyze(&set).card_type, CardType::Business);
    }

    #[test]
    fn test_auc_beats_name_heuristic() {
        let mut buf = hex::decode("5A0841111111111111119F070108").unwrap();
        buf.extend(vec![0x5F, 0x20, 0x08]);
        buf.extend(b"ACME LLC");
        let set = TlvSet::parse(&buf).unwrap();
        assert_eq!(analyze(&set).card_type, CardType::Debit);
    }

    #[test]
    fn test_code_normalization_pads_short_values() {
        let set = tlvs("5F280146");
        let info = analyze(&set);
        assert_eq!(info.issuer_country.unwrap().code, "0046");
    }

    #[test]
    fn test_currency_fallback_tag() {
        let set = tlvs("9F51020840");
        let info = analyze(&set);
        assert_eq!(info.currency.unwrap().code, "0840");
    }
}
