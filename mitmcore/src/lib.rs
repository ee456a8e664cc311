use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;

macro_rules! get_bit {
    ($byte:expr, $bit:expr) => {
        if $byte & (1 << $bit) != 0 {
            true
        } else {
            false
        }
    };
}

macro_rules! serialize_yaml {
    ($file:expr, $static_resource:expr) => {
        serde_yaml::from_str(
            &fs::read_to_string($file)
                .unwrap_or(String::from_utf8_lossy(include_bytes!($static_resource)).to_string()),
        )
        .unwrap()
    };
}

pub(crate) use get_bit;

pub mod analyze;
pub mod bcdutil;
pub mod bypass;
pub mod envelope;
pub mod frame;
pub mod policy;
pub mod process;
pub mod sign;
pub mod tlv;

#[derive(Serialize, Deserialize)]
pub struct Constants {
    pub numeric_country_codes: HashMap<String, String>,
    pub numeric_currency_codes: HashMap<String, String>,
}

static CONSTANTS: Lazy<Constants> =
    Lazy::new(|| serialize_yaml!("config/constants.yaml", "config/constants.yaml"));

pub fn constants() -> &'static Constants {
    &CONSTANTS
}

// PCI SSC PAN truncation; the relay stores nothing beyond the last four digits.
pub fn mask_pan(pan: &str) -> String {
    pan.chars()
        .enumerate()
        .map(|(i, c)| if i + 4 < pan.len() { '*' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pan_masking() {
        assert_eq!(mask_pan("4111111111111111"), "************1111");
        assert_eq!(mask_pan("1234"), "1234");
        assert_eq!(mask_pan(""), "");
    }

    #[test]
    fn test_embedded_constants_load() {
        let constants = constants();
        assert_eq!(
            constants.numeric_country_codes.get("0246").map(String::as_str),
            Some("Finland")
        );
        assert_eq!(
            constants.numeric_currency_codes.get("0978").map(String::as_str),
            Some("Euro")
        );
    }
}
