//! Fixed-point amounts.
//!
//! All ledger arithmetic runs on integers scaled by 10^18. Decimal strings are
//! only the wire and storage representation.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::{LedgerError, Result};

/// Fractional digits carried by every amount.
pub const DECIMALS: usize = 18;
pub const SCALE: u128 = 1_000_000_000_000_000_000;

/// Parse a decimal string into its scaled integer.
pub fn encode(text: &str) -> Result<u128> {
    let text = text.trim();
    if text.is_empty() {
        return Err(LedgerError::Validation("empty amount".into()));
    }
    let (whole, frac) = match text.split_once('.') {
        Some((w, f)) => (w, f),
        None => (text, ""),
    };
    if whole.is_empty() || (text.contains('.') && frac.is_empty()) {
        return Err(LedgerError::Validation(format!("malformed amount '{text}'")));
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(LedgerError::Validation(format!("malformed amount '{text}'")));
    }
    if frac.len() > DECIMALS {
        return Err(LedgerError::Precision(text.to_string()));
    }

    let whole: u128 = whole
        .trim_start_matches('0')
        .parse::<u128>()
        .or_else(|e| if whole.bytes().all(|b| b == b'0') { Ok(0) } else { Err(e) })
        .map_err(|_| LedgerError::Precision(text.to_string()))?;
    let mut frac_scaled: u128 = 0;
    for (i, b) in frac.bytes().enumerate() {
        frac_scaled += u128::from(b - b'0') * 10u128.pow((DECIMALS - 1 - i) as u32);
    }

    whole
        .checked_mul(SCALE)
        .and_then(|w| w.checked_add(frac_scaled))
        .ok_or_else(|| LedgerError::Precision(text.to_string()))
}

/// Render a scaled integer as its canonical decimal string: no trailing
/// fractional zeros, no trailing point, `"0"` for zero.
pub fn decode(value: u128) -> String {
    let whole = value / SCALE;
    let frac = value % SCALE;
    if frac == 0 {
        return whole.to_string();
    }
    let digits = format!("{frac:0width$}", width = DECIMALS);
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

/// A non-negative token amount at 18-decimal precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_scaled(raw: u128) -> Self {
        Amount(raw)
    }

    pub fn parse(text: &str) -> Result<Self> {
        encode(text).map(Amount)
    }

    pub fn scaled(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Result<Amount> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or_else(|| LedgerError::Precision(format!("{self} + {other} overflows")))
    }

    pub fn checked_sub(self, other: Amount) -> Result<Amount> {
        self.0.checked_sub(other.0).map(Amount).ok_or_else(|| LedgerError::InsufficientBalance {
            available: self.to_string(),
            requested: other.to_string(),
        })
    }

    /// Big-endian 32-byte leaf encoding; zero is the empty leaf.
    pub fn to_leaf(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[16..].copy_from_slice(&self.0.to_be_bytes());
        out
    }

    pub fn from_leaf(leaf: &[u8; 32]) -> Result<Self> {
        if leaf[..16].iter().any(|b| *b != 0) {
            return Err(LedgerError::ProofVerification("leaf value exceeds amount range".into()));
        }
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&leaf[16..]);
        Ok(Amount(u128::from_be_bytes(raw)))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&decode(self.0))
    }
}

impl std::str::FromStr for Amount {
    type Err = LedgerError;
    fn from_str(s: &str) -> Result<Self> {
        Amount::parse(s)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Amount::parse(&text).map_err(de::Error::custom)
    }
}
