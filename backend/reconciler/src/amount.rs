//! Exact 6-decimal fixed-point USDC amounts.
//!
//! Every monetary value crossing the chain boundary is an integer count of
//! base units (micro-USDC, 10^-6). Conversion to and from decimal strings is
//! exact integer arithmetic; floating point is never involved, so many small
//! pledges cannot accumulate rounding drift.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::ReconcilerError;

/// Base units per whole USDC.
pub const MICROS_PER_USDC: i64 = 1_000_000;

/// A USDC amount stored as micro-USDC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Usdc(i64);

impl Usdc {
    pub const ZERO: Usdc = Usdc(0);

    /// Wrap a base-unit (micro-USDC) integer.
    pub const fn from_micros(micros: i64) -> Self {
        Usdc(micros)
    }

    /// The underlying base-unit integer.
    pub const fn micros(self) -> i64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Usdc) -> Option<Usdc> {
        self.0.checked_add(other.0).map(Usdc)
    }
}

impl fmt::Display for Usdc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            write!(f, "-")?;
        }
        let abs = self.0.unsigned_abs();
        let whole = abs / MICROS_PER_USDC as u64;
        let frac = abs % MICROS_PER_USDC as u64;
        if frac == 0 {
            write!(f, "{whole}")
        } else {
            let padded = format!("{frac:06}");
            write!(f, "{whole}.{}", padded.trim_end_matches('0'))
        }
    }
}

impl FromStr for Usdc {
    type Err = ReconcilerError;

    /// Parse a decimal string with at most 6 fractional digits.
    /// Negative amounts are rejected; amounts never go below zero here.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ReconcilerError::Validation(format!("invalid USDC amount: {s:?}"));

        let trimmed = s.trim();
        if trimmed.starts_with('-') {
            return Err(ReconcilerError::Validation(format!(
                "USDC amount cannot be negative: {s:?}"
            )));
        }

        let (whole, frac) = match trimmed.split_once('.') {
            Some((w, f)) => (w, f),
            None => (trimmed, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if frac.len() > 6 {
            return Err(ReconcilerError::Validation(format!(
                "USDC amount has more than 6 decimal places: {s:?}"
            )));
        }

        let whole_part: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let frac_part: i64 = if frac.is_empty() {
            0
        } else {
            // Right-pad to 6 digits so "5" means 500_000 micros.
            format!("{frac:0<6}").parse().map_err(|_| invalid())?
        };

        whole_part
            .checked_mul(MICROS_PER_USDC)
            .and_then(|w| w.checked_add(frac_part))
            .map(Usdc)
            .ok_or_else(|| ReconcilerError::Validation(format!("USDC amount out of range: {s:?}")))
    }
}

impl Serialize for Usdc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Usdc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
