use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Integer micro-USDC amount (1 USDC = 1_000_000 units).
///
/// Every budget-affecting quantity in the crate is carried as this type so
/// that spend arithmetic never touches floating point.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MicroUsdc(pub u64);

pub const MICRO_PER_USDC: u64 = 1_000_000;

impl MicroUsdc {
    pub const ZERO: MicroUsdc = MicroUsdc(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// Convert a decimal USDC amount (config surface only). Rounds to the
    /// nearest micro unit; negative or non-finite inputs yield `None`.
    pub fn from_usdc(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let micro = (value * MICRO_PER_USDC as f64).round();
        if micro > u64::MAX as f64 {
            return None;
        }
        Some(Self(micro as u64))
    }

    pub fn as_usdc(self) -> f64 {
        self.0 as f64 / MICRO_PER_USDC as f64
    }

    pub fn checked_add(self, other: MicroUsdc) -> Option<MicroUsdc> {
        self.0.checked_add(other.0).map(MicroUsdc)
    }

    pub fn checked_sub(self, other: MicroUsdc) -> Option<MicroUsdc> {
        self.0.checked_sub(other.0).map(MicroUsdc)
    }

    pub fn saturating_sub(self, other: MicroUsdc) -> MicroUsdc {
        MicroUsdc(self.0.saturating_sub(other.0))
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for MicroUsdc {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<MicroUsdc> for u64 {
    fn from(value: MicroUsdc) -> Self {
        value.0
    }
}

impl fmt::Display for MicroUsdc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06} USDC",
            self.0 / MICRO_PER_USDC,
            self.0 % MICRO_PER_USDC
        )
    }
}

/// Identifier of a persisted run row.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RunId(pub u64);

impl RunId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }
}

impl From<u64> for RunId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Monotonic run sequence number (distinct from the row id so that skipped
/// ticks still consume a slot in the sequence).
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RunNumber(pub u64);

impl RunNumber {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-issued invoice identifier from a 402 response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvoiceId(pub String);

impl InvoiceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// EVM chain identifier.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChainId(pub u64);

pub const BASE_CHAIN_ID: ChainId = ChainId(8453);

impl ChainId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }
}

impl From<u64> for ChainId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall-clock timestamp in unix milliseconds, used on every persisted row.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UnixMillis(pub i64);

impl UnixMillis {
    pub fn now() -> Self {
        let now = OffsetDateTime::now_utc();
        Self(now.unix_timestamp() * 1_000 + i64::from(now.millisecond()))
    }

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn into_inner(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UnixMillis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micro_usdc_from_decimal() {
        assert_eq!(MicroUsdc::from_usdc(10.0), Some(MicroUsdc(10_000_000)));
        assert_eq!(MicroUsdc::from_usdc(0.05), Some(MicroUsdc(50_000)));
        assert_eq!(MicroUsdc::from_usdc(0.25), Some(MicroUsdc(250_000)));
        assert_eq!(MicroUsdc::from_usdc(-1.0), None);
        assert!(MicroUsdc::from_usdc(f64::NAN).is_none());
    }

    #[test]
    fn micro_usdc_checked_math() {
        let a = MicroUsdc(u64::MAX);
        assert_eq!(a.checked_add(MicroUsdc(1)), None);
        assert_eq!(MicroUsdc(5).checked_sub(MicroUsdc(7)), None);
        assert_eq!(MicroUsdc(5).saturating_sub(MicroUsdc(7)), MicroUsdc::ZERO);
    }

    #[test]
    fn micro_usdc_display() {
        assert_eq!(MicroUsdc(250_000).to_string(), "0.250000 USDC");
        assert_eq!(MicroUsdc(10_000_000).to_string(), "10.000000 USDC");
    }
}
