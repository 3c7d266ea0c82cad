//! LSN (Log Sequence Number) utilities for PostgreSQL replication.

use std::fmt;
use std::str::FromStr;

use crate::error::{PgError, PgResult};

/// A position in the write-ahead log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Advance past a record of `len` bytes.
    pub fn checked_add(self, len: usize) -> PgResult<Lsn> {
        u64::try_from(len)
            .ok()
            .and_then(|len| self.0.checked_add(len))
            .map(Lsn)
            .ok_or_else(|| PgError::PositionOverflow(format!("{} + {}", self, len)))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_lsn(self.0))
    }
}

impl FromStr for Lsn {
    type Err = PgError;

    fn from_str(s: &str) -> PgResult<Self> {
        parse_lsn(s).map(Lsn)
    }
}

/// Parse LSN from "X/Y" format to u64.
pub fn parse_lsn(lsn: &str) -> PgResult<u64> {
    let parts: Vec<&str> = lsn.split('/').collect();
    if parts.len() != 2 {
        return Err(PgError::InvalidLsn(lsn.to_string()));
    }

    let high =
        u32::from_str_radix(parts[0], 16).map_err(|_| PgError::InvalidLsn(lsn.to_string()))?;
    let low =
        u32::from_str_radix(parts[1], 16).map_err(|_| PgError::InvalidLsn(lsn.to_string()))?;

    Ok((u64::from(high) << 32) | u64::from(low))
}

/// Format u64 LSN to "X/Y" format.
pub fn format_lsn(lsn: u64) -> String {
    let high = lsn >> 32;
    let low = lsn & 0xFFFFFFFF;
    format!("{:X}/{:X}", high, low)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsn() {
        assert_eq!(parse_lsn("0/16B3748").unwrap(), 0x16B3748);
        assert_eq!(parse_lsn("1/16B3748").unwrap(), 0x100000000 + 0x16B3748);
        assert!(parse_lsn("invalid").is_err());
        assert!(parse_lsn("1/2/3").is_err());
        assert!(parse_lsn("100000000/0").is_err());
    }

    #[test]
    fn test_format_lsn() {
        assert_eq!(format_lsn(0x16B3748), "0/16B3748");
        assert_eq!(format_lsn(0x100000000 + 0x16B3748), "1/16B3748");
    }

    #[test]
    fn test_lsn_display_and_from_str() {
        let lsn: Lsn = "1/16B3748".parse().unwrap();
        assert_eq!(lsn.as_u64(), 0x100000000 + 0x16B3748);
        assert_eq!(lsn.to_string(), "1/16B3748");
        assert!("garbage".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_lsn_ordering() {
        assert!(Lsn::new(10) < Lsn::new(11));
        assert!("1/0".parse::<Lsn>().unwrap() > "0/FFFFFFFF".parse::<Lsn>().unwrap());
    }

    #[test]
    fn test_checked_add() {
        assert_eq!(Lsn::new(100).checked_add(28).unwrap(), Lsn::new(128));
        assert!(matches!(
            Lsn::new(u64::MAX).checked_add(1),
            Err(PgError::PositionOverflow(_))
        ));
    }
}
