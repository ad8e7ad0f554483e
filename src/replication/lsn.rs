// ABOUTME: Log sequence number type with Postgres X/Y text form
// ABOUTME: Also yields order-preserving transaction ids for the event store

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Position in the write-ahead log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Zero-padded upper-case hex; string order equals LSN order
    pub fn to_transaction_id(self) -> String {
        format!("{:016X}", self.0)
    }

    pub fn from_transaction_id(id: &str) -> Result<Self> {
        u64::from_str_radix(id, 16)
            .map(Lsn)
            .map_err(|e| Error::conversion(format!("Invalid transaction id '{}': {}", id, e)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| Error::conversion(format!("Invalid LSN '{}': expected X/Y", s)))?;
        let high = u32::from_str_radix(high, 16)
            .map_err(|e| Error::conversion(format!("Invalid LSN '{}': {}", s, e)))?;
        let low = u32::from_str_radix(low, 16)
            .map_err(|e| Error::conversion(format!("Invalid LSN '{}': {}", s, e)))?;
        Ok(Lsn(((high as u64) << 32) | low as u64))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.0, 0x16_B374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
        assert_eq!("0/0".parse::<Lsn>().unwrap(), Lsn(0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("16B374D848".parse::<Lsn>().is_err());
        assert!("zz/1".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_transaction_id_order_matches_lsn_order() {
        let small = Lsn(0x9FF).to_transaction_id();
        let large = Lsn(0x1_0000_0000).to_transaction_id();
        assert_eq!(small, "00000000000009FF");
        assert!(small < large);
        assert_eq!(Lsn::from_transaction_id(&large).unwrap(), Lsn(0x1_0000_0000));
    }
}
