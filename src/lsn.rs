//! Log sequence numbers: 64-bit positions in the write-ahead log, rendered
//! as two uppercase hex halves separated by a slash.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::errors::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    /// Byte offset math used by standby status updates.
    pub fn wrapping_add(self, bytes: u64) -> Lsn {
        Lsn(self.0.wrapping_add(bytes))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Lsn {
        Lsn(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> u64 {
        lsn.0
    }
}

impl Display for Lsn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Lsn, Error> {
        let (upper, lower) = s.split_once('/').ok_or_else(|| {
            Error::ProtocolViolation(format!("invalid LSN {s:?}: expected X/X"))
        })?;
        let parse_half = |half: &str| -> Result<u64, Error> {
            if half.is_empty() || half.len() > 8 {
                return Err(Error::ProtocolViolation(format!(
                    "invalid LSN {s:?}: bad half {half:?}"
                )));
            }
            u64::from_str_radix(half, 16)
                .map_err(|_| Error::ProtocolViolation(format!("invalid LSN {s:?}")))
        };
        Ok(Lsn((parse_half(upper)? << 32) | parse_half(lower)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_without_padding() {
        assert_eq!(Lsn(0).to_string(), "0/0");
        assert_eq!(Lsn(0x16_B374D848).to_string(), "16/B374D848");
        assert_eq!(Lsn(u64::MAX).to_string(), "FFFFFFFF/FFFFFFFF");
    }

    #[test]
    fn parse_is_case_insensitive_and_round_trips() {
        assert_eq!("16/B374D848".parse::<Lsn>().unwrap(), Lsn(0x16_B374D848));
        assert_eq!("16/b374d848".parse::<Lsn>().unwrap(), Lsn(0x16_B374D848));
        assert_eq!(
            "16/B374D848".parse::<Lsn>().unwrap().to_string(),
            "16/B374D848"
        );

        for n in [0u64, 1, 0x1_0000_0000, 0xDEAD_BEEF_CAFE_F00D, u64::MAX] {
            assert_eq!(Lsn(n).to_string().parse::<Lsn>().unwrap(), Lsn(n));
        }
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "16", "16/", "/848", "xx/yy", "123456789/0"] {
            assert!(bad.parse::<Lsn>().is_err(), "{bad:?}");
        }
    }
}
