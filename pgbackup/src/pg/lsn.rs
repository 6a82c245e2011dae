//! WAL positions.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub type TimeLineId = u32;

/// Log sequence number: a byte position in the write-ahead log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Segment number of the segment holding this position.
    pub fn segment_number(self, seg_size: u32) -> u64 {
        self.0 / seg_size as u64
    }

    /// Offset of this position inside its segment.
    pub fn segment_offset(self, seg_size: u32) -> u64 {
        self.0 % seg_size as u64
    }

    pub fn align_up(self, align: u64) -> Lsn {
        Lsn((self.0 + align - 1) / align * align)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("invalid LSN \"{}\"", s))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| format!("invalid LSN \"{}\"", s))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| format!("invalid LSN \"{}\"", s))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_display() {
        assert_eq!(Lsn(0x0000_0001_0000_0028).to_string(), "1/28");
        assert_eq!(Lsn(0x0300_0158).to_string(), "0/3000158");
    }

    #[test]
    fn test_lsn_parse() {
        assert_eq!("0/3000158".parse::<Lsn>().unwrap(), Lsn(0x0300_0158));
        assert_eq!("A/0".parse::<Lsn>().unwrap(), Lsn(0xA_0000_0000));
        assert!("3000158".parse::<Lsn>().is_err());
        assert!("x/1".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_segment_math() {
        let seg = 16 * 1024 * 1024;
        let lsn = Lsn(3 * seg as u64 + 100);
        assert_eq!(lsn.segment_number(seg), 3);
        assert_eq!(lsn.segment_offset(seg), 100);
        assert_eq!(Lsn(9).align_up(8), Lsn(16));
        assert_eq!(Lsn(16).align_up(8), Lsn(16));
    }
}
