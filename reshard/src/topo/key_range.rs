//! Half-open intervals of the logical keyspace id space.
//!
//! A range is a pair of byte-string bounds compared lexicographically. An
//! empty start means "from the beginning", an empty end means "to the end",
//! so the default range covers everything. Shard names encode their range in
//! hex: `-80`, `40-80`, `80-`. A name without a dash (`0`) is unsharded and
//! carries no range.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyRange {
    #[serde(with = "hex_bytes")]
    pub start: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(start: &[u8], end: &[u8]) -> Self {
        Self {
            start: start.to_vec(),
            end: end.to_vec(),
        }
    }

    /// Parse a shard name into its key range. Returns `None` for
    /// unsharded names like `0`.
    pub fn parse_shard_name(name: &str) -> Result<Option<KeyRange>, Error> {
        if name.is_empty() {
            return Err(Error::InvalidShardName(name.to_string()));
        }
        let Some((start, end)) = name.split_once('-') else {
            return Ok(None);
        };

        Ok(Some(KeyRange {
            start: decode_hex(start).ok_or_else(|| Error::InvalidShardName(name.to_string()))?,
            end: decode_hex(end).ok_or_else(|| Error::InvalidShardName(name.to_string()))?,
        }))
    }

    /// Full keyspace id space.
    pub fn is_complete(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }

    /// Two half-open ranges intersect when each starts before the other ends.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        (other.end.is_empty() || self.start < other.end)
            && (self.end.is_empty() || other.start < self.end)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", encode_hex(&self.start), encode_hex(&self.end))
    }
}

/// Treat a missing range as the complete one, so unsharded shards
/// compare and intersect like everything else.
pub fn or_complete(range: &Option<KeyRange>) -> KeyRange {
    range.clone().unwrap_or_default()
}

/// Whether a sorted list of ranges forms one contiguous cover.
pub fn is_contiguous(ranges: &[KeyRange]) -> bool {
    ranges
        .windows(2)
        .all(|pair| !pair[0].end.is_empty() && pair[0].end == pair[1].start)
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::encode_hex(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::decode_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid hex key"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_shard_name() {
        assert_eq!(KeyRange::parse_shard_name("0").unwrap(), None);
        assert_eq!(
            KeyRange::parse_shard_name("-80").unwrap().unwrap(),
            KeyRange::new(&[], &[0x80])
        );
        assert_eq!(
            KeyRange::parse_shard_name("40-80").unwrap().unwrap(),
            KeyRange::new(&[0x40], &[0x80])
        );
        assert_eq!(
            KeyRange::parse_shard_name("80-").unwrap().unwrap(),
            KeyRange::new(&[0x80], &[])
        );
        assert_eq!(
            KeyRange::parse_shard_name("-").unwrap().unwrap(),
            KeyRange::default()
        );
        assert!(KeyRange::parse_shard_name("4-80").is_err());
        assert!(KeyRange::parse_shard_name("zz-80").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(KeyRange::new(&[0x40], &[0x80]).to_string(), "40-80");
        assert_eq!(KeyRange::default().to_string(), "-");
    }

    #[test]
    fn test_intersects() {
        let full = KeyRange::default();
        let low = KeyRange::new(&[], &[0x80]);
        let high = KeyRange::new(&[0x80], &[]);
        let mid = KeyRange::new(&[0x40], &[0xc0]);

        assert!(full.intersects(&low));
        assert!(low.intersects(&full));
        assert!(!low.intersects(&high));
        assert!(mid.intersects(&low));
        assert!(mid.intersects(&high));
    }

    #[test]
    fn test_contiguous() {
        let low = KeyRange::new(&[], &[0x80]);
        let high = KeyRange::new(&[0x80], &[]);
        assert!(is_contiguous(&[low.clone(), high.clone()]));
        assert!(!is_contiguous(&[
            low.clone(),
            KeyRange::new(&[0xc0], &[])
        ]));
        assert!(is_contiguous(&[KeyRange::default()]));
    }

    #[test]
    fn test_serde_hex() {
        let range = KeyRange::new(&[0x40], &[0x80]);
        let json = serde_json::to_string(&range).unwrap();
        assert_eq!(json, r#"{"start":"40","end":"80"}"#);
        assert_eq!(serde_json::from_str::<KeyRange>(&json).unwrap(), range);
    }
}
