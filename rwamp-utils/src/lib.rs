//! Utility types and functions shared across the rwamp workspace.
//!
//! - Timestamp helpers with second and millisecond resolution, plus the
//!   ISO-8601 UTC string format used in challenge objects and cookie records
//! - Random identifier generation ([`newid`]) for cookie IDs and nonces
//! - Hex encoding/decoding for cryptosign challenges and signatures
//! - A thread-safe [`Counter`] tracking a current value and high-water mark

#![deny(unsafe_code)]

use std::fmt::Write as _;

use anyhow::anyhow;
use rand::Rng;

mod counter;

pub use counter::Counter;

/// Timestamp in seconds since the Unix epoch.
pub type Timestamp = i64;

/// Timestamp in milliseconds since the Unix epoch.
pub type TimestampMillis = i64;

#[inline]
pub fn timestamp_secs() -> Timestamp {
    chrono::Utc::now().timestamp()
}

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    chrono::Utc::now().timestamp_millis()
}

/// Current UTC time as an ISO-8601 string with millisecond resolution,
/// e.g. `2026-08-23T10:11:12.345Z`.
#[inline]
pub fn utcnow() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

const ID_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a random identifier of the given length from an alphanumeric
/// character set. Used for cookie IDs and challenge nonces.
#[inline]
pub fn newid(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len).map(|_| ID_CHARS[rng.random_range(0..ID_CHARS.len())] as char).collect()
}

/// Encode bytes as a lowercase hex string.
#[inline]
pub fn to_hex(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Decode a hex string into bytes.
#[inline]
pub fn from_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(anyhow!("hex string has odd length"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| anyhow!("invalid hex at offset {}", i))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newid() {
        let id = newid(24);
        assert_eq!(id.len(), 24);
        assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(newid(24), newid(24));
    }

    #[test]
    fn test_hex() {
        assert_eq!(to_hex(&[0x00, 0xab, 0xff]), "00abff");
        assert_eq!(from_hex("00abff").unwrap(), vec![0x00, 0xab, 0xff]);
        assert!(from_hex("0").is_err());
        assert!(from_hex("zz").is_err());
    }

    #[test]
    fn test_utcnow_format() {
        let now = utcnow();
        assert!(now.ends_with('Z'));
        assert_eq!(now.len(), "2026-08-23T10:11:12.345Z".len());
    }
}
