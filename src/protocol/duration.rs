//! # Stream Duration
//!
//! Nanosecond-precision duration used for stream positions, discard offsets,
//! and round-trip time reporting. Values travel on the wire as ISO-8601
//! seconds durations (`"PT1.25S"`).
//!
//! ## Invariants:
//! - Non-negative (unsigned representation)
//! - Addition does not lose precision
//! - Serialization round-trips exactly for audio-rate-derived values

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::Add;
use std::str::FromStr;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Exact, overflow-safe duration backed by an integer nanosecond count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamDuration {
    nanos: u64,
}

/// Error parsing an ISO-8601 seconds duration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration {0:?} (expected \"PT<seconds>S\")")]
pub struct DurationParseError(pub String);

impl StreamDuration {
    pub const ZERO: StreamDuration = StreamDuration { nanos: 0 };

    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    pub const fn from_seconds(seconds: u64) -> Self {
        Self {
            nanos: seconds * NANOS_PER_SECOND,
        }
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis * 1_000_000,
        }
    }

    /// Duration of `samples` samples at `rate` Hz.
    ///
    /// Exact for the supported audio rates (8000 Hz: 125000 ns per sample).
    pub fn from_samples(samples: u64, rate: u32) -> Self {
        let nanos = (samples as u128 * NANOS_PER_SECOND as u128) / rate as u128;
        Self {
            nanos: nanos as u64,
        }
    }

    pub const fn nanos(&self) -> u64 {
        self.nanos
    }

    pub fn seconds_f64(&self) -> f64 {
        self.nanos as f64 / NANOS_PER_SECOND as f64
    }

    /// Position advanced by `samples` samples at `rate` Hz.
    pub fn with_added_samples(&self, samples: u64, rate: u32) -> Self {
        *self + Self::from_samples(samples, rate)
    }

    pub fn checked_add(&self, other: StreamDuration) -> Option<StreamDuration> {
        self.nanos.checked_add(other.nanos).map(Self::from_nanos)
    }

    pub fn saturating_sub(&self, other: StreamDuration) -> StreamDuration {
        Self::from_nanos(self.nanos.saturating_sub(other.nanos))
    }

    /// Wire representation (`"PT0.125S"`).
    pub fn as_duration(&self) -> String {
        self.to_string()
    }
}

impl Add for StreamDuration {
    type Output = StreamDuration;

    fn add(self, rhs: StreamDuration) -> StreamDuration {
        // u64 nanoseconds covers ~584 years of audio.
        StreamDuration::from_nanos(self.nanos.saturating_add(rhs.nanos))
    }
}

impl fmt::Display for StreamDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.nanos / NANOS_PER_SECOND;
        let frac = self.nanos % NANOS_PER_SECOND;
        if frac == 0 {
            write!(f, "PT{secs}S")
        } else {
            let digits = format!("{frac:09}");
            write!(f, "PT{}.{}S", secs, digits.trim_end_matches('0'))
        }
    }
}

impl FromStr for StreamDuration {
    type Err = DurationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || DurationParseError(s.to_string());
        let body = s
            .strip_prefix("PT")
            .and_then(|rest| rest.strip_suffix('S'))
            .ok_or_else(err)?;
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, Some(f)),
            None => (body, None),
        };
        if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let seconds: u64 = int_part.parse().map_err(|_| err())?;
        let mut nanos = seconds.checked_mul(NANOS_PER_SECOND).ok_or_else(err)?;
        if let Some(frac) = frac_part {
            if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return Err(err());
            }
            let scale = 10u64.pow(9 - frac.len() as u32);
            let frac_value: u64 = frac.parse().map_err(|_| err())?;
            nanos = nanos.checked_add(frac_value * scale).ok_or_else(err)?;
        }
        Ok(Self { nanos })
    }
}

impl Serialize for StreamDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StreamDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

impl From<StreamDuration> for std::time::Duration {
    fn from(value: StreamDuration) -> Self {
        std::time::Duration::from_nanos(value.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_formats_without_fraction() {
        assert_eq!(StreamDuration::ZERO.to_string(), "PT0S");
        assert_eq!(StreamDuration::from_seconds(5).to_string(), "PT5S");
    }

    #[test]
    fn test_fraction_trims_trailing_zeros() {
        assert_eq!(StreamDuration::from_millis(250).to_string(), "PT0.25S");
        assert_eq!(StreamDuration::from_nanos(1).to_string(), "PT0.000000001S");
    }

    #[test]
    fn test_parse_round_trip() {
        for s in ["PT0S", "PT10S", "PT0.125S", "PT3.5S", "PT0.000000001S"] {
            let parsed: StreamDuration = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for s in ["", "PT", "PTS", "0.5", "PT-1S", "PT1.S", "PT1.0000000001S", "PT1,5S", "P1S"] {
            assert!(s.parse::<StreamDuration>().is_err(), "accepted {s:?}");
        }
    }

    #[test]
    fn test_samples_round_trip_at_8000() {
        for n in [0u64, 1, 7, 160, 8000, 12345, 1_000_000] {
            let d = StreamDuration::from_samples(n, 8000);
            let parsed: StreamDuration = d.as_duration().parse().unwrap();
            assert_eq!(parsed.nanos(), d.nanos());
        }
    }

    #[test]
    fn test_with_added_samples() {
        let d = StreamDuration::ZERO.with_added_samples(8000, 8000);
        assert_eq!(d, StreamDuration::from_seconds(1));
        assert_eq!(d.with_added_samples(4000, 8000).to_string(), "PT1.5S");
    }

    #[test]
    fn test_serde_string_form() {
        let d = StreamDuration::from_millis(1250);
        assert_eq!(serde_json::to_string(&d).unwrap(), "\"PT1.25S\"");
        let back: StreamDuration = serde_json::from_str("\"PT1.25S\"").unwrap();
        assert_eq!(back, d);
    }
}
