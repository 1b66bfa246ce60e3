//! Directory sharding for persisted files
//!
//! A [`SubdirStrategy`] maps a filename to a relative path made of zero or
//! more directory segments followed by the filename itself. Only the
//! time-bucketed strategy depends on anything but its input.

use chrono::{DateTime, Local, TimeZone, Timelike};
use ingot_common::checksum::md5_hex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How files are spread over subdirectories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SubdirStrategy {
    /// No subdirectories
    #[default]
    Flat,
    /// `HH/MM/` of the wall clock at write time
    Time,
    /// Groups of `chars` characters of the filename (dots removed)
    Prefix { chars: usize, levels: usize },
    /// Groups of `chars` hex digits of the MD5 of the filename
    Hash { chars: usize, levels: usize },
}

impl SubdirStrategy {
    pub const THREE_LETTERS_TWO_LEVELS: SubdirStrategy = SubdirStrategy::Prefix {
        chars: 3,
        levels: 2,
    };

    pub const HASH_THREE_LETTERS_TWO_LEVELS: SubdirStrategy = SubdirStrategy::Hash {
        chars: 3,
        levels: 2,
    };

    /// Largest number of directory levels this strategy creates
    pub fn depth(&self) -> usize {
        match *self {
            SubdirStrategy::Flat => 0,
            SubdirStrategy::Time => 2,
            SubdirStrategy::Prefix { levels, .. } | SubdirStrategy::Hash { levels, .. } => levels,
        }
    }

    /// Directory segments for `filename`, evaluated against the local clock
    pub fn segments(&self, filename: &str) -> Vec<String> {
        self.segments_at(filename, Local::now())
    }

    /// Directory segments for `filename` with an explicit clock reading
    pub fn segments_at<Tz: TimeZone>(&self, filename: &str, now: DateTime<Tz>) -> Vec<String> {
        match *self {
            SubdirStrategy::Flat => Vec::new(),
            SubdirStrategy::Time => vec![
                format!("{:02}", now.hour()),
                format!("{:02}", now.minute()),
            ],
            SubdirStrategy::Prefix { chars, levels } => {
                let key: Vec<char> = filename.chars().filter(|c| *c != '.').collect();
                groups(&key, chars, levels)
            },
            SubdirStrategy::Hash { chars, levels } => {
                let digest: Vec<char> = md5_hex(filename.as_bytes()).chars().collect();
                groups(&digest, chars, levels)
            },
        }
    }

    /// Relative `/`-joined path for `filename`
    pub fn apply(&self, filename: &str) -> String {
        join(self.segments(filename), filename)
    }

    /// Like [`apply`](Self::apply) with an explicit clock reading
    pub fn apply_at<Tz: TimeZone>(&self, filename: &str, now: DateTime<Tz>) -> String {
        join(self.segments_at(filename, now), filename)
    }
}

/// `levels` consecutive groups of `chars`; nothing if the key is too short
fn groups(key: &[char], chars: usize, levels: usize) -> Vec<String> {
    if chars == 0 || levels == 0 || key.len() < chars * levels {
        return Vec::new();
    }
    key.chunks(chars)
        .take(levels)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

fn join(mut segments: Vec<String>, filename: &str) -> String {
    segments.push(filename.to_string());
    segments.join("/")
}

/// Invalid strategy name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid subdir strategy '{0}' (expected flat, time, prefix:<chars>x<levels> or hash:<chars>x<levels>)")]
pub struct ParseSubdirError(String);

impl FromStr for SubdirStrategy {
    type Err = ParseSubdirError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseSubdirError(s.to_string());
        let normalized = s.trim().to_ascii_lowercase();

        match normalized.as_str() {
            "flat" => return Ok(SubdirStrategy::Flat),
            "time" => return Ok(SubdirStrategy::Time),
            _ => {},
        }

        let (kind, shape) = normalized.split_once(':').ok_or_else(invalid)?;
        let (chars, levels) = shape.split_once('x').ok_or_else(invalid)?;
        let chars: usize = chars.parse().map_err(|_| invalid())?;
        let levels: usize = levels.parse().map_err(|_| invalid())?;
        if chars == 0 || levels == 0 {
            return Err(invalid());
        }

        match kind {
            "prefix" => Ok(SubdirStrategy::Prefix { chars, levels }),
            "hash" => Ok(SubdirStrategy::Hash { chars, levels }),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for SubdirStrategy {
    type Error = ParseSubdirError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SubdirStrategy> for String {
    fn from(strategy: SubdirStrategy) -> Self {
        strategy.to_string()
    }
}

impl fmt::Display for SubdirStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubdirStrategy::Flat => f.write_str("flat"),
            SubdirStrategy::Time => f.write_str("time"),
            SubdirStrategy::Prefix { chars, levels } => write!(f, "prefix:{}x{}", chars, levels),
            SubdirStrategy::Hash { chars, levels } => write!(f, "hash:{}x{}", chars, levels),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_prefix_three_letters_two_levels() {
        assert_eq!(
            SubdirStrategy::THREE_LETTERS_TWO_LEVELS.apply("abc.txt"),
            "abc/txt/abc.txt"
        );
    }

    #[test]
    fn test_hash_three_letters_two_levels() {
        assert_eq!(
            SubdirStrategy::HASH_THREE_LETTERS_TWO_LEVELS.apply("abc.txt"),
            "56b/6f0/abc.txt"
        );
    }

    #[test]
    fn test_prefix_is_case_sensitive() {
        let strategy = SubdirStrategy::Prefix { chars: 2, levels: 2 };
        assert_eq!(strategy.apply("AbCd.csv"), "Ab/Cd/AbCd.csv");
    }

    #[test]
    fn test_short_key_is_not_sharded() {
        assert_eq!(SubdirStrategy::THREE_LETTERS_TWO_LEVELS.apply("a.b"), "a.b");
    }

    #[test]
    fn test_flat_is_identity() {
        assert_eq!(SubdirStrategy::Flat.apply("out_1"), "out_1");
    }

    #[test]
    fn test_time_uses_clock() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 42).unwrap();
        assert_eq!(SubdirStrategy::Time.apply_at("out_3", at), "07/05/out_3");
    }

    #[test]
    fn test_strategies_are_deterministic() {
        for strategy in [
            SubdirStrategy::Flat,
            SubdirStrategy::THREE_LETTERS_TWO_LEVELS,
            SubdirStrategy::HASH_THREE_LETTERS_TWO_LEVELS,
        ] {
            assert_eq!(strategy.apply("batch_17"), strategy.apply("batch_17"));
        }
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("flat".parse::<SubdirStrategy>().unwrap(), SubdirStrategy::Flat);
        assert_eq!("TIME".parse::<SubdirStrategy>().unwrap(), SubdirStrategy::Time);
        assert_eq!(
            "prefix:3x2".parse::<SubdirStrategy>().unwrap(),
            SubdirStrategy::THREE_LETTERS_TWO_LEVELS
        );
        assert_eq!(
            "hash:2x4".parse::<SubdirStrategy>().unwrap(),
            SubdirStrategy::Hash { chars: 2, levels: 4 }
        );
        assert!("hash:0x2".parse::<SubdirStrategy>().is_err());
        assert!("sharded".parse::<SubdirStrategy>().is_err());
    }

    #[test]
    fn test_serde_uses_names() {
        let json = serde_json::to_string(&SubdirStrategy::HASH_THREE_LETTERS_TWO_LEVELS).unwrap();
        assert_eq!(json, "\"hash:3x2\"");
        let back: SubdirStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SubdirStrategy::HASH_THREE_LETTERS_TWO_LEVELS);
    }
}
