//! Package version numbers.
//!
//! A version is 1-4 dotted decimal components. Ordering is numeric per
//! component and lexicographic across components; missing trailing
//! components compare as zero, so `1.2` and `1.2.0` are equal.

use std::cmp::Ordering;
use std::fmt::{self, Display};
use std::str::FromStr;

use anyhow::{anyhow, Result};

/// The maximum number of dotted components a version may carry.
const MAX_COMPONENTS: usize = 4;

/// A parsed package version.
#[derive(Debug, Clone)]
pub struct Version {
    components: Vec<u64>,
    raw: String,
}

impl Version {
    /// The sentinel used as the starting point when scanning for the
    /// greatest version among candidates.
    pub fn minimum() -> Self {
        Self {
            components: vec![0, 0, 0, 0],
            raw: "0.0.0.0".to_string(),
        }
    }

    /// Number of dotted components in the original input.
    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    fn component(&self, i: usize) -> u64 {
        self.components.get(i).copied().unwrap_or(0)
    }

    /// Whether `prefix` is a dotted prefix of this version, comparing
    /// component-by-component (`1.2` is a prefix of `1.2.3` but not of
    /// `1.20.3`). An empty prefix matches everything.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        if prefix.is_empty() {
            return true;
        }
        let Ok(prefix) = Version::from_str(prefix) else {
            return false;
        };
        if prefix.component_count() > self.component_count() {
            return false;
        }
        self.components[..prefix.component_count()] == prefix.components[..]
    }
}

impl FromStr for Version {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if s.is_empty() || parts.len() > MAX_COMPONENTS {
            return Err(anyhow!("invalid version {s:?}"));
        }
        let components = parts
            .iter()
            .map(|p| {
                p.parse::<u64>()
                    .map_err(|_| anyhow!("invalid version component {p:?} in {s:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            components,
            raw: s.to_string(),
        })
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let n = self.component_count().max(other.component_count());
        for i in 0..n {
            match self.component(i).cmp(&other.component(i)) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

/// Compare two version strings numerically. Unparseable inputs sort below
/// everything valid, which keeps "greatest version" scans stable when a
/// catalog row carries a malformed value.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (Version::from_str(a), Version::from_str(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_numeric() {
        assert_eq!(compare_versions("5.10.1", "5.9.1"), Ordering::Greater);
        assert_eq!(compare_versions("1.2.2", "1.2.2"), Ordering::Equal);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("0.9", "1.0"), Ordering::Less);
        assert_eq!(compare_versions("1.2.3.4", "1.2.3"), Ordering::Greater);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Version::from_str("").is_err());
        assert!(Version::from_str("1.2.beta").is_err());
        assert!(Version::from_str("1.2.3.4.5").is_err());
        assert!(Version::from_str("1..2").is_err());
        assert!(Version::from_str("20").is_ok());
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["1", "1.2", "1.2.3", "1.2.3.4"] {
            assert_eq!(Version::from_str(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_dotted_prefix() {
        let v = Version::from_str("1.2.3").unwrap();
        assert!(v.has_prefix(""));
        assert!(v.has_prefix("1"));
        assert!(v.has_prefix("1.2"));
        assert!(v.has_prefix("1.2.3"));
        assert!(!v.has_prefix("1.20"));
        assert!(!v.has_prefix("1.2.3.0"));
        let v = Version::from_str("1.20.3").unwrap();
        assert!(!v.has_prefix("1.2"));
    }
}
