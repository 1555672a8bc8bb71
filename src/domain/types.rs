//! Identifier types shared by the cache, the gate, and the admin surface.

use std::{fmt, num::NonZeroU64, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::DomainError;

/// Identifier of a gated resource.
///
/// Identifiers are positive integers. The textual form is plain ASCII digits,
/// which keeps the derived cache file name free of path separators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(NonZeroU64);

impl ResourceId {
    pub fn new(value: u64) -> Result<Self, DomainError> {
        NonZeroU64::new(value)
            .map(Self)
            .ok_or_else(|| DomainError::validation("resource id must be greater than zero"))
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceId {
    type Err = DomainError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::validation(format!(
                "resource id `{raw}` must consist of ASCII digits"
            )));
        }
        let value: u64 = trimmed
            .parse()
            .map_err(|err| DomainError::validation(format!("resource id `{raw}`: {err}")))?;
        Self::new(value)
    }
}

impl TryFrom<u64> for ResourceId {
    type Error = DomainError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.get())
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u64::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_digits() {
        let id: ResourceId = "42".parse().expect("valid id");
        assert_eq!(id.get(), 42);
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn rejects_zero_and_path_like_values() {
        assert!("0".parse::<ResourceId>().is_err());
        assert!("../42".parse::<ResourceId>().is_err());
        assert!("4/2".parse::<ResourceId>().is_err());
        assert!("-3".parse::<ResourceId>().is_err());
        assert!("".parse::<ResourceId>().is_err());
    }

    #[test]
    fn deserializes_from_integer() {
        let id: ResourceId = serde_json::from_str("7").expect("json id");
        assert_eq!(id.get(), 7);
        assert!(serde_json::from_str::<ResourceId>("0").is_err());
    }
}
