use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::LayercacheError;

/// Identifier of an addressable data layer inside the host map.
///
/// Always non-negative: the host uses `-1` as its "not found" sentinel, so
/// that value (and every other negative one) is rejected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct LayerId(i64);

impl LayerId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for LayerId {
    type Error = LayercacheError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        if raw < 0 {
            return Err(LayercacheError::InvalidRequest(format!(
                "layer id must be non-negative, got {raw}"
            )));
        }
        Ok(Self(raw))
    }
}

impl From<LayerId> for i64 {
    fn from(id: LayerId) -> Self {
        id.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LayerId {
    type Err = LayercacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: i64 = s
            .trim()
            .parse()
            .map_err(|_| LayercacheError::InvalidRequest(format!("malformed layer id: {s:?}")))?;
        Self::try_from(raw)
    }
}

/// Unique identifier of one accepted rebuild job (UUIDv4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = LayercacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| LayercacheError::InvalidRequest(format!("malformed job id: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_layer_id_is_rejected() {
        assert!(LayerId::try_from(-1).is_err());
        assert!(LayerId::try_from(i64::MIN).is_err());
    }

    #[test]
    fn zero_is_a_valid_layer_id() {
        assert_eq!(LayerId::try_from(0).unwrap().get(), 0);
    }

    #[test]
    fn layer_id_parses_from_text() {
        let id: LayerId = " 42 ".parse().expect("parse failed");
        assert_eq!(id.get(), 42);
        assert!("abc".parse::<LayerId>().is_err());
        assert!("-7".parse::<LayerId>().is_err());
    }

    #[test]
    fn layer_id_deserialize_validates() {
        let ok: LayerId = serde_json::from_str("7").unwrap();
        assert_eq!(ok.to_string(), "7");
        assert!(serde_json::from_str::<LayerId>("-1").is_err());
    }

    #[test]
    fn job_id_roundtrips_through_display() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().expect("parse failed");
        assert_eq!(parsed, id);
    }
}
