//! Strongly-typed job identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Prefix used for generated job identifiers.
pub const JOB_ID_PREFIX: &str = "job_";

/// Identifier of a queued or archived job.
///
/// A UUID rendered with a short human-readable prefix (`job_0190...`), so ids
/// found in logs can be told apart from other UUIDs at a glance. The prefix is
/// fixed: equality is decided by the UUID alone. The same value identifies a
/// job while queued and after it is archived.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct JobId(Uuid);

impl JobId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{JOB_ID_PREFIX}{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = s.strip_prefix(JOB_ID_PREFIX).ok_or_else(|| {
            DomainError::invalid_id(format!("JobId: expected {JOB_ID_PREFIX:?} prefix: {s:?}"))
        })?;
        let uuid =
            Uuid::from_str(uuid).map_err(|e| DomainError::invalid_id(format!("JobId: {e}")))?;
        Ok(Self(uuid))
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for JobId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_the_job_prefix() {
        let id = JobId::new();
        assert!(id.to_string().starts_with("job_"));
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
    }

    #[test]
    fn parses_prefixed_uuids() {
        let id: JobId = "job_6740b44e-13b9-475d-af06-979627e0e0d6".parse().unwrap();
        assert_eq!(
            id.as_uuid().to_string(),
            "6740b44e-13b9-475d-af06-979627e0e0d6"
        );
    }

    #[test]
    fn rejects_missing_or_foreign_prefixes() {
        for raw in [
            "6740b44e-13b9-475d-af06-979627e0e0d6",
            "task_6740b44e-13b9-475d-af06-979627e0e0d6",
            "JOB_6740b44e-13b9-475d-af06-979627e0e0d6",
        ] {
            assert!(
                matches!(raw.parse::<JobId>(), Err(DomainError::InvalidId(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(matches!(
            "job_123".parse::<JobId>(),
            Err(DomainError::InvalidId(_))
        ));
        assert!(matches!(
            "job_zzzzzzzz-13b9-475d-af06-979627e0e0d6".parse::<JobId>(),
            Err(DomainError::InvalidId(_))
        ));
    }

    #[test]
    fn serializes_as_a_single_string() {
        let id: JobId = "job_6740b44e-13b9-475d-af06-979627e0e0d6".parse().unwrap();
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json, serde_json::json!("job_6740b44e-13b9-475d-af06-979627e0e0d6"));
    }
}
