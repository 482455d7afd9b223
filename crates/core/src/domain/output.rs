// Output artifact model: destinations, chunk keys and the finalization manifest

use crate::domain::error::{DomainError, Result};
use crate::domain::job::JobId;
use serde::{Deserialize, Serialize};

/// Relative artifact root inside the Output Store (e.g. `merged/cd4-high`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputDestination(String);

impl OutputDestination {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Must be relative, non-empty and free of `.`/`..` segments
    pub fn validate(&self) -> Result<()> {
        let raw = self.0.as_str();
        if raw.trim().is_empty() {
            return Err(DomainError::ValidationError(
                "destination must not be empty".to_string(),
            ));
        }
        if raw.starts_with('/') || raw.contains('\\') {
            return Err(DomainError::ValidationError(format!(
                "destination must be a relative path: {}",
                raw
            )));
        }
        if raw
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(DomainError::ValidationError(format!(
                "destination has an invalid path segment: {}",
                raw
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for OutputDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of one disjoint output region. One per work unit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkKey(String);

const CHUNK_KEY_PREFIX: &str = "unit-";

impl ChunkKey {
    /// Zero-padded so lexical order matches unit order
    pub fn for_unit(unit_index: u64) -> Self {
        Self(format!("{}{:06}", CHUNK_KEY_PREFIX, unit_index))
    }

    /// Accepts only the exact form `for_unit` produces
    pub fn parse(s: &str) -> Result<Self> {
        s.strip_prefix(CHUNK_KEY_PREFIX)
            .and_then(|digits| digits.parse::<u64>().ok())
            .map(Self::for_unit)
            .filter(|key| key.as_str() == s)
            .ok_or_else(|| DomainError::ValidationError(format!("Invalid chunk key: {}", s)))
    }

    pub fn unit_index(&self) -> u64 {
        self.0[CHUNK_KEY_PREFIX.len()..].parse().unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lock key guarding writes to this chunk of a job
    pub fn lock_key(&self, job_id: &str) -> String {
        format!("{}/{}", job_id, self.0)
    }
}

impl std::fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Manifest entry for one chunk, in unit order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub chunk_key: ChunkKey,
    pub unit_index: u64,
    pub row_offset: u64,
    pub row_count: u64,
}

/// Consolidated index of the merged artifact, written on finalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputManifest {
    pub job_id: JobId,
    pub destination: OutputDestination,
    pub row_label: String,
    pub columns: Vec<String>,
    pub total_rows: u64,
    pub chunks: Vec<ChunkEntry>,
    pub finalized_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_keys_sort_in_unit_order() {
        let mut keys: Vec<ChunkKey> = [10, 2, 100, 0].into_iter().map(ChunkKey::for_unit).collect();
        keys.sort();
        let indices: Vec<u64> = keys.iter().map(ChunkKey::unit_index).collect();
        assert_eq!(indices, vec![0, 2, 10, 100]);
    }

    #[test]
    fn test_chunk_key_parse() {
        let key = ChunkKey::parse("unit-000042").unwrap();
        assert_eq!(key.unit_index(), 42);
        assert_eq!(key, ChunkKey::for_unit(42));
        assert!(ChunkKey::parse("chunk-1").is_err());
        assert!(ChunkKey::parse("unit-abc").is_err());
    }

    #[test]
    fn test_chunk_key_parse_rejects_other_spellings() {
        for raw in ["unit-1", "unit-0000001", "unit-+00001", "unit-", "unit-000001 "] {
            assert!(ChunkKey::parse(raw).is_err(), "accepted {:?}", raw);
        }
        assert_eq!(ChunkKey::parse("unit-1234567").unwrap().unit_index(), 1_234_567);
    }

    #[test]
    fn test_lock_key_is_scoped_by_job() {
        let key = ChunkKey::for_unit(3);
        assert_eq!(key.lock_key("job-a"), "job-a/unit-000003");
        assert_ne!(key.lock_key("job-a"), key.lock_key("job-b"));
    }

    #[test]
    fn test_destination_validation() {
        assert!(OutputDestination::new("merged/run-1").validate().is_ok());
        assert!(OutputDestination::new("").validate().is_err());
        assert!(OutputDestination::new("/abs/path").validate().is_err());
        assert!(OutputDestination::new("a/../b").validate().is_err());
        assert!(OutputDestination::new("a//b").validate().is_err());
    }
}
