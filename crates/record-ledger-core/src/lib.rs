use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// The full attribute state of a record at one version. Ordered so that
/// serialization and comparison are deterministic.
pub type AttributeMap = BTreeMap<String, String>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("record id must be a positive integer, got {id}")]
    InvalidId { id: i64 },
    #[error("record {id} already exists")]
    AlreadyExists { id: RecordId },
    #[error("record {id} does not exist")]
    NotFound { id: RecordId },
    #[error("version number must be >= 1, got {version}")]
    InvalidVersion { version: i64 },
    #[error("record {id} already has a version effective at {effective_at}")]
    DuplicateTimestamp { id: RecordId, effective_at: i64 },
    #[error("update must change at least one attribute")]
    EmptyUpdate,
    #[error("storage failure: {0}")]
    Storage(String),
}

impl LedgerError {
    #[must_use]
    pub fn storage(message: impl Display) -> Self {
        Self::Storage(message.to_string())
    }
}

/// A validated record identifier. Construction through [`RecordId::new`] is
/// the only path that accepts raw input, so a held value is always positive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(i64);

impl RecordId {
    /// Validate a raw client-supplied identifier.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidId`] when the value is not strictly positive.
    pub fn new(raw: i64) -> Result<Self, LedgerError> {
        if raw <= 0 {
            return Err(LedgerError::InvalidId { id: raw });
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn get(self) -> i64 {
        self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A sparse edit to a record's attributes: a present string replaces the
/// value under that key, an explicit `null` deletes the key, and keys absent
/// from the delta are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct AttributeDelta(pub BTreeMap<String, Option<String>>);

impl AttributeDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply this delta on top of `base` and return the resulting map.
    /// Deleting a key that is not present is a no-op.
    #[must_use]
    pub fn apply(&self, base: &AttributeMap) -> AttributeMap {
        let mut next = base.clone();
        for (key, value) in &self.0 {
            match value {
                Some(value) => {
                    next.insert(key.clone(), value.clone());
                }
                None => {
                    next.remove(key);
                }
            }
        }
        next
    }

    /// The attribute map a brand-new record starts from: every set key of the
    /// delta, with deletion markers dropped.
    #[must_use]
    pub fn initial_attributes(&self) -> AttributeMap {
        self.0
            .iter()
            .filter_map(|(key, value)| value.as_ref().map(|value| (key.clone(), value.clone())))
            .collect()
    }
}

/// The persisted unit of history. Each entry stores the full resulting
/// attribute map at its effective time, never a diff, so every version is
/// readable without replay. Entries are appended or rewritten, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VersionEntry {
    pub record_id: RecordId,
    pub effective_at: i64,
    pub reported_at: i64,
    pub attributes: AttributeMap,
}

impl VersionEntry {
    /// Materialize this entry into the client-facing view at its derived rank.
    #[must_use]
    pub fn into_record(self, version: u32) -> Record {
        Record {
            id: self.record_id,
            version,
            effective_at: self.effective_at,
            reported_at: self.reported_at,
            attributes: self.attributes,
        }
    }
}

/// A record as seen by callers: one version entry annotated with its 1-based
/// rank in the chain. The wire keys are the original external contract.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub version: u32,
    #[serde(rename = "updatedTimestamp")]
    pub effective_at: i64,
    #[serde(rename = "reportedTimestamp")]
    pub reported_at: i64,
    #[serde(rename = "data")]
    pub attributes: AttributeMap,
}

impl Record {
    #[must_use]
    pub fn into_unversioned(self) -> UnversionedRecord {
        UnversionedRecord { id: self.id, data: self.attributes }
    }
}

/// The v1 wire view: id plus current data, no version metadata.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UnversionedRecord {
    pub id: RecordId,
    pub data: AttributeMap,
}

/// Current wall-clock time as unix seconds; the reported timestamp of every
/// write defaults to this.
#[must_use]
pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
