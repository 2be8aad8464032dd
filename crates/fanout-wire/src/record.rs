//! The durable transaction record.
//!
//! Records are stored in a shared table keyed `(database-id, sequence-no)`.
//! Attribute names are hyphenated in the durable shape; the serde renames
//! below match the table exactly so a record round-trips unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command value of a synthetic record that claims a sequence-number slot
/// left vacant by a writer that failed mid-commit.
pub const ROLLBACK_COMMAND: &str = "Rollback";

/// Identifier of a client database (the log's partition key).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatabaseId(pub String);

impl DatabaseId {
    /// Creates a database ID from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the database ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DatabaseId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DatabaseId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One durable record in the append-only per-database log.
///
/// The engine reads only the envelope fields (`database_id`, `sequence_no`,
/// `command`, `creation_date`); everything else is opaque ciphertext or
/// metadata that is forwarded to the client untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    #[serde(rename = "database-id")]
    pub database_id: DatabaseId,

    #[serde(rename = "sequence-no")]
    pub sequence_no: i64,

    pub command: String,

    #[serde(rename = "creation-date")]
    pub creation_date: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,

    #[serde(rename = "file-metadata", skip_serializing_if = "Option::is_none")]
    pub file_metadata: Option<Value>,

    #[serde(rename = "file-id", skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,

    #[serde(
        rename = "file-encryption-key",
        skip_serializing_if = "Option::is_none"
    )]
    pub file_encryption_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub operations: Option<Value>,
}

impl TransactionRecord {
    /// Creates a record carrying only envelope fields.
    pub fn new(database_id: DatabaseId, sequence_no: i64, command: impl Into<String>) -> Self {
        Self {
            database_id,
            sequence_no,
            command: command.into(),
            creation_date: Utc::now(),
            key: None,
            record: None,
            file_metadata: None,
            file_id: None,
            file_encryption_key: None,
            operations: None,
        }
    }

    /// Creates the synthetic record that claims a vacant sequence-number slot.
    pub fn rollback(database_id: DatabaseId, sequence_no: i64) -> Self {
        Self::new(database_id, sequence_no, ROLLBACK_COMMAND)
    }

    /// True when this record is a gap-filler rather than a client write.
    pub fn is_rollback(&self) -> bool {
        self.command == ROLLBACK_COMMAND
    }

    /// Estimated byte size of the durable item.
    ///
    /// Sums the lengths of string and buffer attributes and counts numeric
    /// attributes at 8 bytes. The result drives snapshot scheduling, so it
    /// only has to be a stable estimate, not an exact wire size.
    pub fn estimated_size(&self) -> usize {
        fn value_len(v: &Option<Value>) -> usize {
            v.as_ref().map(|v| v.to_string().len()).unwrap_or(0)
        }
        fn str_len(s: &Option<String>) -> usize {
            s.as_ref().map(|s| s.len()).unwrap_or(0)
        }

        self.database_id.as_str().len()
            + 8
            + self.command.len()
            + self.creation_date.to_rfc3339().len()
            + str_len(&self.key)
            + value_len(&self.record)
            + value_len(&self.file_metadata)
            + str_len(&self.file_id)
            + str_len(&self.file_encryption_key)
            + value_len(&self.operations)
    }
}
