//! The client-bound payload envelope.
//!
//! Every push to a socket is one `ApplyTransactions` envelope: the ordered
//! slice of new transactions, plus (on a fresh open) the database key and the
//! latest snapshot bundle. Field names are camelCase on the wire; the bundle
//! crosses as base64 text since the envelope is JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{DatabaseId, TransactionRecord};

/// Route of the envelope, dispatched on by the client.
pub const APPLY_TRANSACTIONS_ROUTE: &str = "ApplyTransactions";

/// A transaction as the client sees it.
///
/// Projection of [`TransactionRecord`]: the hyphenated durable attributes are
/// renamed to camelCase and the creation date is dropped (it only matters to
/// the server's gap-repair policy).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTransaction {
    pub seq_no: i64,
    pub command: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_metadata: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_encryption_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub operations: Option<Value>,

    pub db_id: DatabaseId,
}

impl WireTransaction {
    /// Projects a durable record to the wire shape.
    pub fn from_record(record: &TransactionRecord) -> Self {
        Self {
            seq_no: record.sequence_no,
            command: record.command.clone(),
            key: record.key.clone(),
            record: record.record.clone(),
            file_metadata: record.file_metadata.clone(),
            file_id: record.file_id.clone(),
            file_encryption_key: record.file_encryption_key.clone(),
            operations: record.operations.clone(),
            db_id: record.database_id.clone(),
        }
    }
}

/// The envelope pushed to a client socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPayload {
    pub route: String,
    pub db_id: DatabaseId,
    pub db_name_hash: String,
    pub is_owner: bool,

    /// Database encryption key material; present only on a fresh open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_key: Option<String>,

    /// Sequence number of the attached snapshot bundle, when one is attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_seq_no: Option<i64>,

    /// Snapshot bundle bytes, base64 on the wire.
    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "base64_bytes"
    )]
    pub bundle: Option<Vec<u8>>,

    pub transaction_log: Vec<WireTransaction>,

    /// Instructs the client to compact its local log into a new snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_bundle: Option<bool>,
}

impl TransactionPayload {
    /// Creates an empty envelope for a database.
    pub fn new(db_id: DatabaseId, db_name_hash: impl Into<String>, is_owner: bool) -> Self {
        Self {
            route: APPLY_TRANSACTIONS_ROUTE.to_string(),
            db_id,
            db_name_hash: db_name_hash.into(),
            is_owner,
            db_key: None,
            bundle_seq_no: None,
            bundle: None,
            transaction_log: Vec::new(),
            build_bundle: None,
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?;
        match text {
            Some(text) => BASE64
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(seq: i64) -> TransactionRecord {
        let mut record = TransactionRecord::new(DatabaseId::from("db-1"), seq, "Insert");
        record.creation_date = Utc::now();
        record.key = Some("item-key".to_string());
        record
    }

    #[test]
    fn envelope_uses_camel_case() {
        let mut payload = TransactionPayload::new(DatabaseId::from("db-1"), "hash", true);
        payload.db_key = Some("key-material".to_string());
        payload.transaction_log.push(WireTransaction::from_record(&record(1)));

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["route"], APPLY_TRANSACTIONS_ROUTE);
        assert_eq!(value["dbId"], "db-1");
        assert_eq!(value["dbNameHash"], "hash");
        assert_eq!(value["isOwner"], true);
        assert_eq!(value["dbKey"], "key-material");
        assert_eq!(value["transactionLog"][0]["seqNo"], 1);
        assert_eq!(value["transactionLog"][0]["dbId"], "db-1");

        // Absent options stay off the wire entirely.
        assert!(value.get("bundle").is_none());
        assert!(value.get("bundleSeqNo").is_none());
        assert!(value.get("buildBundle").is_none());
    }

    #[test]
    fn bundle_crosses_as_base64() {
        let mut payload = TransactionPayload::new(DatabaseId::from("db-1"), "hash", false);
        payload.bundle_seq_no = Some(5);
        payload.bundle = Some(vec![0xDE, 0xAD, 0xBE, 0xEF]);

        let text = serde_json::to_string(&payload).unwrap();
        assert!(text.contains("\"bundle\":\"3q2+7w==\""));

        let back: TransactionPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(back.bundle, Some(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        assert_eq!(back.bundle_seq_no, Some(5));
    }

    #[test]
    fn projection_renames_durable_fields() {
        let mut durable = record(9);
        durable.file_id = Some("file-1".to_string());

        let wire = WireTransaction::from_record(&durable);
        let value = serde_json::to_value(&wire).unwrap();

        assert_eq!(value["seqNo"], 9);
        assert_eq!(value["fileId"], "file-1");
        assert!(value.get("file-id").is_none());
        assert!(value.get("sequence-no").is_none());
    }
}
