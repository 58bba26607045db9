//! Blob operations for document storage.
//!
//! Each document is stored as a separate JSON blob with metadata fields
//! prefixed by `_` so they never collide with payload fields:
//!
//! ```text
//! {
//!   "_pk": "TXN_1700000000000_00f3a9c1d2e4b5a6c7d8",
//!   "_version": 3,
//!   "_created_at": "2024-03-20T10:00:00+00:00",
//!   "_updated_at": "2024-03-20T10:00:02+00:00",
//!   "status": "COMMITTED"
//! }
//! ```

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BlobId, DocumentKey};

/// a stored document with metadata and payload fields
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// primary key (must match the file name without `.json`)
    pub key: DocumentKey,
    /// bumped on every rewrite of the document
    pub version: u64,
    pub created_at: String,
    pub updated_at: String,
    pub data: BTreeMap<String, Value>,
}

impl Document {
    pub fn new(key: DocumentKey, data: BTreeMap<String, Value>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            key,
            version: 1,
            created_at: now.clone(),
            updated_at: now,
            data,
        }
    }

    /// create a document from a JSON object
    pub fn from_value(key: DocumentKey, value: Value) -> StorageResult<Self> {
        match value {
            Value::Object(map) => Ok(Self::new(key, map.into_iter().collect())),
            _ => Err(StorageError::SchemaViolation(
                "document data must be a JSON object".to_string(),
            )),
        }
    }

    /// create a document from any serializable struct
    pub fn from_serializable<T: Serialize>(key: DocumentKey, value: &T) -> StorageResult<Self> {
        Self::from_value(key, serde_json::to_value(value)?)
    }

    /// decode the payload fields into a typed value
    pub fn to_typed<T: DeserializeOwned>(&self) -> StorageResult<T> {
        let map: serde_json::Map<String, Value> = self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(serde_json::from_value(Value::Object(map))?)
    }

    /// next version of this document with replaced payload
    pub fn with_update(self, new_data: BTreeMap<String, Value>) -> Self {
        Self {
            key: self.key,
            version: self.version + 1,
            created_at: self.created_at,
            updated_at: chrono::Utc::now().to_rfc3339(),
            data: new_data,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }
}

#[derive(Serialize, Deserialize)]
struct DocumentJson {
    #[serde(rename = "_pk")]
    pk: String,
    #[serde(rename = "_version")]
    version: u64,
    #[serde(rename = "_created_at")]
    created_at: String,
    #[serde(rename = "_updated_at")]
    updated_at: String,
    #[serde(flatten)]
    data: BTreeMap<String, Value>,
}

/// serialize a document to JSON bytes
///
/// BTreeMap keeps key order stable so identical content yields identical blobs
pub fn serialize_document(doc: &Document) -> StorageResult<Vec<u8>> {
    let json = DocumentJson {
        pk: doc.key.as_str().to_string(),
        version: doc.version,
        created_at: doc.created_at.clone(),
        updated_at: doc.updated_at.clone(),
        data: doc.data.clone(),
    };

    Ok(serde_json::to_vec_pretty(&json)?)
}

/// deserialize a document, checking the embedded key against the file name
pub fn deserialize_document(bytes: &[u8], expected_key: &DocumentKey) -> StorageResult<Document> {
    let json: DocumentJson = serde_json::from_slice(bytes)?;

    if json.pk != expected_key.as_str() {
        return Err(StorageError::CorruptedData {
            path: expected_key.file_name().into(),
            reason: format!(
                "primary key mismatch: file name suggests '{}' but content has '{}'",
                expected_key, json.pk
            ),
        });
    }

    Ok(Document {
        key: expected_key.clone(),
        version: json.version,
        created_at: json.created_at,
        updated_at: json.updated_at,
        data: json.data,
    })
}

pub fn write_blob(repo: &git2::Repository, doc: &Document) -> StorageResult<BlobId> {
    let bytes = serialize_document(doc)?;
    let oid = repo.blob(&bytes)?;
    Ok(BlobId::new(oid))
}

pub fn read_blob(repo: &git2::Repository, blob_id: BlobId) -> StorageResult<Vec<u8>> {
    let blob = repo.find_blob(blob_id.raw())?;
    Ok(blob.content().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payment {
        order_no: String,
        amount: u64,
    }

    #[test]
    fn test_document_creation() {
        let key = DocumentKey::new("o1").unwrap();
        let mut data = BTreeMap::new();
        data.insert("amount".to_string(), json!(9999));

        let doc = Document::new(key.clone(), data);
        assert_eq!(doc.key, key);
        assert_eq!(doc.version, 1);
        assert_eq!(doc.get("amount"), Some(&json!(9999)));
    }

    #[test]
    fn test_typed_payload() {
        let key = DocumentKey::new("p1").unwrap();
        let payment = Payment {
            order_no: "ORDER1".to_string(),
            amount: 9999,
        };

        let doc = Document::from_serializable(key.clone(), &payment).unwrap();
        let bytes = serialize_document(&doc).unwrap();
        let restored = deserialize_document(&bytes, &key).unwrap();

        assert_eq!(restored.to_typed::<Payment>().unwrap(), payment);
    }

    #[test]
    fn test_non_object_rejected() {
        let key = DocumentKey::new("bad").unwrap();
        let result = Document::from_value(key, json!([1, 2, 3]));
        assert!(matches!(result, Err(StorageError::SchemaViolation(_))));
    }

    #[test]
    fn test_metadata_fields_present() {
        let doc = Document::new(DocumentKey::new("abc").unwrap(), BTreeMap::new());
        let bytes = serialize_document(&doc).unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(parsed.get("_pk"), Some(&json!("abc")));
        assert_eq!(parsed.get("_version"), Some(&json!(1)));
    }

    #[test]
    fn test_key_mismatch_detection() {
        let doc = Document::new(DocumentKey::new("correct").unwrap(), BTreeMap::new());
        let bytes = serialize_document(&doc).unwrap();

        let result = deserialize_document(&bytes, &DocumentKey::new("wrong").unwrap());
        assert!(matches!(result, Err(StorageError::CorruptedData { .. })));
    }

    #[test]
    fn test_version_increment() {
        let doc = Document::new(DocumentKey::new("v").unwrap(), BTreeMap::new());
        let updated = doc.with_update(BTreeMap::new());
        assert_eq!(updated.version, 2);
    }
}
