//! Output manifests and `ContentRef` as seen by notebook windows.
//!
//! The daemon stores each output as a manifest in its content-addressed
//! blob store and writes the manifest hash into the notebook doc. Small
//! content is inlined in the manifest; large content is a separate blob.
//! Windows fetch the manifest by hash and resolve every `ContentRef` back
//! into a plain Jupyter output.

use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 blob hash.
pub const BLOB_HASH_LEN: usize = 64;

/// A reference to content that may be inlined or stored in the blob store.
///
/// Serializes as an untagged enum:
/// - `{"inline": "..."}`  — content is inlined
/// - `{"blob": "hash...", "size": 12345}` — content is in blob store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentRef {
    /// Content is inlined in the manifest.
    Inline { inline: String },
    /// Content is stored in the blob store.
    Blob { blob: String, size: u64 },
}

impl ContentRef {
    /// Resolve to string content, fetching from `source` for blobs.
    pub async fn resolve(&self, source: &dyn BlobSource) -> io::Result<String> {
        match self {
            ContentRef::Inline { inline } => Ok(inline.clone()),
            ContentRef::Blob { blob, .. } => {
                let data = source.get_blob(blob).await?;
                String::from_utf8(data).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("invalid UTF-8: {}", e))
                })
            }
        }
    }
}

/// Output manifest, tagged by Jupyter `output_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "output_type")]
pub enum OutputManifest {
    #[serde(rename = "display_data")]
    DisplayData {
        data: HashMap<String, ContentRef>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        metadata: HashMap<String, Value>,
    },
    #[serde(rename = "execute_result")]
    ExecuteResult {
        data: HashMap<String, ContentRef>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        metadata: HashMap<String, Value>,
        execution_count: Option<i32>,
    },
    #[serde(rename = "stream")]
    Stream { name: String, text: ContentRef },
    #[serde(rename = "error")]
    Error {
        ename: String,
        evalue: String,
        /// Traceback lines, as a JSON array string.
        traceback: ContentRef,
    },
}

/// Somewhere blobs can be fetched from by hash.
#[async_trait]
pub trait BlobSource: Send + Sync {
    /// Fetch a blob's bytes. A missing blob is an `io::ErrorKind::NotFound`.
    async fn get_blob(&self, hash: &str) -> io::Result<Vec<u8>>;
}

/// Hex SHA-256 of `data`, the blob store's content address.
pub fn blob_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Whether `s` looks like a blob hash (64 lowercase hex chars) rather than
/// inline output JSON.
pub fn is_blob_hash(s: &str) -> bool {
    s.len() == BLOB_HASH_LEN
        && s
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Whether a MIME type carries JSON rather than text.
pub fn is_json_mime(mime_type: &str) -> bool {
    mime_type == "application/json" || mime_type.ends_with("+json")
}

/// Resolve a manifest back to a full Jupyter output JSON value.
///
/// Fetches any blob-referenced content from `source`.
pub async fn resolve_manifest(manifest_json: &[u8], source: &dyn BlobSource) -> io::Result<Value> {
    let manifest: OutputManifest = serde_json::from_slice(manifest_json)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    match manifest {
        OutputManifest::DisplayData { data, metadata } => {
            let resolved_data = resolve_data_bundle(data, source).await?;
            Ok(serde_json::json!({
                "output_type": "display_data",
                "data": resolved_data,
                "metadata": metadata_object(metadata),
            }))
        }
        OutputManifest::ExecuteResult {
            data,
            metadata,
            execution_count,
        } => {
            let resolved_data = resolve_data_bundle(data, source).await?;
            Ok(serde_json::json!({
                "output_type": "execute_result",
                "data": resolved_data,
                "metadata": metadata_object(metadata),
                "execution_count": execution_count,
            }))
        }
        OutputManifest::Stream { name, text } => {
            let resolved_text = text.resolve(source).await?;
            Ok(serde_json::json!({
                "output_type": "stream",
                "name": name,
                "text": resolved_text,
            }))
        }
        OutputManifest::Error {
            ename,
            evalue,
            traceback,
        } => {
            let traceback_json = traceback.resolve(source).await?;
            let traceback_array: Value = serde_json::from_str(&traceback_json)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if !traceback_array.is_array() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "traceback is not a JSON array",
                ));
            }
            Ok(serde_json::json!({
                "output_type": "error",
                "ename": ename,
                "evalue": evalue,
                "traceback": traceback_array,
            }))
        }
    }
}

/// Resolve a data bundle of ContentRefs back to values.
async fn resolve_data_bundle(
    data: HashMap<String, ContentRef>,
    source: &dyn BlobSource,
) -> io::Result<HashMap<String, Value>> {
    let mut result = HashMap::new();

    for (mime_type, content_ref) in data {
        let content = content_ref.resolve(source).await?;
        let value = if is_json_mime(&mime_type) {
            serde_json::from_str(&content).unwrap_or(Value::String(content))
        } else {
            Value::String(content)
        };
        result.insert(mime_type, value);
    }

    Ok(result)
}

fn metadata_object(metadata: HashMap<String, Value>) -> Value {
    Value::Object(metadata.into_iter().collect())
}
