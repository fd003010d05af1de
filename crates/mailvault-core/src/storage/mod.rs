//! Object storage for backed-up messages: a local directory, an S3-compatible
//! bucket, or memory for tests.
//!
//! Keys are relative to the store's namespace prefix. The layout under it:
//!
//! ```text
//! messages/<id>.eml.gz        gzip of the raw RFC 822 bytes
//! messages/<id>.json          MessageMeta
//! state/state.json            mirror of the local sync document
//! state/restore/<id>.json     restore marker
//! ```

mod fs;
mod memory;
mod s3;

use std::io;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::retry::{RetryDecision, Retryable, classify};

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

pub const MESSAGES_PREFIX: &str = "messages/";
pub const CONTENT_SUFFIX: &str = ".eml.gz";
pub const STATE_KEY: &str = "state/state.json";
pub const RESTORE_MARKER_PREFIX: &str = "state/restore/";

pub const GZIP_CONTENT_TYPE: &str = "application/gzip";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Keys returned per `list_page` call.
pub const LIST_PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {key} not found")]
    NotFound { key: String },
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    #[error("storage i/o on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("object {key} is not valid json: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("storage request for {key} failed: {source}")]
    Http {
        key: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("storage request for {key} was rejected with {status} ({code})")]
    Remote {
        key: String,
        status: u16,
        code: String,
    },
    #[error("listing under {prefix} is malformed: {reason}")]
    InvalidListing { prefix: String, reason: String },
    #[error("invalid storage endpoint: {0}")]
    InvalidEndpoint(String),
}

impl StorageError {
    /// Coarse error code for sanitized error samples.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::NotFound { .. } => "NoSuchKey",
            StorageError::InvalidKey(_) => "InvalidKey",
            StorageError::Io { source, .. } => match source.kind() {
                io::ErrorKind::PermissionDenied => "AccessDenied",
                io::ErrorKind::NotFound => "NoSuchKey",
                _ => "IoError",
            },
            StorageError::Json { .. } => "InvalidJson",
            StorageError::Http { .. } => "TransportError",
            StorageError::Remote { code, .. } => match code.as_str() {
                "NoSuchKey" => "NoSuchKey",
                "NoSuchBucket" => "NoSuchBucket",
                "AccessDenied" => "AccessDenied",
                "SlowDown" => "SlowDown",
                "InternalError" => "InternalError",
                _ => "RemoteError",
            },
            StorageError::InvalidListing { .. } => "InvalidListing",
            StorageError::InvalidEndpoint(_) => "InvalidEndpoint",
        }
    }
}

/// Remote stores throttle and fail the same way the mail API does.
impl Retryable for StorageError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            StorageError::Http { .. } => classify(None, None),
            StorageError::Remote { status, .. } => classify(Some(*status), None),
            _ => RetryDecision::Permanent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPage {
    pub objects: Vec<ObjectEntry>,
    /// Pass back to `list_page` to continue; `None` on the last page.
    pub next_token: Option<String>,
}

/// Shared by every worker of a run, so implementations must be stateless or
/// internally synchronized.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError>;

    async fn get_opt(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Keys starting with `prefix`, in lexicographic order.
    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.get_opt(key)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }
}

pub fn content_key(id: &str) -> String {
    format!("{MESSAGES_PREFIX}{id}{CONTENT_SUFFIX}")
}

pub fn meta_key(id: &str) -> String {
    format!("{MESSAGES_PREFIX}{id}.json")
}

pub fn restore_marker_key(id: &str) -> String {
    format!("{RESTORE_MARKER_PREFIX}{id}.json")
}

/// Message id of a content object key, `None` for any other key.
pub fn id_from_content_key(key: &str) -> Option<&str> {
    let id = key
        .strip_prefix(MESSAGES_PREFIX)?
        .strip_suffix(CONTENT_SUFFIX)?;
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

/// Message id of a restore marker key.
pub fn id_from_marker_key(key: &str) -> Option<&str> {
    let id = key
        .strip_prefix(RESTORE_MARKER_PREFIX)?
        .strip_suffix(".json")?;
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

/// Writes `value` as indented JSON with object keys sorted.
pub async fn put_json<S, T>(store: &S, key: &str, value: &T) -> Result<(), StorageError>
where
    S: ObjectStore + ?Sized,
    T: Serialize + ?Sized,
{
    let json_err = |source| StorageError::Json {
        key: key.to_string(),
        source,
    };
    // Round-tripping through Value orders map keys.
    let value = serde_json::to_value(value).map_err(json_err)?;
    let mut body = serde_json::to_vec_pretty(&value).map_err(json_err)?;
    body.push(b'\n');
    store.put(key, body, JSON_CONTENT_TYPE).await
}

pub async fn get_json_opt<S, T>(store: &S, key: &str) -> Result<Option<T>, StorageError>
where
    S: ObjectStore + ?Sized,
    T: DeserializeOwned,
{
    let Some(body) = store.get_opt(key).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|source| StorageError::Json {
            key: key.to_string(),
            source,
        })
}

/// Rejects keys that could escape the namespace when mapped onto a path.
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Slices one page out of a sorted key listing, resuming strictly after
/// `continuation`.
pub(crate) fn page_after(
    sorted: &[ObjectEntry],
    continuation: Option<&str>,
    limit: usize,
) -> ObjectPage {
    let start = match continuation {
        Some(token) => sorted.partition_point(|entry| entry.key.as_str() <= token),
        None => 0,
    };
    let end = (start + limit).min(sorted.len());
    let next_token = (end < sorted.len() && end > start).then(|| sorted[end - 1].key.clone());
    let objects = sorted[start..end].to_vec();
    ObjectPage {
        objects,
        next_token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn layout_keys_round_trip_ids() {
        assert_eq!(content_key("18c2f"), "messages/18c2f.eml.gz");
        assert_eq!(meta_key("18c2f"), "messages/18c2f.json");
        assert_eq!(restore_marker_key("18c2f"), "state/restore/18c2f.json");
        assert_eq!(id_from_content_key("messages/18c2f.eml.gz"), Some("18c2f"));
        assert_eq!(id_from_content_key("messages/18c2f.json"), None);
        assert_eq!(id_from_content_key("messages/.eml.gz"), None);
        assert_eq!(id_from_content_key("other/18c2f.eml.gz"), None);
        assert_eq!(id_from_marker_key("state/restore/abc.json"), Some("abc"));
    }

    #[test]
    fn rejects_escaping_keys() {
        for key in ["", "/abs", "a/../b", "a//b", "a\\b", "./a"] {
            assert!(validate_key(key).is_err(), "{key:?} should be rejected");
        }
        assert!(validate_key("messages/a.eml.gz").is_ok());
    }

    #[test]
    fn pages_resume_after_token() {
        let entries: Vec<ObjectEntry> = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|key| ObjectEntry {
                key: key.to_string(),
                last_modified: None,
            })
            .collect();

        let first = page_after(&entries, None, 2);
        assert_eq!(first.objects.len(), 2);
        assert_eq!(first.next_token.as_deref(), Some("b"));

        let last = page_after(&entries, Some("d"), 2);
        assert_eq!(last.objects[0].key, "e");
        assert_eq!(last.next_token, None);

        let past_end = page_after(&entries, Some("z"), 2);
        assert!(past_end.objects.is_empty());
        assert_eq!(past_end.next_token, None);
    }

    #[test]
    fn remote_failures_are_classified_like_mailbox_calls() {
        let remote = |status: u16, code: &str| StorageError::Remote {
            key: "messages/m1.eml.gz".into(),
            status,
            code: code.into(),
        };

        assert_eq!(remote(503, "SlowDown").retry_decision(), RetryDecision::Retry);
        assert_eq!(remote(500, "InternalError").retry_decision(), RetryDecision::Retry);
        assert_eq!(remote(403, "AccessDenied").retry_decision(), RetryDecision::Permanent);
        assert_eq!(remote(403, "AccessDenied").code(), "AccessDenied");
        assert_eq!(remote(400, "Weird").code(), "RemoteError");
        assert_eq!(
            StorageError::NotFound { key: "k".into() }.retry_decision(),
            RetryDecision::Permanent
        );
    }

    #[tokio::test]
    async fn json_helpers_sort_keys_and_handle_absence() {
        let store = MemoryObjectStore::new();
        put_json(&store, "state/state.json", &json!({ "z": 1, "a": { "y": 2, "b": 3 } }))
            .await
            .expect("put json");

        let text = String::from_utf8(store.get("state/state.json").await.expect("get"))
            .expect("utf8");
        assert!(text.find("\"a\"").expect("a") < text.find("\"z\"").expect("z"));
        assert!(text.ends_with('\n'));
        assert_eq!(
            store.content_type("state/state.json").as_deref(),
            Some(JSON_CONTENT_TYPE)
        );

        let missing: Option<serde_json::Value> =
            get_json_opt(&store, "nope.json").await.expect("absent is ok");
        assert!(missing.is_none());

        store
            .put("bad.json", b"{".to_vec(), JSON_CONTENT_TYPE)
            .await
            .expect("put");
        let err = get_json_opt::<_, serde_json::Value>(&store, "bad.json")
            .await
            .expect_err("invalid json");
        assert_eq!(err.code(), "InvalidJson");
    }
}
