use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use super::{StateError, StateStore};

pub const STATE_FILE: &str = "state.json";

/// Typed view of `state.json`. Unknown keys are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateDocument {
    #[serde(default, deserialize_with = "string_or_number")]
    pub history_id: Option<String>,
    #[serde(default)]
    pub full_scan_complete: bool,
    #[serde(default)]
    pub last_run_at: Option<i64>,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub updated_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SyncStateDocument {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// True when the change log can be used instead of a full listing.
    pub fn incremental_ready(&self) -> bool {
        self.history_id.is_some() && self.full_scan_complete
    }
}

/// A shallow merge applied to the stored document. Unset fields are left
/// alone; `updatedAt` is always refreshed.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    history_id: Option<String>,
    full_scan_complete: Option<bool>,
    last_run_at: Option<i64>,
    email_address: Option<String>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history_id(mut self, value: impl Into<String>) -> Self {
        self.history_id = Some(value.into());
        self
    }

    pub fn full_scan_complete(mut self, value: bool) -> Self {
        self.full_scan_complete = Some(value);
        self
    }

    pub fn last_run_at(mut self, value: i64) -> Self {
        self.last_run_at = Some(value);
        self
    }

    pub fn email_address(mut self, value: impl Into<String>) -> Self {
        self.email_address = Some(value.into());
        self
    }

    fn apply(self, doc: &mut Map<String, Value>, now: i64) {
        if let Some(next) = self.history_id {
            if cursor_regresses(doc.get("historyId"), &next) {
                warn!(next = %next, "ignoring change cursor older than the stored one");
            } else {
                doc.insert("historyId".into(), Value::String(next));
            }
        }
        if let Some(value) = self.full_scan_complete {
            doc.insert("fullScanComplete".into(), Value::Bool(value));
        }
        if let Some(value) = self.last_run_at {
            doc.insert("lastRunAt".into(), Value::from(value));
        }
        if let Some(value) = self.email_address {
            doc.insert("emailAddress".into(), Value::String(value));
        }
        doc.insert("updatedAt".into(), Value::from(now));
    }
}

impl StateStore {
    /// Raw key/value form of the document, as mirrored to remote storage.
    pub async fn read_state_raw(&self) -> Result<Map<String, Value>, StateError> {
        let bytes = match tokio::fs::read(&self.document_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.document_path.clone(),
                    source,
                });
            }
        };

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(self.corrupt(format!("expected an object, found {other}"))),
            Err(err) => Err(self.corrupt(err.to_string())),
        }
    }

    pub async fn read_state(&self) -> Result<SyncStateDocument, StateError> {
        let raw = self.read_state_raw().await?;
        serde_json::from_value(Value::Object(raw)).map_err(|err| self.corrupt(err.to_string()))
    }

    pub async fn patch_state(&self, patch: StatePatch) -> Result<SyncStateDocument, StateError> {
        let _gate = self.document_gate.lock().await;
        let mut raw = self.read_state_raw().await?;
        patch.apply(&mut raw, Utc::now().timestamp());
        self.write_state_raw(&raw).await?;
        serde_json::from_value(Value::Object(raw)).map_err(|err| self.corrupt(err.to_string()))
    }

    /// Replaces the local document with a copy fetched from remote storage.
    /// This is the one place the cursor may move backwards.
    pub async fn adopt_remote_state(&self, remote: Map<String, Value>) -> Result<(), StateError> {
        let _gate = self.document_gate.lock().await;
        self.write_state_raw(&remote).await?;
        info!(path = %self.document_path.display(), "adopted sync state from remote mirror");
        Ok(())
    }

    async fn write_state_raw(&self, doc: &Map<String, Value>) -> Result<(), StateError> {
        let io_err = |source: std::io::Error| StateError::Io {
            path: self.document_path.clone(),
            source,
        };

        // serde_json's Map is ordered by key, so the output is stable.
        let mut payload = serde_json::to_vec_pretty(doc)
            .map_err(|err| self.corrupt(format!("failed to encode state: {err}")))?;
        payload.push(b'\n');

        let tmp_path = self
            .document_path
            .with_file_name(format!(".{STATE_FILE}.{}.tmp", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(io_err)?;
        file.write_all(&payload).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        if let Err(source) = tokio::fs::rename(&tmp_path, &self.document_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(io_err(source));
        }
        Ok(())
    }

    fn corrupt(&self, reason: String) -> StateError {
        StateError::Corrupt {
            path: self.document_path.clone(),
            reason,
        }
    }
}

fn cursor_regresses(current: Option<&Value>, next: &str) -> bool {
    let current = match current {
        Some(Value::String(s)) => s.parse::<u64>().ok(),
        Some(Value::Number(n)) => n.as_u64(),
        _ => None,
    };
    matches!((current, next.parse::<u64>().ok()), (Some(cur), Some(next)) if next < cur)
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::open_temp_state;
    use serde_json::json;

    #[tokio::test]
    async fn missing_document_reads_as_empty() {
        let (state, _dir) = open_temp_state().await;
        let doc = state.read_state().await.expect("read");
        assert!(doc.is_empty());
        assert!(!doc.incremental_ready());
    }

    #[tokio::test]
    async fn patch_merges_and_stamps_updated_at() {
        let (state, _dir) = open_temp_state().await;
        state
            .adopt_remote_state(
                json!({"custom": "kept", "historyId": "100"})
                    .as_object()
                    .cloned()
                    .expect("object"),
            )
            .await
            .expect("seed");

        let doc = state
            .patch_state(StatePatch::new().full_scan_complete(true).last_run_at(42))
            .await
            .expect("patch");

        assert_eq!(doc.history_id.as_deref(), Some("100"));
        assert!(doc.full_scan_complete);
        assert_eq!(doc.last_run_at, Some(42));
        assert!(doc.updated_at.is_some());
        assert_eq!(doc.extra.get("custom"), Some(&json!("kept")));
        assert!(doc.incremental_ready());
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards_through_patches() {
        let (state, _dir) = open_temp_state().await;
        state
            .patch_state(StatePatch::new().history_id("500"))
            .await
            .expect("first");
        let doc = state
            .patch_state(StatePatch::new().history_id("499"))
            .await
            .expect("second");
        assert_eq!(doc.history_id.as_deref(), Some("500"));

        let doc = state
            .patch_state(StatePatch::new().history_id("501"))
            .await
            .expect("third");
        assert_eq!(doc.history_id.as_deref(), Some("501"));
    }

    #[tokio::test]
    async fn adopting_remote_state_may_rewind_cursor() {
        let (state, _dir) = open_temp_state().await;
        state
            .patch_state(StatePatch::new().history_id("500"))
            .await
            .expect("patch");
        state
            .adopt_remote_state(json!({"historyId": "10"}).as_object().cloned().expect("object"))
            .await
            .expect("adopt");

        let doc = state.read_state().await.expect("read");
        assert_eq!(doc.history_id.as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn written_document_is_sorted_and_indented() {
        let (state, _dir) = open_temp_state().await;
        state
            .patch_state(StatePatch::new().last_run_at(1).email_address("me@example.com"))
            .await
            .expect("patch");

        let text = tokio::fs::read_to_string(state.root().join(STATE_FILE))
            .await
            .expect("read file");
        let email = text.find("\"emailAddress\"").expect("email key");
        let last_run = text.find("\"lastRunAt\"").expect("lastRunAt key");
        let updated = text.find("\"updatedAt\"").expect("updatedAt key");
        assert!(email < last_run && last_run < updated);
        assert!(text.contains("\n  \"emailAddress\""));

        let leftovers: Vec<_> = std::fs::read_dir(state.root())
            .expect("list dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temporary files should be renamed away");
    }

    #[tokio::test]
    async fn unparseable_document_is_reported_as_corrupt() {
        let (state, _dir) = open_temp_state().await;
        tokio::fs::write(state.root().join(STATE_FILE), b"{not json")
            .await
            .expect("write garbage");

        match state.read_state().await {
            Err(StateError::Corrupt { .. }) => {}
            other => panic!("expected corrupt state, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn numeric_cursor_is_accepted() {
        let (state, _dir) = open_temp_state().await;
        tokio::fs::write(state.root().join(STATE_FILE), br#"{"historyId": 77}"#)
            .await
            .expect("write");
        let doc = state.read_state().await.expect("read");
        assert_eq!(doc.history_id.as_deref(), Some("77"));
    }
}
