use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    LIST_PAGE_SIZE, ObjectEntry, ObjectPage, ObjectStore, StorageError, validate_key,
};

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    content_type: String,
    last_modified: DateTime<Utc>,
}

/// In-process object store. Clones share the same objects.
#[derive(Debug, Default, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<String, StoredObject>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.lock().get(key).map(|object| object.content_type.clone())
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Backdates an object, for tests that care about listing timestamps.
    pub fn set_last_modified(&self, key: &str, at: DateTime<Utc>) {
        if let Some(object) = self.lock().get_mut(key) {
            object.last_modified = at;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.lock().expect("lock objects")
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.lock().insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_opt(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        Ok(self.lock().get(key).map(|object| object.body.clone()))
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StorageError> {
        let start = match continuation {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Included(prefix.to_string()),
        };
        let mut objects: Vec<ObjectEntry> = self
            .lock()
            .range((start, Bound::Unbounded))
            .skip_while(|(key, _)| key.as_str() < prefix)
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(LIST_PAGE_SIZE + 1)
            .map(|(key, object)| ObjectEntry {
                key: key.clone(),
                last_modified: Some(object.last_modified),
            })
            .collect();

        let next_token = if objects.len() > LIST_PAGE_SIZE {
            objects.truncate(LIST_PAGE_SIZE);
            objects.last().map(|entry| entry.key.clone())
        } else {
            None
        };
        Ok(ObjectPage {
            objects,
            next_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_across_pages_in_key_order() {
        let store = MemoryObjectStore::new();
        for n in (0..LIST_PAGE_SIZE + 5).rev() {
            store
                .put(&format!("messages/{n:05}.eml.gz"), vec![1], "application/gzip")
                .await
                .expect("put");
        }
        store.put("state/state.json", b"{}".to_vec(), "application/json").await.expect("put");

        let first = store.list_page("messages/", None).await.expect("first page");
        assert_eq!(first.objects.len(), LIST_PAGE_SIZE);
        assert_eq!(first.objects[0].key, "messages/00000.eml.gz");
        let token = first.next_token.expect("more pages");

        let second = store
            .list_page("messages/", Some(&token))
            .await
            .expect("second page");
        assert_eq!(second.objects.len(), 5);
        assert_eq!(second.next_token, None);
        assert!(second.objects.iter().all(|entry| entry.key.starts_with("messages/")));
    }

    #[tokio::test]
    async fn clones_share_objects() {
        let store = MemoryObjectStore::new();
        let other = store.clone();
        store.put("a/b", b"x".to_vec(), "text/plain").await.expect("put");

        assert_eq!(other.get("a/b").await.expect("get"), b"x");
        assert!(other.remove("a/b"));
        assert_eq!(store.get_opt("a/b").await.expect("get_opt"), None);
    }
}
