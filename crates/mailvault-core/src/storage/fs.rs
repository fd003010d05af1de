use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{
    LIST_PAGE_SIZE, ObjectEntry, ObjectPage, ObjectStore, StorageError, page_after, validate_key,
};

type Listing = Arc<Vec<ObjectEntry>>;

/// Directory-backed object store. Each key maps to a file below
/// `<root>/<prefix>/`; writes land in a temp file that is renamed into place,
/// so readers never see a partial object.
///
/// A listing from the first page is kept per prefix and later pages are
/// served from it, so one enumeration walks the tree once.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    base: PathBuf,
    listings: Arc<Mutex<HashMap<String, Listing>>>,
    dir_reads: Arc<AtomicU64>,
}

impl FsObjectStore {
    pub fn new(root: impl AsRef<Path>, prefix: &str) -> Result<Self, StorageError> {
        let prefix = prefix.trim_matches('/');
        let mut base = root.as_ref().to_path_buf();
        if !prefix.is_empty() {
            validate_key(prefix)?;
            base.push(prefix);
        }
        Ok(Self {
            base,
            listings: Arc::default(),
            dir_reads: Arc::default(),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directories read by listings so far.
    pub fn dir_reads(&self) -> u64 {
        self.dir_reads.load(Ordering::Relaxed)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.base.join(key))
    }

    fn cached_listing(&self, prefix: &str) -> Option<Listing> {
        self.listings
            .lock()
            .expect("lock listings")
            .get(prefix)
            .cloned()
    }

    /// Every stored key under `prefix`, sorted.
    async fn walk(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StorageError> {
        // Walk from the deepest directory the prefix names, then filter.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start_dir = if dir_part.is_empty() {
            self.base.clone()
        } else {
            self.path_for(dir_part)?
        };

        let mut entries = Vec::new();
        let mut pending = vec![start_dir];
        while let Some(dir) = pending.pop() {
            let mut reader = match tokio::fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(io_error(prefix)(err)),
            };
            self.dir_reads.fetch_add(1, Ordering::Relaxed);
            while let Some(entry) = reader.next_entry().await.map_err(io_error(prefix))? {
                let file_type = entry.file_type().await.map_err(io_error(prefix))?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let name = entry.file_name();
                if name.to_str().is_none_or(is_temp_file) {
                    continue;
                }
                let Some(key) = relative_key(&self.base, &path) else {
                    continue;
                };
                if !key.starts_with(prefix) {
                    continue;
                }
                let last_modified = entry
                    .metadata()
                    .await
                    .ok()
                    .and_then(|meta| meta.modified().ok())
                    .map(DateTime::<Utc>::from);
                entries.push(ObjectEntry { key, last_modified });
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

fn io_error(key: &str) -> impl Fn(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        key: key.to_string(),
        source,
    }
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;

        tokio::fs::create_dir_all(parent).await.map_err(io_error(key))?;
        let tmp_path = parent.join(format!(".{name}.{}.tmp", Uuid::new_v4()));
        let written = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&body).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &path).await
        }
        .await;

        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(io_error(key)(err));
        }
        Ok(())
    }

    async fn get_opt(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(key)(err)),
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StorageError> {
        // A first page always starts a fresh walk.
        let cached = continuation.and_then(|_| self.cached_listing(prefix));
        let listing = match cached {
            Some(listing) => listing,
            None => {
                let listing = Arc::new(self.walk(prefix).await?);
                self.listings
                    .lock()
                    .expect("lock listings")
                    .insert(prefix.to_string(), listing.clone());
                listing
            }
        };

        let page = page_after(&listing, continuation, LIST_PAGE_SIZE);
        if page.next_token.is_none() {
            self.listings.lock().expect("lock listings").remove(prefix);
        }
        Ok(page)
    }
}

fn relative_key(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Option<Vec<&str>> = relative
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect();
    Some(parts?.join("/"))
}
