use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use rusty_s3::actions::ListObjectsV2;
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use tracing::debug;

use super::{LIST_PAGE_SIZE, ObjectEntry, ObjectPage, ObjectStore, StorageError, validate_key};
use crate::config::S3Config;
use crate::retry::RetryPolicy;

/// Lifetime of each presigned request URL.
const PRESIGN_TTL: Duration = Duration::from_secs(600);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Object store on an S3-compatible bucket (Cloudflare R2, MinIO, AWS).
/// Keys live under `<prefix>/` inside the bucket and requests use path-style
/// addressing.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    http: reqwest::Client,
    bucket: Bucket,
    credentials: Credentials,
    prefix: String,
    policy: RetryPolicy,
}

impl S3ObjectStore {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        region: &str,
        credentials: Credentials,
        prefix: &str,
    ) -> Result<Self, StorageError> {
        let endpoint: Url = endpoint
            .parse()
            .map_err(|err| StorageError::InvalidEndpoint(format!("{endpoint}: {err}")))?;
        let bucket = Bucket::new(
            endpoint,
            UrlStyle::Path,
            bucket.to_string(),
            region.to_string(),
        )
        .map_err(|err| StorageError::InvalidEndpoint(err.to_string()))?;

        let prefix = prefix.trim_matches('/');
        if !prefix.is_empty() {
            validate_key(prefix)?;
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| StorageError::Http {
                key: String::new(),
                source,
            })?;

        Ok(Self {
            http,
            bucket,
            credentials,
            prefix: prefix.to_string(),
            policy: RetryPolicy::default(),
        })
    }

    /// Builds a store from `[storage.s3]`; `load` has already checked that the
    /// endpoint, bucket and keys are present.
    pub fn from_config(config: &S3Config, prefix: &str) -> Result<Self, StorageError> {
        let endpoint = config.endpoint_url().ok_or_else(|| {
            StorageError::InvalidEndpoint("storage.s3 needs an endpoint or account_id".into())
        })?;
        Self::new(
            &endpoint,
            &config.bucket,
            config.region(),
            Credentials::new(&config.access_key_id, &config.secret_access_key),
            prefix,
        )
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn bucket_name(&self) -> &str {
        self.bucket.name()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> Result<String, StorageError> {
        validate_key(key)?;
        Ok(if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{key}", self.prefix)
        })
    }

    fn relative_key<'a>(&self, full: &'a str) -> Option<&'a str> {
        if self.prefix.is_empty() {
            return Some(full);
        }
        full.strip_prefix(self.prefix.as_str())?.strip_prefix('/')
    }

    async fn put_once(&self, key: &str, body: &[u8], content_type: &str) -> Result<(), StorageError> {
        let full = self.full_key(key)?;
        let url = self
            .bucket
            .put_object(Some(&self.credentials), &full)
            .sign(PRESIGN_TTL);
        let response = self
            .http
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body.to_vec())
            .send()
            .await
            .map_err(http_error(key))?;
        if !response.status().is_success() {
            return Err(remote_error(key, response).await);
        }
        Ok(())
    }

    async fn get_once(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let full = self.full_key(key)?;
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &full)
            .sign(PRESIGN_TTL);
        let response = self.http.get(url).send().await.map_err(http_error(key))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(remote_error(key, response).await);
        }
        let body = response.bytes().await.map_err(http_error(key))?;
        Ok(Some(body.to_vec()))
    }

    async fn list_once(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StorageError> {
        let full_prefix = if self.prefix.is_empty() {
            prefix.to_string()
        } else {
            format!("{}/{prefix}", self.prefix)
        };

        let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
        action.with_prefix(full_prefix.as_str());
        action.with_max_keys(LIST_PAGE_SIZE);
        if let Some(token) = continuation {
            action.with_continuation_token(token);
        }
        let url = action.sign(PRESIGN_TTL);

        let response = self.http.get(url).send().await.map_err(http_error(prefix))?;
        if !response.status().is_success() {
            return Err(remote_error(prefix, response).await);
        }
        let body = response.text().await.map_err(http_error(prefix))?;
        let parsed =
            ListObjectsV2::parse_response(&body).map_err(|err| StorageError::InvalidListing {
                prefix: prefix.to_string(),
                reason: err.to_string(),
            })?;

        let objects = parsed
            .contents
            .into_iter()
            .filter_map(|content| {
                let key = self.relative_key(&content.key)?.to_string();
                let last_modified = DateTime::parse_from_rfc3339(&content.last_modified)
                    .ok()
                    .map(|at| at.with_timezone(&Utc));
                Some(ObjectEntry { key, last_modified })
            })
            .collect();
        Ok(ObjectPage {
            objects,
            next_token: parsed.next_continuation_token,
        })
    }
}

fn http_error(key: &str) -> impl Fn(reqwest::Error) -> StorageError + '_ {
    move |source| StorageError::Http {
        key: key.to_string(),
        source,
    }
}

/// Keeps the status and the S3 error code; the rest of the body is dropped.
async fn remote_error(key: &str, response: reqwest::Response) -> StorageError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let code = error_code(&body).unwrap_or_else(|| match status {
        404 => "NoSuchKey".to_string(),
        403 => "AccessDenied".to_string(),
        _ => format!("Http{status}"),
    });
    debug!(key, status, code = %code, "storage request rejected");
    StorageError::Remote {
        key: key.to_string(),
        status,
        code,
    }
}

fn error_code(body: &str) -> Option<String> {
    let start = body.find("<Code>")? + "<Code>".len();
    let end = body[start..].find("</Code>")? + start;
    let code = body[start..end].trim();
    (!code.is_empty()).then(|| code.to_string())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        self.policy
            .run("storage_put", || self.put_once(key, &body, content_type))
            .await
    }

    async fn get_opt(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.policy.run("storage_get", || self.get_once(key)).await
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StorageError> {
        self.policy
            .run("storage_list", || self.list_once(prefix, continuation))
            .await
    }
}
