use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::minutes(5);

/// Access/refresh token pair. Also reads the field names written by Google's
/// Python auth library (`token`, `expiry`) so existing token files keep working.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthTokens {
    #[serde(alias = "token", default)]
    pub access_token: String,
    pub refresh_token: String,
    #[serde(alias = "expiry", default)]
    pub expires_at: DateTime<Utc>,
}

impl OAuthTokens {
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        self.access_token.is_empty() || now + buffer >= self.expires_at
    }
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("missing refresh token")]
    MissingRefreshToken,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token response decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("token endpoint error {status} ({})", .error.as_deref().unwrap_or("unknown"))]
    TokenEndpoint { status: u16, error: Option<String> },
    #[error("invalid expires_in value: {0}")]
    InvalidExpires(i64),
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<(), Self::Error>;
}

#[derive(Debug, Error)]
pub enum TokenFileError {
    #[error("token file {path} not found; provision it with an OAuth refresh token")]
    NotFound { path: PathBuf },
    #[error("token file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("token file {path} is not valid: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persists tokens as JSON at a fixed path, replacing the file atomically.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<OAuthTokens, TokenFileError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(TokenFileError::NotFound {
                    path: self.path.clone(),
                });
            }
            Err(source) => {
                return Err(TokenFileError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| TokenFileError::Decode {
            path: self.path.clone(),
            source,
        })
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    type Error = TokenFileError;

    async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<(), Self::Error> {
        let io_err = |source: std::io::Error| TokenFileError::Io {
            path: self.path.clone(),
            source,
        };
        let payload = serde_json::to_vec_pretty(tokens).map_err(|source| TokenFileError::Decode {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp_path = self.path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(io_err)?;
        file.write_all(&payload).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(io_err)
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CodeTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

async fn token_endpoint_error(response: reqwest::Response) -> OAuthError {
    // Keep only the error code; the body may echo credentials.
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let error = serde_json::from_str::<TokenErrorResponse>(&body)
        .ok()
        .and_then(|parsed| parsed.error);
    OAuthError::TokenEndpoint { status, error }
}

/// Trades an authorization code from the consent screen for the first token
/// pair. Google only returns a refresh token when offline access was asked
/// for, so a response without one is an error.
pub async fn exchange_code_with_endpoint(
    client: &reqwest::Client,
    client_id: &str,
    client_secret: &str,
    code: &str,
    redirect_uri: &str,
    endpoint: &str,
) -> Result<OAuthTokens, OAuthError> {
    let response = client
        .post(endpoint)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("redirect_uri", redirect_uri),
        ])
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(token_endpoint_error(response).await);
    }

    let body = response.text().await?;
    let payload: CodeTokenResponse = serde_json::from_str(&body)?;
    let refresh_token = payload
        .refresh_token
        .filter(|token| !token.is_empty())
        .ok_or(OAuthError::MissingRefreshToken)?;
    if payload.expires_in <= 0 {
        return Err(OAuthError::InvalidExpires(payload.expires_in));
    }

    Ok(OAuthTokens {
        access_token: payload.access_token,
        refresh_token,
        expires_at: Utc::now() + Duration::seconds(payload.expires_in),
    })
}

pub async fn refresh_access_token(
    client: &reqwest::Client,
    client_id: &str,
    client_secret: &str,
    tokens: &OAuthTokens,
) -> Result<OAuthTokens, OAuthError> {
    refresh_access_token_with_endpoint(client, client_id, client_secret, tokens, TOKEN_ENDPOINT)
        .await
}

pub async fn refresh_access_token_with_endpoint(
    client: &reqwest::Client,
    client_id: &str,
    client_secret: &str,
    tokens: &OAuthTokens,
    endpoint: &str,
) -> Result<OAuthTokens, OAuthError> {
    if tokens.refresh_token.is_empty() {
        return Err(OAuthError::MissingRefreshToken);
    }

    let response = client
        .post(endpoint)
        .form(&[
            ("grant_type", "refresh_token"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", tokens.refresh_token.as_str()),
        ])
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(token_endpoint_error(response).await);
    }

    let body = response.text().await?;
    let payload: RefreshResponse = serde_json::from_str(&body).map_err(OAuthError::Decode)?;
    if payload.expires_in <= 0 {
        return Err(OAuthError::InvalidExpires(payload.expires_in));
    }

    let refresh_token = payload
        .refresh_token
        .unwrap_or_else(|| tokens.refresh_token.clone());
    let expires_at = Utc::now() + Duration::seconds(payload.expires_in);

    Ok(OAuthTokens {
        access_token: payload.access_token,
        refresh_token,
        expires_at,
    })
}
