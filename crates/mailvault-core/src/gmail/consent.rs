//! Installed-app consent. The user approves access in a browser, Google
//! redirects to a one-shot listener on 127.0.0.1, and the code it carries is
//! exchanged for the token pair every other command reads from the token file.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use super::oauth::{OAuthError, OAuthTokens, TOKEN_ENDPOINT, exchange_code_with_endpoint};

pub const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const CALLBACK_PATH: &str = "/oauth2callback";

pub const SCOPE_READONLY: &str = "https://www.googleapis.com/auth/gmail.readonly";
pub const SCOPE_INSERT: &str = "https://www.googleapis.com/auth/gmail.insert";
pub const SCOPE_MODIFY: &str = "https://www.googleapis.com/auth/gmail.modify";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_REQUEST_BYTES: usize = 8192;

const SUCCESS_HTML: &str = r#"<!doctype html>
<html>
  <head><title>mailvault</title></head>
  <body style="font-family: sans-serif;">
    <h2>Access granted</h2>
    <p>You can close this window and return to the terminal.</p>
  </body>
</html>
"#;

/// Backup only reads. Restore inserts messages and edits their labels.
pub fn scopes(write: bool) -> Vec<String> {
    let scopes: &[&str] = if write {
        &[SCOPE_INSERT, SCOPE_MODIFY]
    } else {
        &[SCOPE_READONLY]
    };
    scopes.iter().map(|scope| scope.to_string()).collect()
}

#[derive(Debug, Error)]
pub enum ConsentError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid authorization url: {0}")]
    InvalidUrl(String),
    #[error("malformed http request on the callback listener")]
    MalformedRequest,
    #[error("unexpected http method {0} on the callback listener")]
    UnexpectedMethod(String),
    #[error("consent was not granted: {0}")]
    Denied(String),
    #[error("callback is missing the authorization code")]
    MissingCode,
    #[error("callback state does not match this request")]
    StateMismatch,
    #[error("timed out after {0:?} waiting for the consent callback")]
    TimedOut(Duration),
    #[error("client secrets file {path}: {reason}")]
    ClientSecrets { path: PathBuf, reason: String },
    #[error(transparent)]
    OAuth(#[from] OAuthError),
}

/// OAuth client id and secret of a desktop app.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    /// Reads the JSON file the Google Cloud console downloads for an OAuth
    /// client, which nests the pair under `installed` (or `web`).
    pub async fn from_file(path: &Path) -> Result<Self, ConsentError> {
        let failed = |reason: String| ConsentError::ClientSecrets {
            path: path.to_path_buf(),
            reason,
        };
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| failed(err.to_string()))?;
        let file: ClientSecretsFile =
            serde_json::from_slice(&bytes).map_err(|err| failed(err.to_string()))?;
        let secrets = file
            .installed
            .or(file.web)
            .ok_or_else(|| failed("expected an \"installed\" or \"web\" client".into()))?;
        if secrets.client_id.is_empty() || secrets.client_secret.is_empty() {
            return Err(failed("client_id and client_secret must be set".into()));
        }
        Ok(secrets)
    }
}

pub struct ConsentFlow {
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
    token_endpoint: String,
    timeout: Duration,
}

impl ConsentFlow {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scopes,
            token_endpoint: TOKEN_ENDPOINT.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = endpoint.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Binds the callback listener, hands the consent URL to `present` and
    /// waits for the redirect.
    pub async fn run(&self, present: impl FnOnce(&Url)) -> Result<OAuthTokens, ConsentError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let redirect_uri = format!("http://127.0.0.1:{port}{CALLBACK_PATH}");

        let state = random_state();
        let url = build_auth_url(&self.client_id, &redirect_uri, &self.scopes, &state)?;
        present(&url);
        info!(redirect_uri = %redirect_uri, "waiting for the consent callback");

        let code = tokio::time::timeout(self.timeout, wait_for_code(listener, &state))
            .await
            .map_err(|_| ConsentError::TimedOut(self.timeout))??;
        debug!("received authorization code, exchanging it for tokens");

        let tokens = exchange_code_with_endpoint(
            &reqwest::Client::new(),
            &self.client_id,
            &self.client_secret,
            &code,
            &redirect_uri,
            &self.token_endpoint,
        )
        .await?;
        Ok(tokens)
    }
}

pub fn random_state() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn build_auth_url(
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
) -> Result<Url, ConsentError> {
    let scope_value = scopes.join(" ");
    Url::parse_with_params(
        AUTH_ENDPOINT,
        [
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", scope_value.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("state", state),
            ("include_granted_scopes", "true"),
        ],
    )
    .map_err(|err| ConsentError::InvalidUrl(err.to_string()))
}

/// Serves exactly one request on `listener` and returns the authorization
/// code it carries.
pub async fn wait_for_code(
    listener: TcpListener,
    expected_state: &str,
) -> Result<String, ConsentError> {
    let (mut stream, _addr) = listener.accept().await?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while buf.len() <= MAX_REQUEST_BYTES {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let request = String::from_utf8_lossy(&buf);
    let Some(request_line) = request.lines().next() else {
        send_response(&mut stream, 400, "Malformed request.").await?;
        return Err(ConsentError::MalformedRequest);
    };
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();

    if method != "GET" {
        send_response(&mut stream, 405, "Only GET is supported.").await?;
        return Err(ConsentError::UnexpectedMethod(method.to_string()));
    }

    let Ok(url) = Url::parse(&format!("http://127.0.0.1{target}")) else {
        send_response(&mut stream, 400, "Malformed callback URL, please retry.").await?;
        return Err(ConsentError::MalformedRequest);
    };

    let mut code = None;
    let mut state = None;
    let mut denied = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => denied = Some(value.into_owned()),
            _ => {}
        }
    }

    if state.as_deref() != Some(expected_state) {
        send_response(&mut stream, 400, "State mismatch, please retry.").await?;
        return Err(ConsentError::StateMismatch);
    }
    if let Some(reason) = denied {
        send_response(&mut stream, 400, "Access was not granted.").await?;
        return Err(ConsentError::Denied(reason));
    }
    let Some(code) = code.filter(|code| !code.is_empty()) else {
        send_response(&mut stream, 400, "Missing code in callback, please retry.").await?;
        return Err(ConsentError::MissingCode);
    };

    send_response(&mut stream, 200, SUCCESS_HTML).await?;
    Ok(code)
}

async fn send_response(stream: &mut TcpStream, status: u16, body: &str) -> io::Result<()> {
    let status_line = match status {
        200 => "200 OK",
        405 => "405 Method Not Allowed",
        _ => "400 Bad Request",
    };
    let response = format!(
        "HTTP/1.1 {status_line}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
