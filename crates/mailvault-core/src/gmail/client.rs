use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::gmail::{
    oauth::{
        DEFAULT_REFRESH_BUFFER, OAuthError, OAuthTokens, TOKEN_ENDPOINT, TokenStore,
        refresh_access_token_with_endpoint,
    },
    types::{ApiErrorEnvelope, ListHistoryResponse, ListMessagesResponse, Message, Profile},
};
use crate::retry::{RetryDecision, Retryable, classify};

pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users";

/// Largest page the list endpoints hand out.
pub const MAX_PAGE_SIZE: u32 = 500;

#[derive(Debug, Error)]
pub enum GmailClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("oauth error: {0}")]
    OAuth(#[from] OAuthError),
    #[error("token persistence error: {0}")]
    TokenStore(String),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unauthorized after refresh")]
    Unauthorized,
    #[error("gmail api error {status} ({})", .reason.as_deref().unwrap_or("no reason"))]
    Api { status: u16, reason: Option<String> },
    #[error("message {0} has no raw payload")]
    MissingRaw(String),
    #[error("raw payload is not valid base64url: {0}")]
    InvalidRaw(#[from] base64::DecodeError),
}

impl GmailClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            GmailClientError::Api { status, .. } => Some(*status),
            GmailClientError::Http(err) => err.status().map(|status| status.as_u16()),
            GmailClientError::Unauthorized => Some(StatusCode::UNAUTHORIZED.as_u16()),
            GmailClientError::OAuth(OAuthError::TokenEndpoint { status, .. }) => Some(*status),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            GmailClientError::Api { reason, .. } => reason.as_deref(),
            _ => None,
        }
    }

    /// True for a 404. On the history endpoint this means the start cursor is
    /// older than what the server retains.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND.as_u16())
    }

    /// Short category name used in sanitized error samples.
    pub fn category(&self) -> &'static str {
        match self {
            GmailClientError::Api { .. } | GmailClientError::Unauthorized => "HttpError",
            GmailClientError::Http(err) if err.status().is_some() => "HttpError",
            GmailClientError::Http(_) => "TransportError",
            GmailClientError::OAuth(_) | GmailClientError::TokenStore(_) => "AuthError",
            GmailClientError::Decode(_)
            | GmailClientError::MissingRaw(_)
            | GmailClientError::InvalidRaw(_) => "DecodeError",
        }
    }
}

impl Retryable for GmailClientError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            GmailClientError::Api { status, reason } => classify(Some(*status), reason.as_deref()),
            GmailClientError::Http(err) => classify(err.status().map(|s| s.as_u16()), None),
            GmailClientError::OAuth(OAuthError::Http(err)) => {
                classify(err.status().map(|s| s.as_u16()), None)
            }
            GmailClientError::OAuth(OAuthError::TokenEndpoint { status, .. }) => {
                classify(Some(*status), None)
            }
            _ => RetryDecision::Permanent,
        }
    }
}

/// Decodes Gmail's base64url `raw` field, with or without padding.
pub fn decode_raw(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(encoded.trim_end_matches('='))
}

pub struct GmailClient<S: TokenStore> {
    http: Client,
    user_id: String,
    client_id: String,
    client_secret: String,
    api_base: String,
    token_endpoint: String,
    tokens: RwLock<OAuthTokens>,
    refresh_lock: Mutex<()>,
    token_store: Arc<S>,
}

impl<S: TokenStore> GmailClient<S> {
    pub fn new(
        http: Client,
        user_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        initial_tokens: OAuthTokens,
        token_store: Arc<S>,
    ) -> Self {
        Self {
            http,
            user_id: user_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            token_endpoint: TOKEN_ENDPOINT.to_string(),
            tokens: RwLock::new(initial_tokens),
            refresh_lock: Mutex::new(()),
            token_store,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_token_endpoint(mut self, token_endpoint: impl Into<String>) -> Self {
        self.token_endpoint = token_endpoint.into();
        self
    }

    /// Fetches the user's Gmail profile, including the current historyId.
    pub async fn get_profile(&self) -> Result<Profile, GmailClientError> {
        let url = format!("{}/{}/profile", self.api_base, self.user_id);
        self.send_json(|| self.http.get(&url)).await
    }

    pub async fn list_messages(
        &self,
        query: Option<&str>,
        page_token: Option<&str>,
        include_spam_trash: bool,
        max_results: Option<u32>,
    ) -> Result<ListMessagesResponse, GmailClientError> {
        let url = format!("{}/{}/messages", self.api_base, self.user_id);
        self.send_json(|| {
            let mut builder = self.http.get(&url);
            if let Some(q) = query {
                builder = builder.query(&[("q", q)]);
            }
            if let Some(token) = page_token {
                builder = builder.query(&[("pageToken", token)]);
            }
            if include_spam_trash {
                builder = builder.query(&[("includeSpamTrash", "true")]);
            }
            if let Some(max) = max_results {
                builder = builder.query(&[("maxResults", max)]);
            }
            builder
        })
        .await
    }

    /// Lists change-log entries after `start_history_id`, restricted to
    /// message additions.
    pub async fn list_history(
        &self,
        start_history_id: &str,
        page_token: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<ListHistoryResponse, GmailClientError> {
        let url = format!("{}/{}/history", self.api_base, self.user_id);
        self.send_json(|| {
            let mut builder = self.http.get(&url).query(&[
                ("startHistoryId", start_history_id),
                ("historyTypes", "messageAdded"),
            ]);
            if let Some(token) = page_token {
                builder = builder.query(&[("pageToken", token)]);
            }
            if let Some(max) = max_results {
                builder = builder.query(&[("maxResults", max)]);
            }
            builder
        })
        .await
    }

    pub async fn get_raw_message(&self, message_id: &str) -> Result<Message, GmailClientError> {
        let url = format!("{}/{}/messages/{}", self.api_base, self.user_id, message_id);
        self.send_json(|| self.http.get(&url).query(&[("format", "raw")]))
            .await
    }

    /// Inserts a raw RFC 822 message, dating it from its own `Date:` header.
    pub async fn insert_message(
        &self,
        raw: &[u8],
        label_ids: &[String],
    ) -> Result<Message, GmailClientError> {
        let url = format!("{}/{}/messages", self.api_base, self.user_id);
        let mut body = json!({ "raw": URL_SAFE.encode(raw) });
        if !label_ids.is_empty() {
            body["labelIds"] = json!(label_ids);
        }
        self.send_json(|| {
            self.http
                .post(&url)
                .query(&[("internalDateSource", "dateHeader")])
                .json(&body)
        })
        .await
    }

    pub async fn modify_message(
        &self,
        message_id: &str,
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<Message, GmailClientError> {
        let url = format!(
            "{}/{}/messages/{}/modify",
            self.api_base, self.user_id, message_id
        );
        let body = json!({
            "addLabelIds": add_label_ids,
            "removeLabelIds": remove_label_ids,
        });
        self.send_json(|| self.http.post(&url).json(&body)).await
    }

    pub async fn trash_message(&self, message_id: &str) -> Result<Message, GmailClientError> {
        let url = format!(
            "{}/{}/messages/{}/trash",
            self.api_base, self.user_id, message_id
        );
        self.send_json(|| self.http.post(&url)).await
    }

    async fn send_json<T, B>(&self, build: B) -> Result<T, GmailClientError>
    where
        T: DeserializeOwned,
        B: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let response = self.perform_authenticated(build).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(GmailClientError::Decode)
    }

    async fn perform_authenticated<B>(
        &self,
        build: B,
    ) -> Result<reqwest::Response, GmailClientError>
    where
        B: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let tokens = self.ensure_fresh_token(false).await?;
        let mut response = build().bearer_auth(&tokens.access_token).send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let tokens = self.ensure_fresh_token(true).await?;
            response = build().bearer_auth(&tokens.access_token).send().await?;
        }

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(GmailClientError::Unauthorized);
        }

        let status = response.status();
        if !status.is_success() {
            // Only the reason token survives; bodies can quote message content.
            let body = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<ApiErrorEnvelope>(&body)
                .ok()
                .and_then(ApiErrorEnvelope::reason);
            return Err(GmailClientError::Api {
                status: status.as_u16(),
                reason,
            });
        }

        Ok(response)
    }

    async fn ensure_fresh_token(
        &self,
        force_refresh: bool,
    ) -> Result<OAuthTokens, GmailClientError> {
        {
            let tokens = self.tokens.read().await;
            if !force_refresh && !tokens.needs_refresh(Utc::now(), DEFAULT_REFRESH_BUFFER) {
                return Ok(tokens.clone());
            }
        }

        let _guard = self.refresh_lock.lock().await;

        {
            let tokens = self.tokens.read().await;
            if !force_refresh && !tokens.needs_refresh(Utc::now(), DEFAULT_REFRESH_BUFFER) {
                return Ok(tokens.clone());
            }
        }

        let current = { self.tokens.read().await.clone() };
        let refreshed = refresh_access_token_with_endpoint(
            &self.http,
            &self.client_id,
            &self.client_secret,
            &current,
            &self.token_endpoint,
        )
        .await?;

        {
            let mut tokens = self.tokens.write().await;
            *tokens = refreshed.clone();
        }

        self.token_store
            .save_tokens(&refreshed)
            .await
            .map_err(|err| GmailClientError::TokenStore(err.to_string()))?;

        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use tokio::sync::Mutex as TokioMutex;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingStore {
        saved: TokioMutex<Vec<OAuthTokens>>,
    }

    #[async_trait]
    impl TokenStore for RecordingStore {
        type Error = std::convert::Infallible;

        async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<(), Self::Error> {
            self.saved.lock().await.push(tokens.clone());
            Ok(())
        }
    }

    fn fresh_tokens() -> OAuthTokens {
        OAuthTokens {
            access_token: "token".into(),
            refresh_token: "refresh".into(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    fn make_client(
        server: &MockServer,
        tokens: OAuthTokens,
        store: Arc<RecordingStore>,
    ) -> GmailClient<RecordingStore> {
        GmailClient::new(
            reqwest::Client::new(),
            "me",
            "client",
            "secret",
            tokens,
            store,
        )
        .with_api_base(format!("{}/gmail/v1/users", server.uri()))
        .with_token_endpoint(format!("{}/token", server.uri()))
    }

    #[tokio::test]
    async fn refreshes_before_request_when_expiring() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new_token",
                "refresh_token": "refresh_two",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/abc"))
            .and(query_param("format", "raw"))
            .and(header("authorization", "Bearer new_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "abc",
                "labelIds": ["INBOX"],
                "raw": URL_SAFE.encode(b"Subject: hi\r\n\r\nbody"),
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = OAuthTokens {
            access_token: "old_token".into(),
            refresh_token: "refresh_one".into(),
            expires_at: Utc::now() + Duration::minutes(1),
        };
        let store = Arc::new(RecordingStore::default());
        let client = make_client(&server, tokens, store.clone());

        let message = client.get_raw_message("abc").await.expect("message loads");

        assert_eq!(message.id, "abc");
        assert_eq!(message.label_ids, vec!["INBOX"]);
        let raw = decode_raw(message.raw.as_deref().expect("raw")).expect("decodes");
        assert_eq!(raw, b"Subject: hi\r\n\r\nbody");
        let saved = store.saved.lock().await;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].access_token, "new_token");
    }

    #[tokio::test]
    async fn retries_after_unauthorized_and_uses_refreshed_token() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh_token",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/profile"))
            .and(header("authorization", "Bearer old_token"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/profile"))
            .and(header("authorization", "Bearer fresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "emailAddress": "me@example.com",
                "historyId": "42",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = OAuthTokens {
            access_token: "old_token".into(),
            refresh_token: "refresh_old".into(),
            expires_at: Utc::now() + Duration::minutes(10),
        };
        let store = Arc::new(RecordingStore::default());
        let client = make_client(&server, tokens, store.clone());

        let profile = client.get_profile().await.expect("profile loads");
        assert_eq!(profile.email_address.as_deref(), Some("me@example.com"));
        assert_eq!(profile.history_id.as_deref(), Some("42"));

        let saved = store.saved.lock().await;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].refresh_token, "refresh_old");
    }

    #[tokio::test]
    async fn returns_unauthorized_if_retry_still_fails() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh_token",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/profile"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let tokens = OAuthTokens {
            access_token: "old_token".into(),
            refresh_token: "refresh_old".into(),
            expires_at: Utc::now() + Duration::minutes(10),
        };
        let client = make_client(&server, tokens, Arc::new(RecordingStore::default()));

        let err = client
            .get_profile()
            .await
            .expect_err("should surface unauthorized");

        assert!(matches!(err, GmailClientError::Unauthorized));
        assert_eq!(err.retry_decision(), RetryDecision::Permanent);
    }

    #[tokio::test]
    async fn api_errors_keep_status_and_reason_only() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {
                    "code": 403,
                    "message": "User-rate limit exceeded for subject: secret stuff",
                    "errors": [{ "reason": "userRateLimitExceeded", "domain": "usageLimits" }],
                    "status": "PERMISSION_DENIED"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server, fresh_tokens(), Arc::new(RecordingStore::default()));

        let err = client
            .list_messages(None, None, true, Some(MAX_PAGE_SIZE))
            .await
            .expect_err("should surface 403");

        assert_eq!(err.status(), Some(403));
        assert_eq!(err.reason(), Some("userRateLimitExceeded"));
        assert_eq!(err.retry_decision(), RetryDecision::Retry);
        assert!(!err.to_string().contains("secret"));
    }

    #[tokio::test]
    async fn plain_forbidden_is_permanent() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/messages"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": { "code": 403, "errors": [{ "reason": "forbidden" }] }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server, fresh_tokens(), Arc::new(RecordingStore::default()));
        let err = client
            .insert_message(b"raw", &["SENT".to_string()])
            .await
            .expect_err("should fail");

        assert_eq!(err.retry_decision(), RetryDecision::Permanent);
        assert_eq!(err.category(), "HttpError");
    }

    #[tokio::test]
    async fn history_not_found_is_detectable() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/history"))
            .respond_with(ResponseTemplate::new(404).set_body_string("gone"))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server, fresh_tokens(), Arc::new(RecordingStore::default()));
        let err = client
            .list_history("1", None, None)
            .await
            .expect_err("should surface 404");

        assert!(err.is_not_found());
        assert_eq!(err.reason(), None);
    }

    #[tokio::test]
    async fn list_messages_builds_expected_query_params() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(query_param("q", "after:2024/01/31"))
            .and(query_param("pageToken", "token2"))
            .and(query_param("includeSpamTrash", "true"))
            .and(query_param("maxResults", "500"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{ "id": "m1", "threadId": "t1" }, { "id": "m2" }],
                "nextPageToken": "p3",
                "resultSizeEstimate": 2
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(RecordingStore::default());
        let client = make_client(&server, fresh_tokens(), store.clone());

        let response = client
            .list_messages(Some("after:2024/01/31"), Some("token2"), true, Some(500))
            .await
            .expect("list messages succeeds");

        assert_eq!(response.messages.len(), 2);
        assert_eq!(response.messages[1].thread_id, None);
        assert_eq!(response.next_page_token.as_deref(), Some("p3"));
        assert!(store.saved.lock().await.is_empty(), "tokens should not be refreshed");
    }

    #[tokio::test]
    async fn list_history_requests_message_additions() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/history"))
            .and(query_param("startHistoryId", "123"))
            .and(query_param("historyTypes", "messageAdded"))
            .and(query_param("pageToken", "p2"))
            .and(query_param("maxResults", "500"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "history": [
                    {
                        "id": "124",
                        "messagesAdded": [
                            { "message": { "id": "m2", "threadId": "t2" } }
                        ]
                    },
                    { "id": "125" }
                ],
                "historyId": "125"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server, fresh_tokens(), Arc::new(RecordingStore::default()));

        let response = client
            .list_history("123", Some("p2"), Some(500))
            .await
            .expect("list history succeeds");

        assert_eq!(response.history.len(), 2);
        assert_eq!(response.history_id.as_deref(), Some("125"));
        let added = response.history[0]
            .messages_added
            .as_ref()
            .expect("additions present");
        assert_eq!(added[0].message.id, "m2");
        assert!(response.history[1].messages_added.is_none());
    }

    #[tokio::test]
    async fn insert_sends_raw_labels_and_date_source() {
        let server = MockServer::start().await;
        let raw = b"Message-ID: <a@b>\r\n\r\nhello".to_vec();

        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(query_param("internalDateSource", "dateHeader"))
            .and(body_partial_json(json!({
                "raw": URL_SAFE.encode(&raw),
                "labelIds": ["INBOX", "Label_7"],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "new-id",
                "threadId": "t9",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server, fresh_tokens(), Arc::new(RecordingStore::default()));
        let inserted = client
            .insert_message(&raw, &["INBOX".to_string(), "Label_7".to_string()])
            .await
            .expect("insert succeeds");

        assert_eq!(inserted.id, "new-id");
    }

    #[tokio::test]
    async fn modify_and_trash_hit_message_subresources() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/messages/x1/modify"))
            .and(body_partial_json(json!({ "addLabelIds": ["SPAM"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "x1" })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/messages/x1/trash"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "x1" })))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server, fresh_tokens(), Arc::new(RecordingStore::default()));
        client
            .modify_message("x1", &["SPAM".to_string()], &[])
            .await
            .expect("modify succeeds");
        client.trash_message("x1").await.expect("trash succeeds");
    }

    #[tokio::test]
    async fn returns_decode_error_on_invalid_json() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server, fresh_tokens(), Arc::new(RecordingStore::default()));

        let err = client
            .list_messages(None, None, false, None)
            .await
            .expect_err("should surface decode error");

        assert!(matches!(err, GmailClientError::Decode(_)));
        assert_eq!(err.retry_decision(), RetryDecision::Permanent);
    }

    #[test]
    fn decode_raw_accepts_padded_and_unpadded_input() {
        let padded = URL_SAFE.encode(b"ab");
        assert!(padded.ends_with('='));
        assert_eq!(decode_raw(&padded).expect("padded"), b"ab");
        assert_eq!(
            decode_raw(padded.trim_end_matches('=')).expect("unpadded"),
            b"ab"
        );
    }
}
