use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Config;
use crate::gmail::client::{GmailClient, GmailClientError, MAX_PAGE_SIZE, decode_raw};
use crate::gmail::oauth::{FileTokenStore, OAuthTokens, TokenFileError, TokenStore};
use crate::gmail::types::Profile;
use crate::message::MessageMeta;
use crate::retry::RetryPolicy;

const USER_ID: &str = "me";

/// Handle index for listing and profile calls made outside the worker pool.
pub const CONTROL_HANDLE: usize = usize::MAX;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdPage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryPage {
    /// Ids added in this page, first occurrence order, without duplicates.
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
    /// Cursor to resume from once this page has been handled.
    pub history_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub raw: Vec<u8>,
    pub meta: MessageMeta,
}

/// What the sync engines need from a mailbox.
#[async_trait]
pub trait MailApi: Send + Sync {
    async fn profile(&self) -> Result<Profile, GmailClientError>;

    /// One page of message ids, spam and trash included.
    async fn list_ids(
        &self,
        query: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<IdPage, GmailClientError>;

    /// One page of ids added since `start_history_id`. A 404 means the cursor
    /// is too old.
    async fn history_added(
        &self,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, GmailClientError>;

    async fn fetch_raw(&self, id: &str) -> Result<FetchedMessage, GmailClientError>;

    /// Id of a message whose `Message-ID` header equals `header`, if any.
    async fn find_by_message_id(&self, header: &str) -> Result<Option<String>, GmailClientError>;

    /// Inserts raw bytes and returns the new message id.
    async fn insert_raw(&self, raw: &[u8], label_ids: &[String])
    -> Result<String, GmailClientError>;

    async fn modify_labels(
        &self,
        id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), GmailClientError>;

    async fn trash(&self, id: &str) -> Result<(), GmailClientError>;
}

/// Hands out one independent mailbox handle per worker.
pub trait MailboxFactory: Send + Sync + 'static {
    type Mailbox: MailApi + 'static;

    fn open(&self, worker: usize) -> Result<Self::Mailbox, GmailClientError>;
}

#[async_trait]
impl<S> MailApi for GmailClient<S>
where
    S: TokenStore + 'static,
{
    async fn profile(&self) -> Result<Profile, GmailClientError> {
        self.get_profile().await
    }

    async fn list_ids(
        &self,
        query: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<IdPage, GmailClientError> {
        let response = self
            .list_messages(query, page_token, true, Some(MAX_PAGE_SIZE))
            .await?;
        Ok(IdPage {
            ids: response.messages.into_iter().map(|m| m.id).collect(),
            next_page_token: response.next_page_token,
        })
    }

    async fn history_added(
        &self,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, GmailClientError> {
        let response = self
            .list_history(start_history_id, page_token, Some(MAX_PAGE_SIZE))
            .await?;

        // Mid-listing, resume from the last record seen rather than the
        // mailbox's current cursor, which would skip the remaining pages.
        let last_record = response.history.last().map(|record| record.id.clone());
        let history_id = match response.next_page_token {
            Some(_) => last_record,
            None => response.history_id.or(last_record),
        };

        let mut seen = HashSet::new();
        let ids = response
            .history
            .into_iter()
            .flat_map(|record| record.messages_added.unwrap_or_default())
            .map(|change| change.message.id)
            .filter(|id| seen.insert(id.clone()))
            .collect();

        Ok(HistoryPage {
            ids,
            next_page_token: response.next_page_token,
            history_id,
        })
    }

    async fn fetch_raw(&self, id: &str) -> Result<FetchedMessage, GmailClientError> {
        let message = self.get_raw_message(id).await?;
        let encoded = message
            .raw
            .as_deref()
            .ok_or_else(|| GmailClientError::MissingRaw(id.to_string()))?;
        let raw = decode_raw(encoded)?;
        Ok(FetchedMessage {
            meta: MessageMeta::from(&message),
            raw,
        })
    }

    async fn find_by_message_id(&self, header: &str) -> Result<Option<String>, GmailClientError> {
        let query = format!("rfc822msgid:{header}");
        let response = self.list_messages(Some(&query), None, true, Some(1)).await?;
        Ok(response.messages.into_iter().next().map(|m| m.id))
    }

    async fn insert_raw(
        &self,
        raw: &[u8],
        label_ids: &[String],
    ) -> Result<String, GmailClientError> {
        Ok(self.insert_message(raw, label_ids).await?.id)
    }

    async fn modify_labels(
        &self,
        id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), GmailClientError> {
        self.modify_message(id, add, remove).await.map(|_| ())
    }

    async fn trash(&self, id: &str) -> Result<(), GmailClientError> {
        self.trash_message(id).await.map(|_| ())
    }
}

/// Applies a [`RetryPolicy`] to every call of the wrapped mailbox.
pub struct Retrying<M> {
    inner: M,
    policy: RetryPolicy,
}

impl<M: MailApi> Retrying<M> {
    pub fn new(inner: M, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }
}

#[async_trait]
impl<M: MailApi> MailApi for Retrying<M> {
    async fn profile(&self) -> Result<Profile, GmailClientError> {
        self.policy.run("profile", || self.inner.profile()).await
    }

    async fn list_ids(
        &self,
        query: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<IdPage, GmailClientError> {
        self.policy
            .run("list_ids", || self.inner.list_ids(query, page_token))
            .await
    }

    async fn history_added(
        &self,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, GmailClientError> {
        self.policy
            .run("history_added", || {
                self.inner.history_added(start_history_id, page_token)
            })
            .await
    }

    async fn fetch_raw(&self, id: &str) -> Result<FetchedMessage, GmailClientError> {
        self.policy.run("fetch_raw", || self.inner.fetch_raw(id)).await
    }

    async fn find_by_message_id(&self, header: &str) -> Result<Option<String>, GmailClientError> {
        self.policy
            .run("find_by_message_id", || self.inner.find_by_message_id(header))
            .await
    }

    async fn insert_raw(
        &self,
        raw: &[u8],
        label_ids: &[String],
    ) -> Result<String, GmailClientError> {
        self.policy
            .run("insert_raw", || self.inner.insert_raw(raw, label_ids))
            .await
    }

    async fn modify_labels(
        &self,
        id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), GmailClientError> {
        self.policy
            .run("modify_labels", || self.inner.modify_labels(id, add, remove))
            .await
    }

    async fn trash(&self, id: &str) -> Result<(), GmailClientError> {
        self.policy.run("trash", || self.inner.trash(id)).await
    }
}

/// Builds HTTP-backed Gmail clients that share one token file.
pub struct GmailMailboxFactory {
    client_id: String,
    client_secret: String,
    api_base: Option<String>,
    token_endpoint: Option<String>,
    tokens: OAuthTokens,
    token_store: Arc<FileTokenStore>,
}

impl GmailMailboxFactory {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        tokens: OAuthTokens,
        token_store: Arc<FileTokenStore>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            api_base: None,
            token_endpoint: None,
            tokens,
            token_store,
        }
    }

    /// Reads the token file named by `config` and keeps its endpoints.
    pub async fn from_config(config: &Config) -> Result<Self, TokenFileError> {
        let store = Arc::new(FileTokenStore::new(config.token_path()));
        let tokens = store.load().await?;
        let mut factory = Self::new(
            config.gmail.client_id.clone(),
            config.gmail.client_secret.clone(),
            tokens,
            store,
        );
        factory.api_base = config.gmail.api_base.clone();
        factory.token_endpoint = config.gmail.token_endpoint.clone();
        Ok(factory)
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    pub fn with_token_endpoint(mut self, token_endpoint: impl Into<String>) -> Self {
        self.token_endpoint = Some(token_endpoint.into());
        self
    }
}

impl MailboxFactory for GmailMailboxFactory {
    type Mailbox = GmailClient<FileTokenStore>;

    fn open(&self, _worker: usize) -> Result<Self::Mailbox, GmailClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let mut client = GmailClient::new(
            http,
            USER_ID,
            self.client_id.clone(),
            self.client_secret.clone(),
            self.tokens.clone(),
            self.token_store.clone(),
        );
        if let Some(base) = &self.api_base {
            client = client.with_api_base(base.clone());
        }
        if let Some(endpoint) = &self.token_endpoint {
            client = client.with_token_endpoint(endpoint.clone());
        }
        Ok(client)
    }
}
