pub mod client;
pub mod consent;
pub mod mailbox;
pub mod mock;
pub mod oauth;
pub mod types;

pub use client::{GmailClient, GmailClientError};
pub use consent::{ClientSecrets, ConsentError, ConsentFlow};
pub use mailbox::{
    CONTROL_HANDLE, FetchedMessage, GmailMailboxFactory, HistoryPage, IdPage, MailApi,
    MailboxFactory, Retrying,
};
pub use mock::MockMailbox;
pub use oauth::{
    DEFAULT_REFRESH_BUFFER, FileTokenStore, OAuthError, OAuthTokens, TokenFileError, TokenStore,
    exchange_code_with_endpoint, refresh_access_token,
};
pub use types::*;
