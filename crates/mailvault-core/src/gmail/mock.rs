use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};

use super::client::GmailClientError;
use super::mailbox::{FetchedMessage, HistoryPage, IdPage, MailApi, MailboxFactory};
use super::types::Profile;
use crate::message::{MessageMeta, TRASH_LABEL, message_id_header};

const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertedMessage {
    pub id: String,
    pub raw: Vec<u8>,
    pub label_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelChange {
    pub id: String,
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    raw: Vec<u8>,
    label_ids: Vec<String>,
    internal_date_ms: i64,
    history_id: u64,
}

#[derive(Debug, Clone, Copy)]
struct FetchFailure {
    status: u16,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct MockState {
    email: Option<String>,
    page_size: Option<usize>,
    messages: Vec<StoredMessage>,
    additions: Vec<(u64, String)>,
    history_id: u64,
    oldest_history_id: u64,
    fetch_failures: HashMap<String, FetchFailure>,
    reject_insert_labels: bool,
    inserted: Vec<InsertedMessage>,
    label_changes: Vec<LabelChange>,
    trashed: Vec<String>,
    opened_workers: Vec<usize>,
}

impl MockState {
    fn next_history_id(&mut self) -> u64 {
        self.history_id += 1;
        self.history_id
    }

    fn page_size(&self) -> usize {
        self.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1)
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut StoredMessage, GmailClientError> {
        self.messages
            .iter_mut()
            .find(|message| message.id == id)
            .ok_or_else(not_found)
    }
}

/// In-memory mailbox with Gmail's paging and history semantics. Inserting a
/// second message with an already present `Message-ID` fails with a 409 so
/// double inserts show up as errors.
#[derive(Debug, Default, Clone)]
pub struct MockMailbox {
    state: Arc<Mutex<MockState>>,
    fetch_calls: Arc<AtomicUsize>,
    insert_calls: Arc<AtomicUsize>,
}

impl MockMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_email(email: impl Into<String>) -> Self {
        let mailbox = Self::default();
        mailbox.lock().email = Some(email.into());
        mailbox
    }

    pub fn set_page_size(&self, size: usize) {
        self.lock().page_size = Some(size);
    }

    /// Adds a message as if it had just arrived, recording a history entry.
    pub fn add_message(&self, id: &str, raw: &[u8], labels: &[&str], internal_date_ms: i64) {
        let mut state = self.lock();
        let history_id = state.next_history_id();
        state.messages.push(StoredMessage {
            id: id.to_string(),
            raw: raw.to_vec(),
            label_ids: labels.iter().map(|label| label.to_string()).collect(),
            internal_date_ms,
            history_id,
        });
        state.additions.push((history_id, id.to_string()));
    }

    /// Drops change-log entries so any cursor before the current one is
    /// rejected with a 404.
    pub fn expire_history(&self) {
        let mut state = self.lock();
        state.oldest_history_id = state.history_id;
        state.additions.clear();
    }

    pub fn fail_fetch(&self, id: &str, status: u16) {
        self.lock().fetch_failures.insert(
            id.to_string(),
            FetchFailure {
                status,
                remaining: None,
            },
        );
    }

    /// Fails the next `times` fetches of `id`, then serves it normally.
    pub fn fail_fetch_times(&self, id: &str, status: u16, times: usize) {
        self.lock().fetch_failures.insert(
            id.to_string(),
            FetchFailure {
                status,
                remaining: Some(times),
            },
        );
    }

    /// Rejects inserts that carry label ids with a 400.
    pub fn reject_insert_labels(&self) {
        self.lock().reject_insert_labels = true;
    }

    pub fn history_id(&self) -> u64 {
        self.lock().history_id
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn inserted(&self) -> Vec<InsertedMessage> {
        self.lock().inserted.clone()
    }

    pub fn label_changes(&self) -> Vec<LabelChange> {
        self.lock().label_changes.clone()
    }

    pub fn trashed(&self) -> Vec<String> {
        self.lock().trashed.clone()
    }

    pub fn opened_workers(&self) -> Vec<usize> {
        self.lock().opened_workers.clone()
    }

    pub fn labels_of(&self, id: &str) -> Option<Vec<String>> {
        self.lock()
            .messages
            .iter()
            .find(|message| message.id == id)
            .map(|message| message.label_ids.clone())
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of insert attempts, including rejected ones.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("lock mailbox state")
    }
}

fn not_found() -> GmailClientError {
    GmailClientError::Api {
        status: 404,
        reason: Some("notFound".to_string()),
    }
}

fn bad_request(reason: &str) -> GmailClientError {
    GmailClientError::Api {
        status: 400,
        reason: Some(reason.to_string()),
    }
}

fn parse_offset(page_token: Option<&str>) -> Result<usize, GmailClientError> {
    match page_token {
        None => Ok(0),
        Some(token) => token.parse().map_err(|_| bad_request("invalidPageToken")),
    }
}

/// Supports the `after:YYYY/MM/DD` form the backup engine sends. Anything
/// else matches every message.
fn after_cutoff_ms(query: Option<&str>) -> Result<Option<i64>, GmailClientError> {
    let Some(date) = query.and_then(|q| q.trim().strip_prefix("after:")) else {
        return Ok(None);
    };
    let day = NaiveDate::parse_from_str(date, "%Y/%m/%d")
        .map_err(|_| bad_request("invalidQuery"))?;
    Ok(Some(
        day.and_time(NaiveTime::MIN).and_utc().timestamp_millis(),
    ))
}

#[async_trait]
impl MailApi for MockMailbox {
    async fn profile(&self) -> Result<Profile, GmailClientError> {
        let state = self.lock();
        Ok(Profile {
            email_address: state.email.clone(),
            history_id: Some(state.history_id.to_string()),
            messages_total: Some(state.messages.len() as u64),
            threads_total: None,
        })
    }

    async fn list_ids(
        &self,
        query: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<IdPage, GmailClientError> {
        let cutoff = after_cutoff_ms(query)?;
        let offset = parse_offset(page_token)?;
        let state = self.lock();

        // Newest first, like the real listing.
        let matching: Vec<&StoredMessage> = state
            .messages
            .iter()
            .rev()
            .filter(|message| cutoff.is_none_or(|ms| message.internal_date_ms >= ms))
            .collect();
        let end = (offset + state.page_size()).min(matching.len());
        let ids = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|message| message.id.clone())
            .collect();

        Ok(IdPage {
            ids,
            next_page_token: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn history_added(
        &self,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, GmailClientError> {
        let start: u64 = start_history_id
            .trim()
            .parse()
            .map_err(|_| bad_request("invalidArgument"))?;
        let offset = parse_offset(page_token)?;
        let state = self.lock();
        if start < state.oldest_history_id {
            return Err(not_found());
        }

        let entries: Vec<&(u64, String)> = state
            .additions
            .iter()
            .filter(|(history_id, _)| *history_id > start)
            .collect();
        let end = (offset + state.page_size()).min(entries.len());
        let mut ids: Vec<String> = Vec::new();
        for (_, id) in entries.get(offset..end).unwrap_or_default() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }

        let more = end < entries.len();
        let history_id = if more {
            entries.get(end.saturating_sub(1)).map(|(id, _)| id.to_string())
        } else {
            Some(state.history_id.to_string())
        };
        Ok(HistoryPage {
            ids,
            next_page_token: more.then(|| end.to_string()),
            history_id,
        })
    }

    async fn fetch_raw(&self, id: &str) -> Result<FetchedMessage, GmailClientError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();

        if let Some(failure) = state.fetch_failures.get_mut(id) {
            let status = failure.status;
            match failure.remaining {
                None => return Err(GmailClientError::Api { status, reason: None }),
                Some(0) => {}
                Some(left) => {
                    failure.remaining = Some(left - 1);
                    return Err(GmailClientError::Api { status, reason: None });
                }
            }
        }

        let message = state.find_mut(id)?;
        Ok(FetchedMessage {
            raw: message.raw.clone(),
            meta: MessageMeta {
                history_id: Some(message.history_id.to_string()),
                id: Some(message.id.clone()),
                internal_date: Some(message.internal_date_ms.to_string()),
                label_ids: Some(message.label_ids.clone()),
                size_estimate: Some(message.raw.len() as u64),
                thread_id: Some(format!("thread-{}", message.id)),
            },
        })
    }

    async fn find_by_message_id(&self, header: &str) -> Result<Option<String>, GmailClientError> {
        let state = self.lock();
        Ok(state
            .messages
            .iter()
            .find(|message| message_id_header(&message.raw).as_deref() == Some(header))
            .map(|message| message.id.clone()))
    }

    async fn insert_raw(
        &self,
        raw: &[u8],
        label_ids: &[String],
    ) -> Result<String, GmailClientError> {
        let call = self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.reject_insert_labels && !label_ids.is_empty() {
            return Err(bad_request("invalidArgument"));
        }
        if let Some(header) = message_id_header(raw) {
            let duplicate = state
                .messages
                .iter()
                .any(|message| message_id_header(&message.raw).as_deref() == Some(header.as_str()));
            if duplicate {
                return Err(GmailClientError::Api {
                    status: 409,
                    reason: Some("duplicate".to_string()),
                });
            }
        }

        let id = format!("inserted-{}", call + 1);
        let history_id = state.next_history_id();
        state.messages.push(StoredMessage {
            id: id.clone(),
            raw: raw.to_vec(),
            label_ids: label_ids.to_vec(),
            internal_date_ms: 0,
            history_id,
        });
        state.additions.push((history_id, id.clone()));
        state.inserted.push(InsertedMessage {
            id: id.clone(),
            raw: raw.to_vec(),
            label_ids: label_ids.to_vec(),
        });
        Ok(id)
    }

    async fn modify_labels(
        &self,
        id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), GmailClientError> {
        let mut state = self.lock();
        let message = state.find_mut(id)?;
        message.label_ids.retain(|label| !remove.contains(label));
        for label in add {
            if !message.label_ids.contains(label) {
                message.label_ids.push(label.clone());
            }
        }
        state.label_changes.push(LabelChange {
            id: id.to_string(),
            add: add.to_vec(),
            remove: remove.to_vec(),
        });
        Ok(())
    }

    async fn trash(&self, id: &str) -> Result<(), GmailClientError> {
        let mut state = self.lock();
        let message = state.find_mut(id)?;
        if !message.label_ids.iter().any(|label| label == TRASH_LABEL) {
            message.label_ids.push(TRASH_LABEL.to_string());
        }
        state.trashed.push(id.to_string());
        Ok(())
    }
}

impl MailboxFactory for MockMailbox {
    type Mailbox = MockMailbox;

    fn open(&self, worker: usize) -> Result<Self::Mailbox, GmailClientError> {
        self.lock().opened_workers.push(worker);
        Ok(self.clone())
    }
}
