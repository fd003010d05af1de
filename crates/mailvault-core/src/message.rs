use std::io::{self, Read, Write};

use chrono::{DateTime, NaiveDate};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use mail_parser::MessageParser;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::gmail::Message;

pub const TRASH_LABEL: &str = "TRASH";
pub const SPAM_LABEL: &str = "SPAM";

/// Per-message metadata stored next to the content object. Fields are
/// declared in key order so the JSON is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    #[serde(default)]
    pub history_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    /// Milliseconds since the epoch, as a decimal string.
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub label_ids: Option<Vec<String>>,
    #[serde(default)]
    pub size_estimate: Option<u64>,
    #[serde(default)]
    pub thread_id: Option<String>,
}

impl MessageMeta {
    pub fn labels(&self) -> &[String] {
        self.label_ids.as_deref().unwrap_or_default()
    }

    /// UTC calendar date of `internal_date`, if it parses.
    pub fn internal_date_utc(&self) -> Option<NaiveDate> {
        let millis: i64 = self.internal_date.as_deref()?.trim().parse().ok()?;
        DateTime::from_timestamp_millis(millis).map(|dt| dt.date_naive())
    }
}

impl From<&Message> for MessageMeta {
    fn from(message: &Message) -> Self {
        Self {
            history_id: message.history_id.clone(),
            id: Some(message.id.clone()),
            internal_date: message.internal_date.clone(),
            label_ids: Some(message.label_ids.clone()),
            size_estimate: message.size_estimate,
            thread_id: message.thread_id.clone(),
        }
    }
}

pub fn gzip(raw: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::new(level));
    encoder.write_all(raw)?;
    encoder.finish()
}

pub fn gunzip(compressed: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    Ok(raw)
}

/// Lowercase hex SHA-256 of the uncompressed bytes.
pub fn fingerprint(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

/// The `Message-ID` header value without angle brackets.
pub fn message_id_header(raw: &[u8]) -> Option<String> {
    let parsed = MessageParser::default().parse(raw)?;
    let id = parsed
        .message_id()?
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim();
    (!id.is_empty()).then(|| id.to_string())
}
