use std::sync::LazyLock;

use regex::Regex;

pub const DEFAULT_PREFIX: &str = "gmail-backup";

static UNSAFE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9._-]+").expect("valid regex"));
static DASH_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-{2,}").expect("valid regex"));

/// Derives a per-account storage prefix (`gmail-backup/<slug>`) from an
/// email address, so several mailboxes can share one bucket.
pub fn prefix_from_email(email: &str) -> String {
    let lowered = email.trim().to_lowercase().replace('@', "-at-");
    let replaced = UNSAFE_RUN.replace_all(&lowered, "-");
    let collapsed = DASH_RUN.replace_all(&replaced, "-");
    let slug = collapsed.trim_matches('-');
    let slug = if slug.is_empty() { "gmail" } else { slug };
    format!("{DEFAULT_PREFIX}/{slug}")
}
