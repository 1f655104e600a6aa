//! Identifiers for certificates uploaded to the device
//!
//! Every identifier this installer creates starts with [`CERT_ID_PREFIX`],
//! which is how cleanup recognises its own certificates. Identifiers end in
//! a millisecond timestamp taken from [`issue_instant`], which never hands
//! out the same millisecond twice within a process.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Prefix shared by every identifier this installer creates
pub const CERT_ID_PREFIX: &str = "lego-";

/// Longest identifier the device keystore accepts
pub const MAX_CERT_ID_LEN: usize = 48;

const TIMESTAMP_FORMAT: &str = "%y%m%d%H%M%S%3f";

static LAST_ISSUED_MS: AtomicI64 = AtomicI64::new(i64::MIN);

/// `now`, moved past every instant previously issued in this process
pub fn issue_instant(now: DateTime<Utc>) -> DateTime<Utc> {
    let wanted = now.timestamp_millis();
    let next = |last: i64| wanted.max(last.saturating_add(1));
    let previous = LAST_ISSUED_MS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(next(last)))
        .unwrap_or_else(|last| last);
    DateTime::from_timestamp_millis(next(previous)).unwrap_or(now)
}

/// Identifier for `domain` installed at `installed_at`
///
/// Shape: `lego-<domain label>-<yymmddHHMMSSmmm>`. The domain label is
/// shortened when needed; the timestamp is always kept whole.
pub fn derive(domain: &str, installed_at: DateTime<Utc>) -> String {
    let stamp = installed_at.format(TIMESTAMP_FORMAT).to_string();
    let budget = MAX_CERT_ID_LEN - CERT_ID_PREFIX.len() - stamp.len() - 1;

    let mut label = sanitize(domain);
    label.truncate(budget);
    let label = label.trim_matches('-');

    if label.is_empty() {
        format!("{CERT_ID_PREFIX}{stamp}")
    } else {
        format!("{CERT_ID_PREFIX}{label}-{stamp}")
    }
}

/// Reduce a domain to `[A-Za-z0-9-]`
///
/// A leading wildcard label becomes `wildcard`; dots and every other
/// character become `-`.
pub fn sanitize(domain: &str) -> String {
    let domain = domain.trim();
    let (head, rest) = match domain.strip_prefix('*') {
        Some(rest) => ("wildcard", rest),
        None => ("", domain),
    };

    let mut out = String::with_capacity(head.len() + rest.len());
    out.push_str(head);
    out.extend(rest.chars().map(|c| {
        if c.is_ascii_alphanumeric() || c == '-' {
            c
        } else {
            '-'
        }
    }));
    out
}

/// Whether `id` was created by this installer
pub fn is_managed(id: &str) -> bool {
    id.starts_with(CERT_ID_PREFIX)
}
