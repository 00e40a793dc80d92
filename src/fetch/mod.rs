//! Mail-source collaborator boundary.
//!
//! The sync core only sees the [`MailFetcher`] trait; the real IMAP client
//! lives in [`imap`]. Tests substitute their own fetcher.

pub mod imap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use thiserror::Error;

use crate::storage::MailboxRow;

// ─── FetchedMessage ───────────────────────────────────────────────────────────

/// One raw message pulled from a mailbox.
///
/// `reception_time` is always truncated to whole seconds — sub-second digits
/// differ between mail servers and our store, and the (sender, time) pair is
/// part of the message identity.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub sender: String,
    pub subject: String,
    pub reception_time: DateTime<Utc>,
    /// Present only when the fetch asked for bodies.
    pub body: Option<String>,
}

impl FetchedMessage {
    /// Canonical stored form of the reception time: RFC 3339 UTC, whole
    /// seconds (`2026-08-30T10:00:00Z`). Dedup compares this exact string.
    pub fn reception_time_wire(&self) -> String {
        self.reception_time
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Truncate a timestamp to whole seconds in UTC.
pub fn truncate_to_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.timestamp(), 0).single().unwrap_or(ts)
}

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Mailbox fetch failures. All of these abort the mailbox's cycle early with
/// a partial result; other mailboxes are unaffected.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("connection to {0} failed: {1}")]
    Connect(String, String),
    #[error("authentication failed for {0}")]
    Auth(String),
    #[error("mail protocol error: {0}")]
    Protocol(String),
}

// ─── MailFetcher ──────────────────────────────────────────────────────────────

/// The mail-source collaborator.
///
/// Returns at most `limit` most-recent messages; ordering is not guaranteed,
/// callers re-sort where it matters. Body retrieval is expensive, so
/// `with_body` is only set for confirmed-new messages.
#[async_trait]
pub trait MailFetcher: Send + Sync {
    async fn fetch(
        &self,
        mailbox: &MailboxRow,
        with_body: bool,
        limit: usize,
    ) -> Result<Vec<FetchedMessage>, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_time_is_whole_seconds_utc() {
        let ts = Utc.with_ymd_and_hms(2026, 8, 30, 10, 15, 42).unwrap()
            + chrono::Duration::milliseconds(337);
        let msg = FetchedMessage {
            sender: "s@y".into(),
            subject: "subj".into(),
            reception_time: truncate_to_second(ts),
            body: None,
        };
        assert_eq!(msg.reception_time_wire(), "2026-08-30T10:15:42Z");
    }
}
