//! Per-mailbox synchronization & notification dispatch — the core workflow.
//!
//! One pass per mailbox: fetch a recent window, dedup against the store,
//! persist new messages undelivered, send a notification per undelivered
//! message (newest first, sequentially), mark delivered on confirmed sends
//! only, prune delivered messages over the retention ceiling.
//!
//! Failures are data: every component fault becomes an error string on the
//! mailbox's result, and `run_cycle` always yields one result per mailbox
//! attempted — a broken mailbox never aborts its siblings.

pub mod dedup;
pub mod prune;
pub mod scheduler;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::fetch::{FetchedMessage, MailFetcher};
use crate::notify::Notifier;
use crate::storage::{MailboxRow, Storage};

// ─── Result records ───────────────────────────────────────────────────────────

/// Outcome of one mailbox's pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxSyncResult {
    pub account: String,
    pub server_name: String,
    /// Messages in the fetched window (not necessarily new).
    pub total_fetched: usize,
    /// Messages persisted this pass.
    pub new_messages: usize,
    /// Notifications confirmed sent this pass.
    pub notifications_sent: usize,
    /// Delivered messages removed by retention pruning.
    pub pruned: u64,
    /// One entry per component failure. Empty means a clean pass.
    pub errors: Vec<String>,
}

impl MailboxSyncResult {
    fn new(account: &str, server_name: &str) -> Self {
        Self {
            account: account.to_string(),
            server_name: server_name.to_string(),
            total_fetched: 0,
            new_messages: 0,
            notifications_sent: 0,
            pruned: 0,
            errors: Vec::new(),
        }
    }

    fn failed(account: &str, server_name: &str, error: String) -> Self {
        let mut result = Self::new(account, server_name);
        result.errors.push(error);
        result
    }
}

/// Aggregated outcome of one full pass across all mailboxes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub results: Vec<MailboxSyncResult>,
    pub total_fetched: usize,
    pub total_new: usize,
    pub total_notifications_sent: usize,
    pub total_pruned: u64,
    /// Cycle-level failures (e.g. the mailbox list could not be loaded).
    pub errors: Vec<String>,
}

impl CycleReport {
    fn aggregate(results: Vec<MailboxSyncResult>, errors: Vec<String>) -> Self {
        Self {
            total_fetched: results.iter().map(|r| r.total_fetched).sum(),
            total_new: results.iter().map(|r| r.new_messages).sum(),
            total_notifications_sent: results.iter().map(|r| r.notifications_sent).sum(),
            total_pruned: results.iter().map(|r| r.pruned).sum(),
            results,
            errors,
        }
    }
}

// ─── SyncEngine ───────────────────────────────────────────────────────────────

/// Orchestrates the fetch → dedup → store → notify → prune workflow.
pub struct SyncEngine {
    config: Arc<DaemonConfig>,
    storage: Arc<Storage>,
    fetcher: Arc<dyn MailFetcher>,
    notifier: Arc<dyn Notifier>,
    /// Accounts with a pass currently running. Guards against a scheduled
    /// and a manual trigger (or an overrunning pass) double-processing one
    /// mailbox; distinct mailboxes run freely in parallel. std Mutex — held
    /// only for the insert/remove, never across an await.
    in_flight: Mutex<HashSet<String>>,
}

impl SyncEngine {
    pub fn new(
        config: Arc<DaemonConfig>,
        storage: Arc<Storage>,
        fetcher: Arc<dyn MailFetcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            storage,
            fetcher,
            notifier,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Run one pass over every configured mailbox, concurrently. Always
    /// returns a report with one result per mailbox attempted; a panicking
    /// or failing mailbox becomes an error entry, never a propagated fault.
    pub async fn run_cycle(self: &Arc<Self>) -> CycleReport {
        let mailboxes = match self.storage.list_mailboxes().await {
            Ok(mailboxes) => mailboxes,
            Err(e) => {
                warn!(err = %e, "could not load mailbox configurations");
                return CycleReport::aggregate(
                    Vec::new(),
                    vec![format!("failed to load mailbox configurations: {e:#}")],
                );
            }
        };

        let mut handles = Vec::with_capacity(mailboxes.len());
        for mailbox in mailboxes {
            let engine = Arc::clone(self);
            let account = mailbox.account.clone();
            let server_name = mailbox.server_name.clone();
            let handle = tokio::spawn(async move { engine.run_mailbox_guarded(&mailbox).await });
            handles.push((account, server_name, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (account, server_name, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => results.push(MailboxSyncResult::failed(
                    &account,
                    &server_name,
                    format!("sync task panicked: {e}"),
                )),
            }
        }
        CycleReport::aggregate(results, Vec::new())
    }

    /// Single-mailbox variant for the manual trigger. `Ok(None)` means no
    /// mailbox is configured for `account`.
    pub async fn run_account(self: &Arc<Self>, account: &str) -> Result<Option<MailboxSyncResult>> {
        match self.storage.get_mailbox(account).await? {
            Some(mailbox) => Ok(Some(self.run_mailbox_guarded(&mailbox).await)),
            None => Ok(None),
        }
    }

    /// Single-flight wrapper: a second concurrent pass for the same account
    /// reports "already in progress" with zero progress instead of racing
    /// the first one. The slot is released on drop, so a panic inside the
    /// pass never locks the mailbox out of future passes.
    async fn run_mailbox_guarded(&self, mailbox: &MailboxRow) -> MailboxSyncResult {
        let _guard = match InFlightGuard::acquire(self, &mailbox.account) {
            Some(guard) => guard,
            None => {
                return MailboxSyncResult::failed(
                    &mailbox.account,
                    &mailbox.server_name,
                    format!("sync already in progress for {}", mailbox.account),
                )
            }
        };
        self.run_mailbox(mailbox).await
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        // A panic while holding this lock is impossible (insert/remove only),
        // but recover from poisoning anyway rather than cascading.
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_mailbox(&self, mailbox: &MailboxRow) -> MailboxSyncResult {
        let mut result = MailboxSyncResult::new(&mailbox.account, &mailbox.server_name);
        let window = self.config.sync.fetch_window;

        // 1. Recent window, envelopes only — bodies are expensive.
        let envelopes = match self.fetcher.fetch(mailbox, false, window).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(account = %mailbox.account, err = %e, "mailbox fetch failed");
                result
                    .errors
                    .push(format!("fetch failed for {}: {e}", mailbox.account));
                return result;
            }
        };
        result.total_fetched = envelopes.len();

        // 2. Which of these are genuinely new?
        let mut new = match dedup::filter_new(&self.storage, &mailbox.account, &envelopes).await {
            Ok(new) => new,
            Err(e) => {
                result.errors.push(format!("dedup query failed: {e:#}"));
                return result;
            }
        };

        // 3. Re-fetch the window with bodies only when something is new, and
        //    match bodies back by (sender, reception time). A failed body
        //    fetch aborts the pass before anything is persisted — the
        //    identities stay unknown to the store, so the next pass
        //    re-discovers them and retries the body fetch.
        if !new.is_empty() {
            match self.fetcher.fetch(mailbox, true, window).await {
                Ok(full) => attach_bodies(&mut new, &full),
                Err(e) => {
                    warn!(account = %mailbox.account, err = %e, "body fetch failed");
                    result
                        .errors
                        .push(format!("body fetch failed for {}: {e}", mailbox.account));
                    return result;
                }
            }
        }

        // 4. Persist new messages, undelivered. A duplicate identity here
        //    means a concurrent source inserted it first — silently not new.
        for message in &new {
            match self
                .storage
                .insert_message(
                    &mailbox.account,
                    &message.sender,
                    &message.subject,
                    &message.reception_time_wire(),
                    message.body.as_deref(),
                )
                .await
            {
                Ok(Some(_)) => result.new_messages += 1,
                Ok(None) => {}
                Err(e) => result
                    .errors
                    .push(format!("failed to store message from {}: {e:#}", message.sender)),
            }
        }

        // 5–6. Dispatch every undelivered message (leftovers from failed
        //      cycles included), newest first, sequentially.
        match self.storage.list_undelivered(&mailbox.account).await {
            Ok(undelivered) if !undelivered.is_empty() => {
                self.dispatch_undelivered(mailbox, &undelivered, &mut result)
                    .await;
            }
            Ok(_) => {}
            Err(e) => result
                .errors
                .push(format!("undelivered query failed: {e:#}")),
        }

        // 7. Retention.
        match prune::prune_delivered(
            &self.storage,
            &mailbox.account,
            self.config.sync.retention_ceiling,
        )
        .await
        {
            Ok(n) => result.pruned = n,
            Err(e) => result
                .errors
                .push(format!("prune failed for {}: {e:#}", mailbox.account)),
        }

        info!(
            account = %mailbox.account,
            fetched = result.total_fetched,
            new = result.new_messages,
            sent = result.notifications_sent,
            pruned = result.pruned,
            errors = result.errors.len(),
            "mailbox pass complete"
        );
        result
    }

    async fn dispatch_undelivered(
        &self,
        mailbox: &MailboxRow,
        undelivered: &[crate::storage::MessageRow],
        result: &mut MailboxSyncResult,
    ) {
        let channel = match self.storage.get_channel(mailbox.channel_id).await {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                result.errors.push(format!(
                    "no notification channel {} configured for {}",
                    mailbox.channel_id, mailbox.account
                ));
                return;
            }
            Err(e) => {
                result.errors.push(format!("channel lookup failed: {e:#}"));
                return;
            }
        };

        let pacing = Duration::from_millis(self.config.sync.send_pacing_ms);
        for (i, message) in undelivered.iter().enumerate() {
            match self.notifier.send(&channel, message).await {
                Ok(()) => {
                    // Mark immediately: a crash later in the batch must not
                    // cause this message to be resent.
                    match self.storage.mark_delivered(message.id).await {
                        Ok(()) => result.notifications_sent += 1,
                        Err(e) => result.errors.push(format!(
                            "sent but could not mark message {} delivered: {e:#}",
                            message.id
                        )),
                    }
                }
                Err(e) => {
                    // Message stays undelivered; the next pass retries it.
                    result.errors.push(format!(
                        "notification for '{}' -> {} failed: {e}",
                        message.sender, mailbox.account
                    ));
                }
            }
            if i + 1 < undelivered.len() && !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }
        }
    }
}

/// Holds one account's single-flight slot; releases it in `Drop` so the
/// slot comes back even when the pass panics and unwinds.
struct InFlightGuard<'a> {
    engine: &'a SyncEngine,
    account: String,
}

impl<'a> InFlightGuard<'a> {
    /// `None` when a pass for `account` is already running.
    fn acquire(engine: &'a SyncEngine, account: &str) -> Option<Self> {
        if !engine.lock_in_flight().insert(account.to_string()) {
            return None;
        }
        Some(Self {
            engine,
            account: account.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.engine.lock_in_flight().remove(&self.account);
    }
}

/// Copy bodies from the body-bearing re-fetch onto the new envelopes,
/// matching by (sender, reception time). An envelope with no counterpart is
/// kept body-less — it renders with the explicit placeholder.
fn attach_bodies(new: &mut [FetchedMessage], full: &[FetchedMessage]) {
    for message in new.iter_mut() {
        if let Some(counterpart) = full.iter().find(|f| {
            f.sender == message.sender
                && f.reception_time_wire() == message.reception_time_wire()
        }) {
            message.body = counterpart.body.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn msg(sender: &str, hour: u32, body: Option<&str>) -> FetchedMessage {
        FetchedMessage {
            sender: sender.into(),
            subject: "subj".into(),
            reception_time: Utc.with_ymd_and_hms(2026, 8, 30, hour, 0, 0).unwrap(),
            body: body.map(String::from),
        }
    }

    #[test]
    fn attach_bodies_matches_on_sender_and_time() {
        let mut new = vec![msg("a@y", 10, None), msg("b@y", 11, None)];
        let full = vec![
            msg("b@y", 11, Some("body b")),
            msg("a@y", 10, Some("body a")),
            msg("c@y", 12, Some("unrelated")),
        ];
        attach_bodies(&mut new, &full);
        assert_eq!(new[0].body.as_deref(), Some("body a"));
        assert_eq!(new[1].body.as_deref(), Some("body b"));
    }

    #[test]
    fn attach_bodies_leaves_unmatched_envelope_bodyless() {
        let mut new = vec![msg("a@y", 10, None)];
        let full = vec![msg("a@y", 11, Some("different time"))];
        attach_bodies(&mut new, &full);
        assert!(new[0].body.is_none());
    }

    #[test]
    fn report_totals_sum_over_results() {
        let mut one = MailboxSyncResult::new("a@x", "example");
        one.total_fetched = 5;
        one.new_messages = 2;
        one.notifications_sent = 2;
        one.pruned = 1;
        let two = MailboxSyncResult::failed("b@x", "example", "fetch failed".into());

        let report = CycleReport::aggregate(vec![one, two], Vec::new());
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.total_fetched, 5);
        assert_eq!(report.total_new, 2);
        assert_eq!(report.total_notifications_sent, 2);
        assert_eq!(report.total_pruned, 1);
        assert_eq!(report.results[1].errors.len(), 1);
    }
}
