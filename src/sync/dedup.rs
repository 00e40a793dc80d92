//! Deduplication of fetched batches against the store.
//!
//! A message is "new" when its (account, sender, reception_time) triple is
//! absent from the store. The comparison uses the wire form of the timestamp
//! (RFC 3339, whole seconds) so the fetcher and the store can never disagree
//! on precision.

use std::collections::HashSet;

use anyhow::Result;

use crate::fetch::FetchedMessage;
use crate::storage::Storage;

/// Return the subset of `batch` not yet present in the store for `account`.
///
/// Read-only: never mutates the store. Entries that repeat an earlier
/// entry's identity within the same batch are dropped too — the recent
/// window from the mail source can contain duplicates.
pub async fn filter_new(
    storage: &Storage,
    account: &str,
    batch: &[FetchedMessage],
) -> Result<Vec<FetchedMessage>> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut new = Vec::new();
    for message in batch {
        let key = (message.sender.clone(), message.reception_time_wire());
        if !seen.insert(key.clone()) {
            continue;
        }
        if !storage.message_exists(account, &key.0, &key.1).await? {
            new.push(message.clone());
        }
    }
    Ok(new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn msg(sender: &str, hour: u32) -> FetchedMessage {
        FetchedMessage {
            sender: sender.into(),
            subject: "subj".into(),
            reception_time: Utc.with_ymd_and_hms(2026, 8, 30, hour, 0, 0).unwrap(),
            body: None,
        }
    }

    #[tokio::test]
    async fn filters_out_already_stored_identities() {
        let storage = Storage::new_in_memory().await.unwrap();
        let stored = msg("x@y.com", 10);
        storage
            .insert_message(
                "acct@x",
                &stored.sender,
                &stored.subject,
                &stored.reception_time_wire(),
                None,
            )
            .await
            .unwrap();

        let batch = vec![stored.clone(), msg("fresh@y.com", 11)];
        let new = filter_new(&storage, "acct@x", &batch).await.unwrap();
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].sender, "fresh@y.com");
    }

    #[tokio::test]
    async fn same_batch_twice_is_idempotent() {
        let storage = Storage::new_in_memory().await.unwrap();
        let batch = vec![msg("x@y.com", 10), msg("z@y.com", 11)];

        let first = filter_new(&storage, "acct@x", &batch).await.unwrap();
        assert_eq!(first.len(), 2);
        for m in &first {
            storage
                .insert_message("acct@x", &m.sender, &m.subject, &m.reception_time_wire(), None)
                .await
                .unwrap();
        }

        let second = filter_new(&storage, "acct@x", &batch).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn intra_batch_repeats_are_dropped() {
        let storage = Storage::new_in_memory().await.unwrap();
        let batch = vec![msg("x@y.com", 10), msg("x@y.com", 10)];
        let new = filter_new(&storage, "acct@x", &batch).await.unwrap();
        assert_eq!(new.len(), 1);
    }

    #[tokio::test]
    async fn identity_is_scoped_to_the_account() {
        let storage = Storage::new_in_memory().await.unwrap();
        let m = msg("x@y.com", 10);
        storage
            .insert_message("other@x", &m.sender, &m.subject, &m.reception_time_wire(), None)
            .await
            .unwrap();

        // same triple under a different mailbox is still new
        let new = filter_new(&storage, "acct@x", &[m]).await.unwrap();
        assert_eq!(new.len(), 1);
    }
}
