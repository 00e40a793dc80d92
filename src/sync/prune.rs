//! Per-mailbox retention pruning.
//!
//! The ceiling applies to delivered messages only: an undelivered message is
//! awaiting its notification and is retained indefinitely, so a mailbox with
//! a backlog may transiently hold more rows than the ceiling.

use anyhow::Result;
use tracing::info;

use crate::storage::Storage;

/// Delete the oldest delivered messages beyond `ceiling`, oldest reception
/// time first. Returns the number actually deleted.
pub async fn prune_delivered(storage: &Storage, account: &str, ceiling: i64) -> Result<u64> {
    let total = storage.count_messages(account).await?;
    if total <= ceiling {
        return Ok(0);
    }

    let delivered = storage.count_delivered(account).await?;
    let excess = delivered - ceiling;
    if excess <= 0 {
        return Ok(0);
    }

    let oldest = storage.list_delivered_oldest(account, excess).await?;
    let mut deleted = 0u64;
    for row in oldest {
        storage.delete_message(row.id).await?;
        deleted += 1;
    }
    if deleted > 0 {
        info!(account, deleted, total, "pruned delivered messages over retention ceiling");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(storage: &Storage, account: &str, hour: u32, delivered: bool) -> i64 {
        let id = storage
            .insert_message(
                account,
                &format!("s{hour}@y"),
                "subj",
                &format!("2026-08-30T{hour:02}:00:00Z"),
                None,
            )
            .await
            .unwrap()
            .unwrap();
        if delivered {
            storage.mark_delivered(id).await.unwrap();
        }
        id
    }

    #[tokio::test]
    async fn prunes_oldest_delivered_beyond_ceiling() {
        let storage = Storage::new_in_memory().await.unwrap();
        for hour in 1..=7 {
            seed(&storage, "a@x", hour, true).await;
        }

        let deleted = prune_delivered(&storage, "a@x", 5).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(storage.count_messages("a@x").await.unwrap(), 5);

        // the two oldest are gone, the five newest remain
        let remaining = storage.list_delivered_oldest("a@x", 10).await.unwrap();
        assert_eq!(remaining[0].reception_time, "2026-08-30T03:00:00Z");
    }

    #[tokio::test]
    async fn undelivered_messages_are_never_touched() {
        let storage = Storage::new_in_memory().await.unwrap();
        // 3 delivered + 4 undelivered = 7 rows, but only 3 count against the
        // ceiling, so nothing is pruned.
        for hour in 1..=3 {
            seed(&storage, "a@x", hour, true).await;
        }
        for hour in 4..=7 {
            seed(&storage, "a@x", hour, false).await;
        }

        let deleted = prune_delivered(&storage, "a@x", 5).await.unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(storage.count_messages("a@x").await.unwrap(), 7);
        assert_eq!(storage.list_undelivered("a@x").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn under_ceiling_is_a_no_op() {
        let storage = Storage::new_in_memory().await.unwrap();
        for hour in 1..=2 {
            seed(&storage, "a@x", hour, true).await;
        }
        assert_eq!(prune_delivered(&storage, "a@x", 5).await.unwrap(), 0);
        assert_eq!(storage.count_messages("a@x").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn pruning_is_scoped_per_mailbox() {
        let storage = Storage::new_in_memory().await.unwrap();
        for hour in 1..=7 {
            seed(&storage, "a@x", hour, true).await;
        }
        seed(&storage, "b@x", 1, true).await;

        prune_delivered(&storage, "a@x", 5).await.unwrap();
        assert_eq!(storage.count_messages("b@x").await.unwrap(), 1);
    }
}
