use anyhow::{Context as _, Result};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
/// Returns an error if the operation takes longer than `QUERY_TIMEOUT`.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

// ─── Rows ─────────────────────────────────────────────────────────────────────

/// A monitored mail account. Read-only input to the sync core; owned by the
/// CRUD layer.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxRow {
    pub account: String,
    /// IMAP login secret (app password / authorization code).
    #[serde(skip_serializing)]
    pub auth_code: String,
    /// Key into the configured mail-server map.
    pub server_name: String,
    /// Notification channel this mailbox forwards to.
    pub channel_id: i64,
}

/// A notification destination.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRow {
    pub id: i64,
    pub name: String,
    /// Provider kind: `pushbot`, `wecom`, or `webhook`.
    pub provider: String,
    #[serde(skip_serializing)]
    pub token: String,
    /// Optional chat/group target (provider-specific).
    pub chat_id: Option<String>,
}

/// A stored message. Identity is the (account, sender, reception_time)
/// triple — the mail source exposes no stable message ID to us.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRow {
    pub id: i64,
    /// Recipient mailbox account.
    pub account: String,
    pub sender: String,
    pub subject: String,
    /// RFC 3339 UTC, truncated to whole seconds.
    pub reception_time: String,
    pub body_text: Option<String>,
    /// False until a notification for this message is confirmed sent.
    /// Transitions false→true exactly once; never reset.
    pub delivered: bool,
}

// ─── Storage ──────────────────────────────────────────────────────────────────

/// SQLite-backed store for mailboxes, channels, and received messages.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (or create) the database under `data_dir` and ensure the schema
    /// exists.
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("mailnotifyd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. Single connection — every query must
    /// see the same memory-backed schema.
    pub async fn new_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<()> {
        // Idempotent DDL — safe to run on every startup.
        let stmts = [
            "CREATE TABLE IF NOT EXISTS mailboxes (
                account     TEXT PRIMARY KEY,
                auth_code   TEXT NOT NULL,
                server_name TEXT NOT NULL,
                channel_id  INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS channels (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                name     TEXT NOT NULL,
                provider TEXT NOT NULL,
                token    TEXT NOT NULL,
                chat_id  TEXT
            )",
            "CREATE TABLE IF NOT EXISTS messages (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                account        TEXT NOT NULL,
                sender         TEXT NOT NULL,
                subject        TEXT NOT NULL,
                reception_time TEXT NOT NULL,
                body_text      TEXT,
                delivered      INTEGER NOT NULL DEFAULT 0,
                UNIQUE(account, sender, reception_time)
            )",
            "CREATE INDEX IF NOT EXISTS idx_messages_account_delivered
                 ON messages(account, delivered)",
        ];
        for stmt in stmts {
            sqlx::query(stmt)
                .execute(pool)
                .await
                .context("failed to initialize database schema")?;
        }
        Ok(())
    }

    // ─── Messages ────────────────────────────────────────────────────────────

    /// Persist a newly fetched message with `delivered = false`.
    ///
    /// Returns `None` when a row with the same identity triple already
    /// exists (INSERT OR IGNORE) — a concurrent source got there first and
    /// that is not an error.
    pub async fn insert_message(
        &self,
        account: &str,
        sender: &str,
        subject: &str,
        reception_time: &str,
        body_text: Option<&str>,
    ) -> Result<Option<i64>> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO messages
                 (account, sender, subject, reception_time, body_text, delivered)
             VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(account)
        .bind(sender)
        .bind(subject)
        .bind(reception_time)
        .bind(body_text)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(result.last_insert_rowid()))
    }

    /// True when a message with this identity triple is already stored.
    pub async fn message_exists(
        &self,
        account: &str,
        sender: &str,
        reception_time: &str,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages
             WHERE account = ? AND sender = ? AND reception_time = ?",
        )
        .bind(account)
        .bind(sender)
        .bind(reception_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Undelivered messages for `account`, newest first — the dispatch order.
    pub async fn list_undelivered(&self, account: &str) -> Result<Vec<MessageRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM messages
                 WHERE account = ? AND delivered = 0
                 ORDER BY reception_time DESC",
            )
            .bind(account)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    /// The `limit` oldest delivered messages for `account` — prune candidates.
    pub async fn list_delivered_oldest(
        &self,
        account: &str,
        limit: i64,
    ) -> Result<Vec<MessageRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM messages
             WHERE account = ? AND delivered = 1
             ORDER BY reception_time ASC
             LIMIT ?",
        )
        .bind(account)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Flip `delivered` to true. The only message mutation in the system.
    pub async fn mark_delivered(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE messages SET delivered = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_message(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Total stored messages for `account`, delivered or not.
    pub async fn count_messages(&self, account: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE account = ?")
                .bind(account)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    /// Delivered messages only — what the retention ceiling applies to.
    pub async fn count_delivered(&self, account: &str) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE account = ? AND delivered = 1",
        )
        .bind(account)
        .fetch_one(&self.pool)
        .await?)
    }

    /// Records query for the REST layer: optional recipient and delivered
    /// filters, newest first, paginated.
    pub async fn list_messages(
        &self,
        recipient: Option<&str>,
        delivered: Option<bool>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MessageRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM messages
                 WHERE (? IS NULL OR account = ?)
                   AND (? IS NULL OR delivered = ?)
                 ORDER BY reception_time DESC
                 LIMIT ? OFFSET ?",
            )
            .bind(recipient)
            .bind(recipient)
            .bind(delivered)
            .bind(delivered)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    // ─── Mailboxes ───────────────────────────────────────────────────────────

    pub async fn list_mailboxes(&self) -> Result<Vec<MailboxRow>> {
        with_timeout(async {
            Ok(sqlx::query_as("SELECT * FROM mailboxes ORDER BY account")
                .fetch_all(&self.pool)
                .await?)
        })
        .await
    }

    pub async fn get_mailbox(&self, account: &str) -> Result<Option<MailboxRow>> {
        Ok(sqlx::query_as("SELECT * FROM mailboxes WHERE account = ?")
            .bind(account)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Create a mailbox. Fails when the account already exists.
    pub async fn create_mailbox(
        &self,
        account: &str,
        auth_code: &str,
        server_name: &str,
        channel_id: i64,
    ) -> Result<MailboxRow> {
        sqlx::query(
            "INSERT INTO mailboxes (account, auth_code, server_name, channel_id)
             VALUES (?, ?, ?, ?)",
        )
        .bind(account)
        .bind(auth_code)
        .bind(server_name)
        .bind(channel_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("mailbox '{account}' could not be created"))?;
        self.get_mailbox(account)
            .await?
            .ok_or_else(|| anyhow::anyhow!("mailbox not found after insert"))
    }

    /// Update selected mailbox fields; `None` leaves a field unchanged.
    /// Returns the updated row, or `None` when the account does not exist.
    pub async fn update_mailbox(
        &self,
        account: &str,
        auth_code: Option<&str>,
        server_name: Option<&str>,
        channel_id: Option<i64>,
    ) -> Result<Option<MailboxRow>> {
        let Some(existing) = self.get_mailbox(account).await? else {
            return Ok(None);
        };
        sqlx::query(
            "UPDATE mailboxes SET auth_code = ?, server_name = ?, channel_id = ?
             WHERE account = ?",
        )
        .bind(auth_code.unwrap_or(&existing.auth_code))
        .bind(server_name.unwrap_or(&existing.server_name))
        .bind(channel_id.unwrap_or(existing.channel_id))
        .bind(account)
        .execute(&self.pool)
        .await?;
        self.get_mailbox(account).await
    }

    /// Returns true when a row was actually removed.
    pub async fn delete_mailbox(&self, account: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM mailboxes WHERE account = ?")
            .bind(account)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ─── Channels ────────────────────────────────────────────────────────────

    pub async fn list_channels(&self) -> Result<Vec<ChannelRow>> {
        with_timeout(async {
            Ok(sqlx::query_as("SELECT * FROM channels ORDER BY id")
                .fetch_all(&self.pool)
                .await?)
        })
        .await
    }

    pub async fn get_channel(&self, id: i64) -> Result<Option<ChannelRow>> {
        Ok(sqlx::query_as("SELECT * FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn create_channel(
        &self,
        name: &str,
        provider: &str,
        token: &str,
        chat_id: Option<&str>,
    ) -> Result<ChannelRow> {
        let result = sqlx::query(
            "INSERT INTO channels (name, provider, token, chat_id) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(provider)
        .bind(token)
        .bind(chat_id)
        .execute(&self.pool)
        .await?;
        let id = result.last_insert_rowid();
        self.get_channel(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("channel not found after insert"))
    }

    /// Update selected channel fields; `None` leaves a field unchanged.
    pub async fn update_channel(
        &self,
        id: i64,
        name: Option<&str>,
        provider: Option<&str>,
        token: Option<&str>,
        chat_id: Option<&str>,
    ) -> Result<Option<ChannelRow>> {
        let Some(existing) = self.get_channel(id).await? else {
            return Ok(None);
        };
        sqlx::query(
            "UPDATE channels SET name = ?, provider = ?, token = ?, chat_id = ? WHERE id = ?",
        )
        .bind(name.unwrap_or(&existing.name))
        .bind(provider.unwrap_or(&existing.provider))
        .bind(token.unwrap_or(&existing.token))
        .bind(chat_id.or(existing.chat_id.as_deref()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get_channel(id).await
    }

    pub async fn delete_channel(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_returns_none_for_duplicate_identity() {
        let storage = Storage::new_in_memory().await.unwrap();
        let first = storage
            .insert_message("a@x", "s@y", "hi", "2026-08-30T10:00:00Z", None)
            .await
            .unwrap();
        assert!(first.is_some());

        // same triple, different subject — still the same message
        let second = storage
            .insert_message("a@x", "s@y", "hi again", "2026-08-30T10:00:00Z", None)
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(storage.count_messages("a@x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn undelivered_listed_newest_first() {
        let storage = Storage::new_in_memory().await.unwrap();
        for (i, ts) in ["2026-08-30T10:00:00Z", "2026-08-30T12:00:00Z", "2026-08-30T11:00:00Z"]
            .iter()
            .enumerate()
        {
            storage
                .insert_message("a@x", &format!("s{i}@y"), "subj", ts, None)
                .await
                .unwrap();
        }
        let rows = storage.list_undelivered("a@x").await.unwrap();
        let times: Vec<&str> = rows.iter().map(|r| r.reception_time.as_str()).collect();
        assert_eq!(
            times,
            vec![
                "2026-08-30T12:00:00Z",
                "2026-08-30T11:00:00Z",
                "2026-08-30T10:00:00Z"
            ]
        );
    }

    #[tokio::test]
    async fn mark_delivered_removes_from_undelivered_set() {
        let storage = Storage::new_in_memory().await.unwrap();
        let id = storage
            .insert_message("a@x", "s@y", "subj", "2026-08-30T10:00:00Z", None)
            .await
            .unwrap()
            .unwrap();
        storage.mark_delivered(id).await.unwrap();
        assert!(storage.list_undelivered("a@x").await.unwrap().is_empty());
        assert_eq!(storage.count_delivered("a@x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn counts_are_scoped_per_account() {
        let storage = Storage::new_in_memory().await.unwrap();
        storage
            .insert_message("a@x", "s@y", "subj", "2026-08-30T10:00:00Z", None)
            .await
            .unwrap();
        storage
            .insert_message("b@x", "s@y", "subj", "2026-08-30T10:00:00Z", None)
            .await
            .unwrap();
        assert_eq!(storage.count_messages("a@x").await.unwrap(), 1);
        assert_eq!(storage.count_messages("b@x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mailbox_and_channel_crud_roundtrip() {
        let storage = Storage::new_in_memory().await.unwrap();
        let channel = storage
            .create_channel("team", "wecom", "tok", None)
            .await
            .unwrap();
        let mailbox = storage
            .create_mailbox("a@x", "code", "example", channel.id)
            .await
            .unwrap();
        assert_eq!(mailbox.channel_id, channel.id);

        let updated = storage
            .update_mailbox("a@x", None, Some("other"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.server_name, "other");
        assert_eq!(updated.auth_code, "code");

        assert!(storage.delete_mailbox("a@x").await.unwrap());
        assert!(!storage.delete_mailbox("a@x").await.unwrap());
        assert!(storage.delete_channel(channel.id).await.unwrap());
    }

    #[tokio::test]
    async fn file_backed_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = Storage::new(dir.path()).await.unwrap();
            storage
                .insert_message("a@x", "s@y", "subj", "2026-08-30T10:00:00Z", None)
                .await
                .unwrap();
        }
        let reopened = Storage::new(dir.path()).await.unwrap();
        assert_eq!(reopened.count_messages("a@x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn records_query_filters_by_delivered() {
        let storage = Storage::new_in_memory().await.unwrap();
        let id = storage
            .insert_message("a@x", "s1@y", "one", "2026-08-30T10:00:00Z", None)
            .await
            .unwrap()
            .unwrap();
        storage
            .insert_message("a@x", "s2@y", "two", "2026-08-30T11:00:00Z", None)
            .await
            .unwrap();
        storage.mark_delivered(id).await.unwrap();

        let delivered = storage
            .list_messages(Some("a@x"), Some(true), 100, 0)
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].subject, "one");

        let all = storage.list_messages(None, None, 100, 0).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
