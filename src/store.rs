use std::collections::HashMap;

use futures_util::TryStreamExt;
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::StoreError;
use crate::event::StatEvent;
use crate::gate::{self, Verdict};

/// Rows per committed batch in [`StatStore::bulk_log`].
pub const BATCH_LIMIT: usize = 500;

/// Outcome of a live-event admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Logged,
    /// An event with this `message_id` already exists in the chat.
    DuplicateMessage,
    /// Rejected by the per-user 60-second cooldown.
    Cooldown,
    /// Rejected as earlier than the chat's global watermark.
    OutOfOrder,
}

/// Flat event row as written to the `events` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRow {
    pub message_id: i64,
    pub user_id: String,
    pub percentage: i64,
    pub timestamp: i64,
}

impl EventRow {
    pub fn from_event(ev: &StatEvent) -> Self {
        Self {
            message_id: ev.message_id,
            user_id: ev.user_id.to_string(),
            percentage: ev.percentage as i64,
            timestamp: ev.timestamp,
        }
    }
}

/// Per-(chat, user) profile snapshot for upserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRow {
    pub user_id: String,
    pub username: String,
    pub name: String,
    pub last_update: i64,
}

impl ProfileRow {
    pub fn from_event(ev: &StatEvent) -> Self {
        Self {
            user_id: ev.user_id.to_string(),
            username: ev.username.clone(),
            name: ev.name.clone(),
            last_update: ev.timestamp,
        }
    }
}

/// Durable per-chat event log, user profile cache, and watermarks, backed by
/// sqlite. All timestamps are whole seconds since epoch; 0 means "never".
#[derive(Clone)]
pub struct StatStore {
    pool: SqlitePool,
}

impl StatStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chats (
                chat_id TEXT PRIMARY KEY,
                last_update INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                chat_id TEXT NOT NULL,
                message_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                percentage INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                PRIMARY KEY (chat_id, message_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                chat_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                username TEXT NOT NULL DEFAULT '',
                name TEXT NOT NULL DEFAULT '',
                last_update INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (chat_id, user_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn chat_exists(&self, chat_id: &str) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM chats WHERE chat_id=?")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Creates the chat record if absent; the watermark starts at 0.
    pub async fn ensure_chat(&self, chat_id: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_chat(&mut conn, chat_id).await?;
        Ok(())
    }

    /// Global watermark for the chat, or 0 when the chat is unknown.
    pub async fn get_last_update(&self, chat_id: &str) -> Result<i64, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT last_update FROM chats WHERE chat_id=?")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(ts,)| ts).unwrap_or(0))
    }

    /// Sets the chat's global watermark, creating the chat if absent.
    /// Callers are responsible for only ever advancing it.
    pub async fn set_last_update(&self, chat_id: &str, ts: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO chats (chat_id, last_update) VALUES (?, ?)
             ON CONFLICT(chat_id) DO UPDATE SET last_update=excluded.last_update",
        )
        .bind(chat_id)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Per-user watermark, or 0 when the user has no accepted events.
    pub async fn get_user_last_update(&self, chat_id: &str, user_id: &str) -> Result<i64, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_update FROM users WHERE chat_id=? AND user_id=?")
                .bind(chat_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(ts,)| ts).unwrap_or(0))
    }

    /// Live-event admission: watermark reads, gate verdict, event insert,
    /// profile upsert, and watermark advance all run in one transaction, so
    /// two concurrent events for the same user cannot both pass the gate.
    ///
    /// A stale watermark read across separate processes (separate database
    /// files) can still double count; that risk is accepted.
    pub async fn admit_live(&self, chat_id: &str, ev: &StatEvent) -> Result<Admission, StoreError> {
        let user_key = ev.user_id.to_string();
        let mut tx = self.pool.begin().await?;

        let user_w: Option<(i64,)> =
            sqlx::query_as("SELECT last_update FROM users WHERE chat_id=? AND user_id=?")
                .bind(chat_id)
                .bind(&user_key)
                .fetch_optional(&mut *tx)
                .await?;
        let chat_w: Option<(i64,)> = sqlx::query_as("SELECT last_update FROM chats WHERE chat_id=?")
            .bind(chat_id)
            .fetch_optional(&mut *tx)
            .await?;

        let user_w = user_w.map(|(ts,)| ts).unwrap_or(0);
        let chat_w = chat_w.map(|(ts,)| ts).unwrap_or(0);

        match gate::check(user_w, chat_w, ev.timestamp) {
            Verdict::Cooldown => {
                tx.rollback().await?;
                tracing::debug!("skipping message from {user_key} in chat {chat_id}: rate limited");
                return Ok(Admission::Cooldown);
            }
            Verdict::OutOfOrder => {
                tx.rollback().await?;
                tracing::debug!("skipping message from {user_key} in chat {chat_id}: outdated timestamp");
                return Ok(Admission::OutOfOrder);
            }
            Verdict::Accept => {}
        }

        insert_chat(&mut tx, chat_id).await?;
        if !insert_event(&mut tx, chat_id, &EventRow::from_event(ev)).await? {
            tx.rollback().await?;
            tracing::debug!("skipping message {} in chat {chat_id}: already logged", ev.message_id);
            return Ok(Admission::DuplicateMessage);
        }
        upsert_profile(&mut tx, chat_id, &ProfileRow::from_event(ev)).await?;
        sqlx::query("UPDATE chats SET last_update=? WHERE chat_id=?")
            .bind(ev.timestamp)
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            "logged message for user {user_key} in chat {chat_id} with percentage {}",
            ev.percentage
        );
        Ok(Admission::Logged)
    }

    /// Appends one event and upserts the sender's profile, creating the chat
    /// if absent. Returns `false` when the `message_id` already exists (the
    /// event is skipped, the profile still refreshes).
    pub async fn log_event(&self, chat_id: &str, ev: &StatEvent) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_chat(&mut tx, chat_id).await?;
        let inserted = insert_event(&mut tx, chat_id, &EventRow::from_event(ev)).await?;
        upsert_profile(&mut tx, chat_id, &ProfileRow::from_event(ev)).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// Writes events and profiles in batches of [`BATCH_LIMIT`] rows, each
    /// committed independently. On failure the remaining batches are
    /// abandoned and the error reports how many committed.
    pub async fn bulk_log(
        &self,
        chat_id: &str,
        events: &[EventRow],
        profiles: &[ProfileRow],
    ) -> Result<usize, StoreError> {
        enum Op<'a> {
            Event(&'a EventRow),
            Profile(&'a ProfileRow),
        }

        self.ensure_chat(chat_id).await?;

        let ops: Vec<Op> = events
            .iter()
            .map(Op::Event)
            .chain(profiles.iter().map(Op::Profile))
            .collect();
        let total = ops.len().div_ceil(BATCH_LIMIT);

        for (committed, chunk) in ops.chunks(BATCH_LIMIT).enumerate() {
            let partial = |source: sqlx::Error| StoreError::BulkWrite {
                committed,
                total,
                source,
            };

            let mut tx = self.pool.begin().await.map_err(partial)?;
            for op in chunk {
                match op {
                    Op::Event(row) => insert_event(&mut tx, chat_id, row).await.map(|_| ()),
                    Op::Profile(row) => upsert_profile(&mut tx, chat_id, row).await,
                }
                .map_err(partial)?;
            }
            tx.commit().await.map_err(partial)?;
        }

        tracing::info!(
            "bulk logged {} events and {} users for chat {chat_id}",
            events.len(),
            profiles.len()
        );
        Ok(total)
    }

    /// Cascading delete of the chat's events, users, and the chat record
    /// itself. A no-op (logged) when the chat does not exist.
    pub async fn delete_chat(&self, chat_id: &str) -> Result<(), StoreError> {
        if !self.chat_exists(chat_id).await? {
            tracing::warn!("chat {chat_id} does not exist, no data to delete");
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM events WHERE chat_id=?")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM users WHERE chat_id=?")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chats WHERE chat_id=?")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!("deleted data for chat {chat_id}");
        Ok(())
    }

    /// Occurrence count per percentage for one user.
    pub async fn percent_counts(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> Result<Vec<(i64, i64)>, StoreError> {
        self.require_chat(chat_id).await?;
        let mut rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT percentage, COUNT(*) FROM events
             WHERE chat_id=? AND user_id=?
             GROUP BY percentage",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(row);
        }
        Ok(out)
    }

    /// Count and latest timestamp per percentage for one user, restricted to
    /// the given percentage set.
    pub async fn percent_counts_in(
        &self,
        chat_id: &str,
        user_id: &str,
        percentages: &[i64],
    ) -> Result<Vec<(i64, i64, i64)>, StoreError> {
        self.require_chat(chat_id).await?;
        let sql = format!(
            "SELECT percentage, COUNT(*), MAX(timestamp) FROM events
             WHERE chat_id=? AND user_id=? AND percentage IN ({})
             GROUP BY percentage",
            placeholders(percentages.len())
        );
        let mut query = sqlx::query_as::<_, (i64, i64, i64)>(&sql)
            .bind(chat_id)
            .bind(user_id);
        for p in percentages {
            query = query.bind(*p);
        }
        let mut rows = query.fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(row);
        }
        Ok(out)
    }

    /// Occurrence count per (percentage, user) across the whole chat,
    /// restricted to the given percentage set.
    pub async fn group_counts_in(
        &self,
        chat_id: &str,
        percentages: &[i64],
    ) -> Result<Vec<(i64, String, i64)>, StoreError> {
        self.require_chat(chat_id).await?;
        let sql = format!(
            "SELECT percentage, user_id, COUNT(*) FROM events
             WHERE chat_id=? AND percentage IN ({})
             GROUP BY percentage, user_id",
            placeholders(percentages.len())
        );
        let mut query = sqlx::query_as::<_, (i64, String, i64)>(&sql).bind(chat_id);
        for p in percentages {
            query = query.bind(*p);
        }
        let mut rows = query.fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(row);
        }
        Ok(out)
    }

    /// user_id → (username, name) for every profile in the chat.
    pub async fn display_names(
        &self,
        chat_id: &str,
    ) -> Result<HashMap<String, (String, String)>, StoreError> {
        let mut rows = sqlx::query_as::<_, (String, String, String)>(
            "SELECT user_id, username, name FROM users WHERE chat_id=?",
        )
        .bind(chat_id)
        .fetch(&self.pool);

        let mut out = HashMap::new();
        while let Some((user_id, username, name)) = rows.try_next().await? {
            out.insert(user_id, (username, name));
        }
        Ok(out)
    }

    /// Debug listing of every event in the chat.
    pub async fn dump_events(&self, chat_id: &str) -> Result<Vec<String>, StoreError> {
        let mut rows = sqlx::query_as::<_, (String, i64, i64)>(
            "SELECT user_id, percentage, timestamp FROM events
             WHERE chat_id=? ORDER BY timestamp",
        )
        .bind(chat_id)
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some((user_id, percentage, timestamp)) = rows.try_next().await? {
            out.push(format!(
                "Chat: {chat_id}, User: {user_id}, Percentage: {percentage}, Timestamp: {timestamp}"
            ));
        }
        Ok(out)
    }

    /// Debug listing of every user profile in the chat.
    pub async fn dump_users(&self, chat_id: &str) -> Result<Vec<String>, StoreError> {
        let mut rows = sqlx::query_as::<_, (String, String, String)>(
            "SELECT user_id, username, name FROM users WHERE chat_id=? ORDER BY user_id",
        )
        .bind(chat_id)
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some((user_id, username, name)) = rows.try_next().await? {
            out.push(format!(
                "Chat: {chat_id}, User ID: {user_id}, Username: {username}, Name: {name}"
            ));
        }
        Ok(out)
    }

    async fn require_chat(&self, chat_id: &str) -> Result<(), StoreError> {
        if self.chat_exists(chat_id).await? {
            Ok(())
        } else {
            Err(StoreError::ChatNotFound(chat_id.to_owned()))
        }
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

async fn insert_chat(conn: &mut SqliteConnection, chat_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO chats (chat_id, last_update) VALUES (?, 0) ON CONFLICT(chat_id) DO NOTHING")
        .bind(chat_id)
        .execute(conn)
        .await?;
    Ok(())
}

async fn insert_event(
    conn: &mut SqliteConnection,
    chat_id: &str,
    row: &EventRow,
) -> Result<bool, sqlx::Error> {
    let res = sqlx::query(
        "INSERT INTO events (chat_id, message_id, user_id, percentage, timestamp)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(chat_id, message_id) DO NOTHING",
    )
    .bind(chat_id)
    .bind(row.message_id)
    .bind(&row.user_id)
    .bind(row.percentage)
    .bind(row.timestamp)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() > 0)
}

async fn upsert_profile(
    conn: &mut SqliteConnection,
    chat_id: &str,
    row: &ProfileRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO users (chat_id, user_id, username, name, last_update)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(chat_id, user_id) DO UPDATE SET
             username=excluded.username,
             name=excluded.name,
             last_update=MAX(users.last_update, excluded.last_update)",
    )
    .bind(chat_id)
    .bind(&row.user_id)
    .bind(&row.username)
    .bind(&row.name)
    .bind(row.last_update)
    .execute(conn)
    .await?;
    Ok(())
}
