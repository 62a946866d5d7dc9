use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    message_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    properties      TEXT NOT NULL,
    body            BLOB NOT NULL,
    enqueued_at     TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    visible_at      INTEGER NOT NULL DEFAULT 0,
    delivery_count  INTEGER NOT NULL DEFAULT 0,
    acked           INTEGER NOT NULL DEFAULT 0,
    dead_letter     TEXT
);

CREATE INDEX IF NOT EXISTS messages_pending
    ON messages (acked, visible_at, message_id);
"#;

/// A message to enqueue: string properties readable without touching the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub properties: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// A message handed out by [`MessageQueue::receive`] or [`MessageQueue::peek`].
///
/// `delivery_count` doubles as the lock token: `ack` and `abandon` only
/// succeed while the caller still holds the delivery it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub message_id: i64,
    pub properties: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub delivery_count: u32,
}

/// Durable peek-lock queue backed by a single SQLite file.
///
/// A received message stays invisible until its lock expires. Unless it is
/// acknowledged before then, it becomes receivable again, including after a
/// consumer restart, which gives at-least-once delivery.
pub struct MessageQueue {
    conn: Connection,
}

impl MessageQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            // Only tighten permissions on directories we create ourselves.
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create queue directory {}", parent.display())
                })?;
                #[cfg(unix)]
                set_owner_perms(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open queue database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "wal")
            .context("failed to enable WAL for message queue")?;
        conn.pragma_update(None, "synchronous", "full").ok();
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set queue busy timeout")?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize queue schema")?;
        Ok(Self { conn })
    }

    pub fn enqueue(&self, message: &NewMessage) -> Result<i64> {
        let properties = serde_json::to_string(&message.properties)
            .context("failed to serialize message properties")?;
        self.conn.execute(
            "INSERT INTO messages(properties, body) VALUES (?1, ?2)",
            params![properties, message.body],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Lock and return the oldest visible message, or `None` if nothing is
    /// currently receivable.
    pub fn receive(&mut self, lock: Duration) -> Result<Option<QueuedMessage>> {
        let now = now_millis();
        let locked_until = now.saturating_add(lock.as_millis() as i64);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start receive transaction")?;

        let candidate: Option<i64> = tx
            .query_row(
                "SELECT message_id FROM messages
                 WHERE acked = 0 AND dead_letter IS NULL AND visible_at <= ?1
                 ORDER BY message_id ASC
                 LIMIT 1",
                [now],
                |row| row.get(0),
            )
            .optional()?;

        let Some(message_id) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE messages
             SET visible_at = ?1, delivery_count = delivery_count + 1
             WHERE message_id = ?2",
            params![locked_until, message_id],
        )?;

        let (properties, body, delivery_count): (String, Vec<u8>, u32) = tx.query_row(
            "SELECT properties, body, delivery_count FROM messages WHERE message_id = ?1",
            [message_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        tx.commit()?;

        Ok(Some(QueuedMessage {
            message_id,
            properties: parse_properties(&properties)?,
            body,
            delivery_count,
        }))
    }

    /// Mark a delivery consumed. Returns false when the delivery is no longer
    /// current (already acknowledged, or re-received by someone else).
    pub fn ack(&self, message_id: i64, delivery_count: u32) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE messages SET acked = 1
             WHERE message_id = ?1 AND delivery_count = ?2 AND acked = 0",
            params![message_id, delivery_count],
        )?;
        Ok(updated == 1)
    }

    /// Release a delivery's lock so the message is immediately receivable.
    pub fn abandon(&self, message_id: i64, delivery_count: u32) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE messages SET visible_at = 0
             WHERE message_id = ?1 AND delivery_count = ?2 AND acked = 0",
            params![message_id, delivery_count],
        )?;
        Ok(updated == 1)
    }

    /// Park a delivery so it is never received again. The message stays in
    /// the database with `reason` until an operator removes it.
    pub fn dead_letter(&self, message_id: i64, delivery_count: u32, reason: &str) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE messages SET dead_letter = ?3
             WHERE message_id = ?1 AND delivery_count = ?2 AND acked = 0",
            params![message_id, delivery_count, reason],
        )?;
        Ok(updated == 1)
    }

    /// List messages that are neither acknowledged nor dead-lettered,
    /// including ones currently locked by a receiver. Nothing is locked.
    pub fn peek(&self, limit: usize) -> Result<Vec<QueuedMessage>> {
        self.select_messages("dead_letter IS NULL", limit)
    }

    /// List dead-lettered messages.
    pub fn peek_dead_letters(&self, limit: usize) -> Result<Vec<QueuedMessage>> {
        self.select_messages("dead_letter IS NOT NULL", limit)
    }

    fn select_messages(&self, filter: &str, limit: usize) -> Result<Vec<QueuedMessage>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT message_id, properties, body, delivery_count
             FROM messages
             WHERE acked = 0 AND {filter}
             ORDER BY message_id ASC
             LIMIT ?1"
        ))?;
        let mut rows = stmt.query([limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let properties: String = row.get(1)?;
            out.push(QueuedMessage {
                message_id: row.get(0)?,
                properties: parse_properties(&properties)?,
                body: row.get(2)?,
                delivery_count: row.get(3)?,
            });
        }
        Ok(out)
    }

    pub fn pending_count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE acked = 0 AND dead_letter IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn dead_letter_count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE acked = 0 AND dead_letter IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn purge_acknowledged(&self) -> Result<u64> {
        let deleted = self
            .conn
            .execute("DELETE FROM messages WHERE acked = 1", [])?;
        Ok(deleted as u64)
    }
}

fn parse_properties(raw: &str) -> Result<BTreeMap<String, String>> {
    serde_json::from_str(raw).context("message properties are not a string map")
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(unix)]
fn set_owner_perms(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path)?;
    let mut perms = metadata.permissions();
    perms.set_mode(0o700);
    fs::set_permissions(path, perms)?;
    Ok(())
}
