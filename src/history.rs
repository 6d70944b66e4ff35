//! Chat message history with async batch writing.
//! Records queue on a bounded channel and a writer task commits them to SQLite
//! in batches, so a request never waits on disk I/O. When the writer falls
//! behind, new records are rejected instead of piling up in memory.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::translate::{LanguagePair, TranslationOutcome};

const FLUSH_INTERVAL: Duration = Duration::from_millis(300);
/// Records written per transaction at most.
const MAX_BATCH: usize = 64;
/// Unwritten records held before `record` starts rejecting.
const DEFAULT_BACKLOG: usize = 1024;

/// One stored chat message and what the translator made of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Row id; `None` until persisted.
    pub id: Option<i64>,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub translated_content: Option<String>,
    pub source_language: String,
    pub target_language: String,
    pub is_translated: bool,
    /// Unix milliseconds.
    pub created_at: i64,
}

impl MessageRecord {
    /// Build a record from a translation outcome. Failed translations store no text.
    pub fn from_outcome(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        content: impl Into<String>,
        pair: &LanguagePair,
        outcome: &TranslationOutcome,
    ) -> Self {
        let translated_content = match outcome {
            TranslationOutcome::Translated(text) | TranslationOutcome::Unchanged(text) => {
                Some(text.clone())
            }
            TranslationOutcome::Failed(_) => None,
        };
        Self {
            id: None,
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            content: content.into(),
            translated_content,
            source_language: pair.source.to_string(),
            target_language: pair.target.to_string(),
            is_translated: outcome.is_translated(),
            created_at: now_unix_ms(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message store database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("message store backlog is full")]
    Backlogged,
    #[error("message store writer has stopped")]
    Closed,
}

pub struct MessageStore {
    tx: mpsc::Sender<MessageRecord>,
    /// Direct connection for queries.
    read_conn: Mutex<Connection>,
}

impl MessageStore {
    /// Open (or create) the database and start the background writer.
    /// Must be called inside a tokio runtime.
    pub fn open(db_path: &Path) -> Result<Arc<Self>, StoreError> {
        Self::open_with_backlog(db_path, DEFAULT_BACKLOG)
    }

    /// Like [`MessageStore::open`], holding at most `backlog` unwritten records.
    pub fn open_with_backlog(db_path: &Path, backlog: usize) -> Result<Arc<Self>, StoreError> {
        let read_conn = open_connection(db_path)?;
        create_schema(&read_conn)?;

        // Separate connection so batch writes never hold up reads.
        let write_conn = open_connection(db_path)?;
        let (tx, rx) = mpsc::channel(backlog.max(1));
        tokio::spawn(flush_loop(rx, write_conn));

        info!(path = %db_path.display(), backlog, "message store opened");
        Ok(Arc::new(Self {
            tx,
            read_conn: Mutex::new(read_conn),
        }))
    }

    /// Queue a record for the next batch. Never blocks; a full backlog rejects.
    pub fn record(&self, record: MessageRecord) -> Result<(), StoreError> {
        self.tx.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(record) => {
                warn!(sender = %record.sender_id, "message backlog full, record rejected");
                StoreError::Backlogged
            }
            mpsc::error::TrySendError::Closed(_) => StoreError::Closed,
        })
    }

    /// Messages exchanged between `user` and `friend` in either direction, oldest first.
    pub fn conversation(
        &self,
        user: &str,
        friend: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let conn = self.read_conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, sender_id, receiver_id, content, translated_content,
                    source_language, target_language, is_translated, created_at
             FROM (
                SELECT * FROM messages
                WHERE (sender_id = ?1 AND receiver_id = ?2)
                   OR (sender_id = ?2 AND receiver_id = ?1)
                ORDER BY created_at DESC, id DESC
                LIMIT ?3
             )
             ORDER BY created_at ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![user, friend, limit as i64], |row| {
            Ok(MessageRecord {
                id: Some(row.get(0)?),
                sender_id: row.get(1)?,
                receiver_id: row.get(2)?,
                content: row.get(3)?,
                translated_content: row.get(4)?,
                source_language: row.get(5)?,
                target_language: row.get(6)?,
                is_translated: row.get::<_, i32>(7)? != 0,
                created_at: row.get(8)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }
}

fn open_connection(db_path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    Ok(conn)
}

fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sender_id TEXT NOT NULL,
            receiver_id TEXT NOT NULL,
            content TEXT NOT NULL,
            translated_content TEXT,
            source_language TEXT NOT NULL,
            target_language TEXT NOT NULL,
            is_translated INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_pair
            ON messages(sender_id, receiver_id);
        CREATE INDEX IF NOT EXISTS idx_messages_created
            ON messages(created_at);",
    )?;
    Ok(())
}

/// Writer task. Flushes whenever a full batch is pending or the ticker fires,
/// and drains what is left once every sender is gone.
async fn flush_loop(mut rx: mpsc::Receiver<MessageRecord>, mut conn: Connection) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending: Vec<MessageRecord> = Vec::with_capacity(MAX_BATCH);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            received = rx.recv() => match received {
                Some(record) => {
                    pending.push(record);
                    if pending.len() < MAX_BATCH {
                        continue;
                    }
                }
                None => {
                    write_pending(&mut conn, &mut pending);
                    info!("message writer exiting");
                    return;
                }
            }
        }
        write_pending(&mut conn, &mut pending);
    }
}

fn write_pending(conn: &mut Connection, pending: &mut Vec<MessageRecord>) {
    if pending.is_empty() {
        return;
    }
    let start = Instant::now();
    match insert_batch(conn, pending) {
        Ok(ids) => debug!(
            written = ids.len(),
            skipped = pending.len() - ids.len(),
            first_id = ids.first().copied(),
            last_id = ids.last().copied(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "message batch written"
        ),
        Err(e) => warn!(error = %e, dropped = pending.len(), "message batch lost"),
    }
    pending.clear();
}

/// Insert `records` in one transaction and return the new row ids in order.
/// A row that fails on its own is logged and skipped; the rest still commit.
fn insert_batch(conn: &mut Connection, records: &[MessageRecord]) -> Result<Vec<i64>, StoreError> {
    let tx = conn.transaction()?;
    let mut ids = Vec::with_capacity(records.len());
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO messages
             (sender_id, receiver_id, content, translated_content,
              source_language, target_language, is_translated, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for record in records {
            match stmt.insert(params![
                record.sender_id,
                record.receiver_id,
                record.content,
                record.translated_content,
                record.source_language,
                record.target_language,
                record.is_translated as i32,
                record.created_at,
            ]) {
                Ok(id) => ids.push(id),
                Err(e) => warn!(error = %e, sender = %record.sender_id, "message insert failed"),
            }
        }
    }
    tx.commit()?;
    Ok(ids)
}

fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
