use crate::error::ChatError;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Current unix time in milliseconds. All ordering timestamps come from
/// here, never from client clocks.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Open a pooled SQLite database and apply the schema.
pub fn open_pool<P: AsRef<Path>>(path: P) -> Result<DbPool, ChatError> {
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )
    });
    let pool = Pool::new(manager)?;
    pool.get()?.execute_batch(SCHEMA)?;
    Ok(pool)
}

/// Single-connection database for unit tests.
pub fn init_db<P: AsRef<Path>>(path: P) -> Result<Connection, ChatError> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Run a storage operation off the async executor with a bounded deadline.
///
/// Times out with `ChatError::Timeout` instead of hanging; the underlying
/// blocking task is left to finish on its own.
pub async fn with_conn<T, F>(pool: &DbPool, deadline: Duration, f: F) -> Result<T, ChatError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, ChatError> + Send + 'static,
{
    let pool = pool.clone();
    let task = tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut conn)
    });
    match tokio::time::timeout(deadline, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(ChatError::Storage(join.to_string())),
        Err(_) => Err(ChatError::Timeout),
    }
}

/// Read-path variant of [`with_conn`]: transient timeouts are retried with
/// a short backoff before surfacing. Writes never go through here — a send
/// must surface its first timeout or risk duplicate-send ambiguity.
pub async fn with_read_conn<T, F>(pool: &DbPool, deadline: Duration, f: F) -> Result<T, ChatError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, ChatError> + Clone + Send + 'static,
{
    let mut delay = Duration::from_millis(50);
    for _ in 0..2 {
        match with_conn(pool, deadline, f.clone()).await {
            Err(ChatError::Timeout) => {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            other => return other,
        }
    }
    with_conn(pool, deadline, f).await
}

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
  id TEXT PRIMARY KEY,
  participant_a TEXT NOT NULL,
  participant_b TEXT NOT NULL,
  name_a TEXT NOT NULL,
  name_b TEXT NOT NULL,
  last_message TEXT,
  last_sender TEXT,
  last_message_at INTEGER,
  unread_a INTEGER NOT NULL DEFAULT 0 CHECK (unread_a >= 0),
  unread_b INTEGER NOT NULL DEFAULT 0 CHECK (unread_b >= 0),
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
  id TEXT PRIMARY KEY,
  conversation_id TEXT NOT NULL REFERENCES conversations(id),
  sender_id TEXT NOT NULL,
  sender_name TEXT NOT NULL,
  body TEXT NOT NULL,
  sent_at INTEGER NOT NULL,
  read INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_sent
  ON messages (conversation_id, sent_at);
CREATE INDEX IF NOT EXISTS idx_conversations_participant_a
  ON conversations (participant_a);
CREATE INDEX IF NOT EXISTS idx_conversations_participant_b
  ON conversations (participant_b);
"#;
