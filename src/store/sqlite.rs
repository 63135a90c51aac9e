//! SQLite-backed `DataStore`.
//!
//! rusqlite is synchronous — the connection lives behind `Arc<Mutex>` and
//! every operation runs under `tokio::task::spawn_blocking`. The reactions
//! table carries a UNIQUE(message_id, user_id, emoji) constraint; violations
//! surface as `StoreError::Conflict`, which the reaction engine relies on.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use uuid::Uuid;

use super::{AuthorInfo, DataStore, MessageRecord, ReactionRecord, StoreError, UserInfo};

/// Shared database handle.
pub type DbPool = Arc<Mutex<Connection>>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS bunches (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS channels (
    id TEXT PRIMARY KEY,
    bunch_id TEXT NOT NULL REFERENCES bunches(id),
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS members (
    id TEXT PRIMARY KEY,
    bunch_id TEXT NOT NULL REFERENCES bunches(id),
    user_id TEXT NOT NULL REFERENCES users(id),
    role TEXT NOT NULL DEFAULT 'member',
    joined_at TEXT NOT NULL,
    UNIQUE(bunch_id, user_id)
);
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    channel_id TEXT NOT NULL REFERENCES channels(id),
    author_member_id TEXT NOT NULL REFERENCES members(id),
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    edit_count INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS reactions (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL REFERENCES messages(id),
    user_id TEXT NOT NULL REFERENCES users(id),
    emoji TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(message_id, user_id, emoji)
);
";

/// Open (or create) the gateway database, enable WAL, and apply the schema.
pub fn init_db(data_dir: &str) -> Result<DbPool, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(data_dir)?;

    let db_path = Path::new(data_dir).join("bunch-gateway.db");
    let conn = Connection::open(&db_path)?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("Database initialized at {}", db_path.display());

    Ok(Arc::new(Mutex::new(conn)))
}

/// `DataStore` over a shared rusqlite connection.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Run a blocking closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| StoreError::Backend("database mutex poisoned".into()))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
    }
}

fn map_sql_err(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict(e.to_string())
        }
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(e.to_string()),
        _ => StoreError::Backend(e.to_string()),
    }
}

struct MemberRow {
    member_id: String,
    bunch_id: String,
    user_id: String,
    username: String,
    role: String,
    joined_at: String,
}

fn load_member(conn: &Connection, user_id: &str, bunch_id: &str) -> Result<MemberRow, StoreError> {
    conn.query_row(
        "SELECT m.id, m.bunch_id, u.id, u.username, m.role, m.joined_at
         FROM members m JOIN users u ON u.id = m.user_id
         WHERE m.bunch_id = ?1 AND m.user_id = ?2",
        params![bunch_id, user_id],
        |row| {
            Ok(MemberRow {
                member_id: row.get(0)?,
                bunch_id: row.get(1)?,
                user_id: row.get(2)?,
                username: row.get(3)?,
                role: row.get(4)?,
                joined_at: row.get(5)?,
            })
        },
    )
    .optional()
    .map_err(map_sql_err)?
    .ok_or_else(|| StoreError::NotFound(format!("no membership for user {user_id} in bunch {bunch_id}")))
}

fn reaction_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReactionRecord> {
    Ok(ReactionRecord {
        id: row.get(0)?,
        message_id: row.get(1)?,
        user: UserInfo {
            id: row.get(2)?,
            username: row.get(3)?,
        },
        emoji: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn is_member(
        &self,
        user_id: &str,
        bunch_id: &str,
        channel_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let user_id = user_id.to_string();
        let bunch_id = bunch_id.to_string();
        let channel_id = channel_id.map(str::to_string);

        self.with_conn(move |conn| {
            if let Some(cid) = &channel_id {
                let channel_ok: bool = conn
                    .query_row(
                        "SELECT COUNT(*) FROM channels WHERE id = ?1 AND bunch_id = ?2",
                        params![cid, bunch_id],
                        |row| row.get::<_, i64>(0).map(|c| c > 0),
                    )
                    .map_err(map_sql_err)?;
                if !channel_ok {
                    return Ok(false);
                }
            }
            conn.query_row(
                "SELECT COUNT(*) FROM members WHERE bunch_id = ?1 AND user_id = ?2",
                params![bunch_id, user_id],
                |row| row.get::<_, i64>(0).map(|c| c > 0),
            )
            .map_err(map_sql_err)
        })
        .await
    }

    async fn create_message(
        &self,
        user_id: &str,
        bunch_id: &str,
        channel_id: &str,
        content: &str,
    ) -> Result<MessageRecord, StoreError> {
        let user_id = user_id.to_string();
        let bunch_id = bunch_id.to_string();
        let channel_id = channel_id.to_string();
        let content = content.to_string();

        self.with_conn(move |conn| {
            let channel_exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) FROM channels WHERE id = ?1 AND bunch_id = ?2",
                    params![channel_id, bunch_id],
                    |row| row.get::<_, i64>(0).map(|c| c > 0),
                )
                .map_err(map_sql_err)?;
            if !channel_exists {
                return Err(StoreError::NotFound(format!(
                    "channel {channel_id} not found in bunch {bunch_id}"
                )));
            }

            let member = load_member(conn, &user_id, &bunch_id)?;
            let id = Uuid::new_v4().to_string();
            let now = Utc::now().to_rfc3339();

            conn.execute(
                "INSERT INTO messages (id, channel_id, author_member_id, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, channel_id, member.member_id, content, now],
            )
            .map_err(map_sql_err)?;

            Ok(MessageRecord {
                id,
                channel: channel_id,
                author: AuthorInfo {
                    id: member.member_id,
                    bunch: member.bunch_id,
                    user: UserInfo {
                        id: member.user_id,
                        username: member.username,
                    },
                    role: member.role,
                    joined_at: member.joined_at,
                },
                content,
                created_at: now.clone(),
                updated_at: now,
                edit_count: 0,
                deleted: false,
            })
        })
        .await
    }

    async fn create_reaction(
        &self,
        user_id: &str,
        bunch_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<ReactionRecord, StoreError> {
        let user_id = user_id.to_string();
        let bunch_id = bunch_id.to_string();
        let message_id = message_id.to_string();
        let emoji = emoji.to_string();

        self.with_conn(move |conn| {
            // Message must exist in one of this bunch's channels.
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) FROM messages msg
                     JOIN channels c ON c.id = msg.channel_id
                     WHERE msg.id = ?1 AND c.bunch_id = ?2 AND msg.deleted = 0",
                    params![message_id, bunch_id],
                    |row| row.get::<_, i64>(0).map(|c| c > 0),
                )
                .map_err(map_sql_err)?;
            if !exists {
                return Err(StoreError::NotFound(format!("message {message_id} not found")));
            }

            let username: String = conn
                .query_row(
                    "SELECT username FROM users WHERE id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .map_err(map_sql_err)?;

            let id = Uuid::new_v4().to_string();
            let now = Utc::now().to_rfc3339();

            conn.execute(
                "INSERT INTO reactions (id, message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, message_id, user_id, emoji, now],
            )
            .map_err(map_sql_err)?;

            Ok(ReactionRecord {
                id,
                message_id,
                user: UserInfo {
                    id: user_id,
                    username,
                },
                emoji,
                created_at: now,
            })
        })
        .await
    }

    async fn find_reaction(
        &self,
        user_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Option<ReactionRecord>, StoreError> {
        let user_id = user_id.to_string();
        let message_id = message_id.to_string();
        let emoji = emoji.to_string();

        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT r.id, r.message_id, u.id, u.username, r.emoji, r.created_at
                 FROM reactions r JOIN users u ON u.id = r.user_id
                 WHERE r.message_id = ?1 AND r.user_id = ?2 AND r.emoji = ?3",
                params![message_id, user_id, emoji],
                reaction_from_row,
            )
            .optional()
            .map_err(map_sql_err)
        })
        .await
    }

    async fn delete_reaction(
        &self,
        user_id: &str,
        _bunch_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Option<ReactionRecord>, StoreError> {
        let user_id = user_id.to_string();
        let message_id = message_id.to_string();
        let emoji = emoji.to_string();

        self.with_conn(move |conn| {
            let existing = conn
                .query_row(
                    "SELECT r.id, r.message_id, u.id, u.username, r.emoji, r.created_at
                     FROM reactions r JOIN users u ON u.id = r.user_id
                     WHERE r.message_id = ?1 AND r.user_id = ?2 AND r.emoji = ?3",
                    params![message_id, user_id, emoji],
                    reaction_from_row,
                )
                .optional()
                .map_err(map_sql_err)?;

            let Some(record) = existing else {
                return Ok(None);
            };

            conn.execute(
                "DELETE FROM reactions WHERE id = ?1",
                params![record.id],
            )
            .map_err(map_sql_err)?;

            Ok(Some(record))
        })
        .await
    }
}
