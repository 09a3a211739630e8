use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::{SessionStore, SESSION_ID_LEN};

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const CREATE_ATTEMPTS: usize = 5;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    owner_name TEXT NOT NULL,
    created_at INTEGER NOT NULL
)";

/// An issued session id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub id: String,
    /// Principal the session was issued to
    pub owner_id: String,
    /// Display name of the principal at issuance time
    pub owner_name: String,
    /// When the session was issued (unix timestamp)
    pub created_at: i64,
}

/// Session store backed by SQLite
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Open or create a session store at the given path
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("opening session store {}", path.display()))?;
        Self::init(conn)
    }

    /// Create an in-memory session store (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Issue a fresh session id for `owner_id`.
    pub fn create(&self, owner_id: &str, owner_name: &str) -> Result<String> {
        let conn = self.conn.lock();
        for _ in 0..CREATE_ATTEMPTS {
            let id = generate_id();
            let taken = conn
                .query_row("SELECT 1 FROM sessions WHERE id = ?1", params![id], |_| Ok(()))
                .optional()?
                .is_some();
            if taken {
                continue;
            }

            conn.execute(
                "INSERT INTO sessions (id, owner_id, owner_name, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, owner_id, owner_name, chrono::Utc::now().timestamp()],
            )?;
            log::info!("Issued session {} for {} ({})", id, owner_name, owner_id);
            return Ok(id);
        }
        bail!("failed to generate a unique session id after {CREATE_ATTEMPTS} attempts")
    }

    /// The oldest session id issued to `owner_id`, if any
    pub fn get(&self, owner_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                "SELECT id FROM sessions WHERE owner_id = ?1 ORDER BY created_at ASC LIMIT 1",
                params![owner_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Look up a single session by id
    pub fn record(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT id, owner_id, owner_name, created_at FROM sessions WHERE id = ?1",
                params![session_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// List all issued sessions, newest first
    pub fn list(&self) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, owner_name, created_at
             FROM sessions
             ORDER BY created_at DESC, id ASC",
        )?;
        let rows = stmt.query_map([], row_to_record)?;

        let mut records = Vec::new();
        for record in rows {
            records.push(record?);
        }
        Ok(records)
    }

    /// Revoke a session id. Returns whether it existed.
    pub fn remove(&self, session_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .lock()
            .execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(changed > 0)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn lookup(&self, session_id: &str) -> Result<bool> {
        let found = self
            .conn
            .lock()
            .query_row(
                "SELECT 1 FROM sessions WHERE id = ?1",
                params![session_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

impl SessionStore for SqliteSessionStore {
    fn exists(&self, session_id: &str) -> bool {
        match self.lookup(session_id) {
            Ok(found) => found,
            Err(err) => {
                log::error!("session lookup for {} failed: {:#}", session_id, err);
                false
            }
        }
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        owner_name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_ID_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}
