//! Authorization gate for the relay: which session ids were issued, and to whom.

mod memory;
mod sqlite;

pub use memory::MemorySessionStore;
pub use sqlite::{SessionRecord, SqliteSessionStore};

/// Length of generated session ids.
pub const SESSION_ID_LEN: usize = 10;

/// Answers whether a session id has been issued.
///
/// The registry consults this on every announcement, so implementations must
/// not fail loudly: an unreadable backend simply means "not issued".
pub trait SessionStore: Send + Sync {
    fn exists(&self, session_id: &str) -> bool;
}
