use std::collections::HashSet;

use parking_lot::Mutex;

use crate::SessionStore;

/// Session store held entirely in memory. Used by tests and by relays that
/// are handed a fixed list of ids at startup.
#[derive(Default)]
pub struct MemorySessionStore {
    ids: Mutex<HashSet<String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: Mutex::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn insert(&self, session_id: impl Into<String>) {
        self.ids.lock().insert(session_id.into());
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.ids.lock().remove(session_id)
    }
}

impl SessionStore for MemorySessionStore {
    fn exists(&self, session_id: &str) -> bool {
        self.ids.lock().contains(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_remove() {
        let store = MemorySessionStore::with_ids(["abc"]);
        assert!(store.exists("abc"));
        assert!(!store.exists("xyz"));

        store.insert("xyz");
        assert!(store.exists("xyz"));
        assert!(store.remove("abc"));
        assert!(!store.exists("abc"));
    }
}
