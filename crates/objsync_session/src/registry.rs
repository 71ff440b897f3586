//! Registries of live sessions, keyed by local resource path.
//!
//! One registry is constructed per process and handed to whatever creates
//! sessions. Each registry has its own lock, which is never held while a
//! session is closed: closing takes the session lock, and sessions never
//! call into a registry while holding theirs.

use crate::error::{SessionError, SessionResult};
use crate::session::ObjectServerSession;
use crate::sync_session::{CloseableSession, SyncSession};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct StoreEntry<P, S> {
    public: Arc<P>,
    internal: Arc<S>,
}

/// Maps local paths to public/internal session pairs.
pub struct SessionStore<P: CloseableSession = SyncSession, S = ObjectServerSession> {
    entries: Mutex<HashMap<String, StoreEntry<P, S>>>,
}

impl<P: CloseableSession, S> SessionStore<P, S> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Stores a session pair for `local_path`.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` if a session is already registered for the path.
    pub fn add_session(
        &self,
        local_path: impl Into<String>,
        public: Arc<P>,
        internal: Arc<S>,
    ) -> SessionResult<()> {
        let local_path = local_path.into();
        let mut entries = self.entries.lock();
        if entries.contains_key(&local_path) {
            return Err(SessionError::IllegalState(format!(
                "a session is already registered for {local_path}"
            )));
        }
        debug!(path = %local_path, "registering session");
        entries.insert(local_path, StoreEntry { public, internal });
        Ok(())
    }

    /// Returns true if a session is registered for `local_path`.
    pub fn has_session(&self, local_path: &str) -> bool {
        self.entries.lock().contains_key(local_path)
    }

    /// Returns the public session for `local_path`.
    pub fn get_public_session(&self, local_path: &str) -> Option<Arc<P>> {
        self.entries
            .lock()
            .get(local_path)
            .map(|entry| Arc::clone(&entry.public))
    }

    /// Returns the internal session for `local_path`.
    pub fn get_internal_session(&self, local_path: &str) -> Option<Arc<S>> {
        self.entries
            .lock()
            .get(local_path)
            .map(|entry| Arc::clone(&entry.internal))
    }

    /// Returns every public session.
    pub fn get_all(&self) -> Vec<Arc<P>> {
        self.entries
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.public))
            .collect()
    }

    /// Removes the pair for `local_path` and closes its public session.
    ///
    /// Returns the removed public session, or `None` if nothing was
    /// registered. Removing twice closes once.
    pub fn remove_session(&self, local_path: &str) -> Option<Arc<P>> {
        let removed = self.entries.lock().remove(local_path)?;
        debug!(path = %local_path, "removed session");
        removed.public.close();
        Some(removed.public)
    }

    /// Returns the number of registered sessions.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no session is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<P: CloseableSession, S> Default for SessionStore<P, S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps local paths to public sessions handed out to the application.
pub struct SyncSessionHolder<P: CloseableSession = SyncSession> {
    sessions: Mutex<HashMap<String, Arc<P>>>,
}

impl<P: CloseableSession> SyncSessionHolder<P> {
    /// Creates an empty holder.
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Stores `session` for `local_path`, returning the one it replaced.
    pub fn add(&self, local_path: impl Into<String>, session: Arc<P>) -> Option<Arc<P>> {
        self.sessions.lock().insert(local_path.into(), session)
    }

    /// Returns the session for `local_path`.
    pub fn get(&self, local_path: &str) -> Option<Arc<P>> {
        self.sessions.lock().get(local_path).cloned()
    }

    /// Returns every held session.
    pub fn get_all(&self) -> Vec<Arc<P>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Returns true if a session is held for `local_path`.
    pub fn has(&self, local_path: &str) -> bool {
        self.sessions.lock().contains_key(local_path)
    }

    /// Removes and closes the session for `local_path`.
    pub fn remove(&self, local_path: &str) -> Option<Arc<P>> {
        let session = self.sessions.lock().remove(local_path)?;
        session.close();
        Some(session)
    }

    /// Returns the number of held sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns true if no session is held.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

impl<P: CloseableSession> Default for SyncSessionHolder<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSession {
        closes: AtomicUsize,
    }

    impl CloseableSession for CountingSession {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn store() -> SessionStore<CountingSession, u32> {
        SessionStore::new()
    }

    #[test]
    fn remove_closes_exactly_once() {
        let store = store();
        let public = Arc::new(CountingSession::default());
        store.add_session("/data/a", Arc::clone(&public), Arc::new(1)).unwrap();
        assert!(store.has_session("/data/a"));

        assert!(store.remove_session("/data/a").is_some());
        assert!(!store.has_session("/data/a"));
        assert!(store.remove_session("/data/a").is_none());
        assert_eq!(public.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lookups_do_not_close() {
        let store = store();
        let public = Arc::new(CountingSession::default());
        store.add_session("/data/a", Arc::clone(&public), Arc::new(7)).unwrap();

        assert!(store.get_public_session("/data/a").is_some());
        assert_eq!(*store.get_internal_session("/data/a").unwrap(), 7);
        assert_eq!(store.get_all().len(), 1);
        assert!(store.get_public_session("/data/b").is_none());
        assert_eq!(public.closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn duplicate_path_is_rejected() {
        let store = store();
        store
            .add_session("/data/a", Arc::new(CountingSession::default()), Arc::new(1))
            .unwrap();
        let result =
            store.add_session("/data/a", Arc::new(CountingSession::default()), Arc::new(2));
        assert!(matches!(result, Err(SessionError::IllegalState(_))));
        assert_eq!(*store.get_internal_session("/data/a").unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn holder_remove_closes_once() {
        let holder = SyncSessionHolder::new();
        let session = Arc::new(CountingSession::default());
        assert!(holder.add("/data/a", Arc::clone(&session)).is_none());
        assert!(holder.has("/data/a"));
        assert!(holder.get("/data/a").is_some());

        assert!(holder.remove("/data/a").is_some());
        assert!(holder.remove("/data/a").is_none());
        assert!(holder.is_empty());
        assert_eq!(session.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_removal_closes_once() {
        let store = Arc::new(store());
        let public = Arc::new(CountingSession::default());
        store.add_session("/data/a", Arc::clone(&public), Arc::new(1)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.remove_session("/data/a").is_some())
            })
            .collect();
        let removed = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|removed| *removed)
            .count();

        assert_eq!(removed, 1);
        assert_eq!(public.closes.load(Ordering::SeqCst), 1);
    }
}
