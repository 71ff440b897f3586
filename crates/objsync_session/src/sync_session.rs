//! The application-facing session handle.

use crate::config::SyncConfiguration;
use crate::error::SessionResult;
use crate::session::ObjectServerSession;
use crate::state::SessionState;
use objsync_auth::{ObjectServerError, ObjectServerUser};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;

/// Receives errors reported to a session after its state machine reacted.
///
/// Called without any session lock held. The session is `None` if the
/// public handle has already been dropped.
pub trait ErrorHandler: Send + Sync {
    /// Handles an error.
    fn on_error(&self, session: Option<&SyncSession>, error: &ObjectServerError);
}

impl<F> ErrorHandler for F
where
    F: Fn(Option<&SyncSession>, &ObjectServerError) + Send + Sync,
{
    fn on_error(&self, session: Option<&SyncSession>, error: &ObjectServerError) {
        self(session, error)
    }
}

/// A public session that can be closed by the registry that holds it.
pub trait CloseableSession: Send + Sync {
    /// Closes the session. Calling it again has no effect.
    fn close(&self);
}

/// Public handle to a sync session.
pub struct SyncSession {
    inner: Arc<ObjectServerSession>,
    closed: AtomicBool,
}

impl SyncSession {
    /// Wraps `inner` and registers the wrapper as its public session.
    pub fn new(inner: Arc<ObjectServerSession>) -> Arc<Self> {
        let session = Arc::new(Self {
            inner,
            closed: AtomicBool::new(false),
        });
        session.inner.set_user_session(&session);
        session
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Returns the remote resource URL.
    pub fn server_url(&self) -> &Url {
        self.inner.server_url()
    }

    /// Returns the local resource path.
    pub fn local_path(&self) -> &str {
        &self.inner.configuration().local_path
    }

    /// Returns the user the session belongs to.
    pub fn user(&self) -> &Arc<ObjectServerUser> {
        self.inner.user()
    }

    /// Returns the session configuration.
    pub fn configuration(&self) -> &SyncConfiguration {
        self.inner.configuration()
    }

    /// Returns the internal session.
    pub fn inner(&self) -> &Arc<ObjectServerSession> {
        &self.inner
    }

    /// Notifies the session of a local commit.
    pub fn notify_commit(&self, version: u64) {
        self.inner.notify_commit(version);
    }

    /// Returns true once [`close`](CloseableSession::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn stop(&self) -> SessionResult<()> {
        self.inner.stop()
    }
}

impl CloseableSession for SyncSession {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(error) = self.stop() {
            tracing::warn!(%error, path = self.local_path(), "stopping session on close failed");
        }
        // Sessions closed before binding ignore stop() and still hold a handle.
        self.inner.release_native_session();
    }
}

impl fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSession")
            .field("local_path", &self.local_path())
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}
