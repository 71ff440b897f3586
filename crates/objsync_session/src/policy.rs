//! Policies deciding when sessions bind.

use crate::session::ObjectServerSession;
use tracing::warn;

/// Reacts to session lifecycle events.
///
/// Callbacks run without the session lock held, so implementations may
/// call back into the session.
pub trait SyncPolicy: Send + Sync {
    /// Called once a new session has been started.
    fn on_session_created(&self, session: &ObjectServerSession);

    /// Called when a session has entered its terminal state.
    fn on_session_stopped(&self, session: &ObjectServerSession);
}

/// Binds every session as soon as it is created.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutomaticSyncPolicy;

impl SyncPolicy for AutomaticSyncPolicy {
    fn on_session_created(&self, session: &ObjectServerSession) {
        if let Err(error) = session.bind() {
            warn!(%error, url = %session.server_url(), "automatic bind failed");
        }
    }

    fn on_session_stopped(&self, _session: &ObjectServerSession) {}
}

/// Leaves binding to the application.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualSyncPolicy;

impl SyncPolicy for ManualSyncPolicy {
    fn on_session_created(&self, _session: &ObjectServerSession) {}

    fn on_session_stopped(&self, _session: &ObjectServerSession) {}
}
