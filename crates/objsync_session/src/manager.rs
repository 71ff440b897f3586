//! Process-wide entry point for creating and tearing down sessions.

use crate::config::SyncConfiguration;
use crate::error::{SessionError, SessionResult};
use crate::policy::{AutomaticSyncPolicy, SyncPolicy};
use crate::registry::SessionStore;
use crate::session::{ObjectServerSession, SyncServices};
use crate::sync_session::{ErrorHandler, SyncSession};
use objsync_auth::ObjectServerUser;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Owns the shared collaborators and the session registry.
///
/// Construct one per process and share it.
pub struct SyncManager {
    services: SyncServices,
    policy: Arc<dyn SyncPolicy>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    sessions: SessionStore,
}

impl SyncManager {
    /// Creates a manager using [`AutomaticSyncPolicy`] and no error handler.
    pub fn new(services: SyncServices) -> Self {
        Self {
            services,
            policy: Arc::new(AutomaticSyncPolicy),
            error_handler: None,
            sessions: SessionStore::new(),
        }
    }

    /// Sets the policy given to new sessions.
    pub fn with_policy(mut self, policy: Arc<dyn SyncPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the error handler given to new sessions.
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Returns the session for `configuration`, creating and starting it if
    /// none exists for its local path.
    pub fn get_session(
        &self,
        configuration: SyncConfiguration,
        user: &Arc<ObjectServerUser>,
    ) -> SessionResult<Arc<SyncSession>> {
        let local_path = configuration.local_path.clone();
        if let Some(existing) = self.sessions.get_public_session(&local_path) {
            return Ok(existing);
        }

        let inner = ObjectServerSession::new(
            configuration,
            self.services.clone(),
            Arc::clone(user),
            Arc::clone(&self.policy),
            self.error_handler.clone(),
        );
        let public = SyncSession::new(Arc::clone(&inner));
        if let Err(error) =
            self.sessions
                .add_session(local_path.clone(), Arc::clone(&public), Arc::clone(&inner))
        {
            // Lost a race with another caller for the same path.
            return self.sessions.get_public_session(&local_path).ok_or(error);
        }
        user.register_session(&local_path);

        inner.start()?;
        info!(path = %local_path, url = %inner.server_url(), "session created");
        self.policy.on_session_created(&inner);
        Ok(public)
    }

    /// Returns the session registered for `local_path`.
    pub fn session(&self, local_path: &str) -> Option<Arc<SyncSession>> {
        self.sessions.get_public_session(local_path)
    }

    /// Returns every registered session.
    pub fn sessions(&self) -> Vec<Arc<SyncSession>> {
        self.sessions.get_all()
    }

    /// Removes and closes the session for `local_path`.
    pub fn remove_session(&self, local_path: &str) -> Option<Arc<SyncSession>> {
        let removed = self.sessions.remove_session(local_path)?;
        removed.user().unregister_session(local_path);
        info!(path = %local_path, "session removed");
        Some(removed)
    }

    /// Closes every session of `user`, logs it out and drops its tokens.
    ///
    /// Returns the local paths that were configured to be deleted on logout.
    pub fn logout(&self, user: &ObjectServerUser) -> SessionResult<Vec<String>> {
        if !user.is_logged_in() {
            return Err(SessionError::IllegalState(format!(
                "user '{}' is already logged out",
                user.identity()
            )));
        }
        for local_path in user.session_paths() {
            self.remove_session(&local_path);
        }
        let to_delete = user
            .realms()
            .into_iter()
            .filter(|description| description.delete_on_logout)
            .map(|description| description.local_path)
            .collect();

        user.local_logout();
        user.clear_tokens();
        info!(identity = user.identity(), "user logged out");
        Ok(to_delete)
    }
}

impl fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncManager")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
