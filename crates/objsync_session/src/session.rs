//! The session driving the state machine for one local/remote pairing.
//!
//! All transition-triggering entry points take the session lock for the
//! whole read-dispatch-transition sequence. Network requests run on the
//! [`NetworkExecutor`] and re-enter through the same lock. Policy and
//! error-handler callbacks always run after the lock has been released.

use crate::config::SyncConfiguration;
use crate::error::{SessionError, SessionResult};
use crate::native::{NativeSessionHandle, NativeSyncClient};
use crate::network::{
    AuthTask, BackoffTask, ConnectionListener, ListenerId, NetworkExecutor, NetworkMonitor,
};
use crate::policy::SyncPolicy;
use crate::state::{Action, SessionState};
use crate::sync_session::{ErrorHandler, SyncSession};
use objsync_auth::{
    AccessDescription, AuthenticationServer, ErrorCode, ObjectServerError, ObjectServerUser,
    Token,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use url::Url;

/// Collaborators shared by every session of a process.
#[derive(Clone)]
pub struct SyncServices {
    /// Issues access tokens.
    pub auth_server: Arc<dyn AuthenticationServer>,
    /// The native sync engine.
    pub native: Arc<dyn NativeSyncClient>,
    /// Runs authentication requests in the background.
    pub executor: Arc<dyn NetworkExecutor>,
    /// Reports network availability.
    pub network: Arc<dyn NetworkMonitor>,
}

impl fmt::Debug for SyncServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncServices").finish_non_exhaustive()
    }
}

/// The state instance currently driving the session.
#[derive(Debug)]
struct ActiveState {
    kind: SessionState,
    /// Bumped on every entry; callbacks carry the id they were issued under.
    id: u64,
    exiting: bool,
}

/// Mutable session fields, guarded by the session lock.
#[derive(Debug)]
struct SessionCore {
    active: ActiveState,
    native_session: Option<NativeSessionHandle>,
    network_request: Option<AuthTask>,
    network_listener: Option<ListenerId>,
}

/// Work that must run once the session lock is released.
enum Deferred {
    SessionStopped,
}

/// A sync session between a local resource and a remote one.
///
/// Created in [`SessionState::Initial`]; call [`start`](Self::start) and
/// then [`bind`](Self::bind) to begin synchronizing. This type is thread
/// safe.
pub struct ObjectServerSession {
    this: Weak<ObjectServerSession>,
    configuration: SyncConfiguration,
    user: Arc<ObjectServerUser>,
    services: SyncServices,
    policy: Arc<dyn SyncPolicy>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    user_session: Mutex<Weak<SyncSession>>,
    core: Mutex<SessionCore>,
}

impl ObjectServerSession {
    /// Creates a session in the `Initial` state.
    pub fn new(
        configuration: SyncConfiguration,
        services: SyncServices,
        user: Arc<ObjectServerUser>,
        policy: Arc<dyn SyncPolicy>,
        error_handler: Option<Arc<dyn ErrorHandler>>,
    ) -> Arc<Self> {
        let session = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            configuration,
            user,
            services,
            policy,
            error_handler,
            user_session: Mutex::new(Weak::new()),
            core: Mutex::new(SessionCore {
                active: ActiveState {
                    kind: SessionState::Initial,
                    id: 0,
                    exiting: false,
                },
                native_session: None,
                network_request: None,
                network_listener: None,
            }),
        });
        debug!(url = %session.configuration.server_url, "session created");
        if let Err(error) = session.with_context(|ctx| ctx.enter_current()) {
            warn!(%error, "entering initial state failed");
        }
        session
    }

    /// Moves the session to `Unbound`. [`bind`](Self::bind) must be called
    /// to start synchronizing.
    pub fn start(&self) -> SessionResult<()> {
        self.with_context(|ctx| ctx.dispatch(Action::Start))
    }

    /// Stops the session for good.
    pub fn stop(&self) -> SessionResult<()> {
        self.with_context(|ctx| ctx.dispatch(Action::Stop))
    }

    /// Binds the local resource to the remote one.
    ///
    /// Returns immediately. Authentication happens in the background and
    /// failures are reported to the error handler.
    pub fn bind(&self) -> SessionResult<()> {
        self.with_context(|ctx| ctx.dispatch(Action::Bind))
    }

    /// Stops synchronizing. The session can be bound again later.
    pub fn unbind(&self) -> SessionResult<()> {
        self.with_context(|ctx| ctx.dispatch(Action::Unbind))
    }

    /// Reports an error to the session.
    ///
    /// The state machine reacts first; the error handler then sees the
    /// post-transition state.
    pub fn on_error(&self, error: ObjectServerError) {
        self.report_error(None, error);
    }

    /// Lets the state machine react to `error`, then notifies the error handler.
    ///
    /// With `state_id` set, the state machine only reacts if that state
    /// instance is still active; the handler is notified either way.
    fn report_error(&self, state_id: Option<u64>, error: ObjectServerError) {
        let reaction = self.with_context(|ctx| {
            if let Some(id) = state_id {
                if !ctx.is_current(id) {
                    debug!(%error, "ignoring error from stale state");
                    return Ok(());
                }
            }
            let current = ctx.core.active.kind;
            current.on_error(ctx, &error)
        });
        if let Err(fsm_error) = &reaction {
            warn!(%fsm_error, %error, "state machine failed to handle error");
        }
        if let Some(handler) = &self.error_handler {
            let public = self.user_session();
            handler.on_error(public.as_deref(), &error);
        }
    }

    /// Entry point for errors raised on the native sync client's thread.
    pub fn notify_session_error(&self, error_code: i32, error_message: &str) {
        self.on_error(ObjectServerError::from_native(error_code, error_message));
    }

    /// Tells the native layer about a local commit, if the session is bound.
    ///
    /// Commits made while unbound are picked up by the native layer once
    /// binding completes.
    pub fn notify_commit(&self, version: u64) {
        let core = self.core.lock();
        if core.active.kind != SessionState::Bound {
            return;
        }
        if let Some(handle) = &core.native_session {
            self.services.native.notify_commit_happened(handle, version);
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.core.lock().active.kind
    }

    /// Returns true if the session is bound.
    pub fn is_bound(&self) -> bool {
        self.state() == SessionState::Bound
    }

    /// Returns true if the user holds a valid access token for `configuration`.
    pub fn is_authenticated(&self, configuration: &SyncConfiguration) -> bool {
        self.user.is_authenticated(&configuration.server_url)
    }

    /// Returns true if a native session handle is currently held.
    pub fn has_native_session(&self) -> bool {
        self.core.lock().native_session.is_some()
    }

    /// Returns the configuration of this session.
    pub fn configuration(&self) -> &SyncConfiguration {
        &self.configuration
    }

    /// Returns the user the session authenticates as.
    pub fn user(&self) -> &Arc<ObjectServerUser> {
        &self.user
    }

    /// Returns the remote resource URL.
    pub fn server_url(&self) -> &Url {
        &self.configuration.server_url
    }

    /// Returns the sync policy controlling this session.
    pub fn sync_policy(&self) -> &Arc<dyn SyncPolicy> {
        &self.policy
    }

    /// Returns the public session wrapping this one, if it is still alive.
    pub fn user_session(&self) -> Option<Arc<SyncSession>> {
        self.user_session.lock().upgrade()
    }

    pub(crate) fn set_user_session(&self, session: &Arc<SyncSession>) {
        *self.user_session.lock() = Arc::downgrade(session);
    }

    /// Destroys the native session once the session is no longer reachable.
    ///
    /// States before binding ignore `stop()`, so a session closed early still
    /// holds its handle. Pending network work is cancelled too. The state is
    /// left as is.
    pub(crate) fn release_native_session(&self) {
        let result = self.with_context(|ctx| {
            if ctx.core.active.kind != SessionState::Stopped {
                ctx.cancel_network_work();
                ctx.stop_native_session();
            }
            Ok(())
        });
        if let Err(error) = result {
            warn!(%error, "releasing native session failed");
        }
    }

    /// Transitions to `next` on behalf of the state instance `state_id`.
    ///
    /// Ignored if that instance has been left or is being left.
    fn transition_from(&self, state_id: u64, next: SessionState) {
        let result = self.with_context(|ctx| {
            if !ctx.is_current(state_id) {
                debug!(next = next.name(), "ignoring transition from stale state");
                return Ok(());
            }
            ctx.next_state(next)
        });
        if let Err(error) = result {
            warn!(%error, next = next.name(), "transition failed");
        }
    }

    fn on_connectivity_restored(&self, state_id: u64) {
        let result = self.with_context(|ctx| {
            if !ctx.is_current(state_id) {
                return Ok(());
            }
            if let Some(id) = ctx.core.network_listener.take() {
                self.services.network.remove_listener(id);
            }
            ctx.authenticate_for_state();
            Ok(())
        });
        if let Err(error) = result {
            warn!(%error, "authentication after reconnect failed");
        }
    }

    fn with_context<R>(
        &self,
        f: impl FnOnce(&mut SessionContext<'_>) -> SessionResult<R>,
    ) -> SessionResult<R> {
        let (result, deferred) = {
            let mut core = self.core.lock();
            let mut ctx = SessionContext {
                session: self,
                core: &mut *core,
                deferred: Vec::new(),
            };
            let result = f(&mut ctx);
            (result, ctx.deferred)
        };
        for work in deferred {
            match work {
                Deferred::SessionStopped => self.policy.on_session_stopped(self),
            }
        }
        result
    }
}

impl Drop for ObjectServerSession {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        if let Some(task) = core.network_request.take() {
            task.cancel();
        }
        if let Some(id) = core.network_listener.take() {
            self.services.network.remove_listener(id);
        }
        if let Some(handle) = core.native_session.take() {
            debug!(path = %self.configuration.local_path, "destroying native session on drop");
            self.services.native.unbind(handle);
        }
    }
}

impl fmt::Debug for ObjectServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectServerSession")
            .field("local_path", &self.configuration.local_path)
            .field("server_url", &self.configuration.server_url.as_str())
            .finish_non_exhaustive()
    }
}

/// Borrowed view of a locked session handed to state handlers.
pub(crate) struct SessionContext<'a> {
    session: &'a ObjectServerSession,
    core: &'a mut SessionCore,
    deferred: Vec<Deferred>,
}

impl SessionContext<'_> {
    fn is_current(&self, state_id: u64) -> bool {
        self.core.active.id == state_id && !self.core.active.exiting
    }

    fn enter_current(&mut self) -> SessionResult<()> {
        match self.core.active.kind.on_enter(self)? {
            Some(next) => self.next_state(next),
            None => Ok(()),
        }
    }

    fn dispatch(&mut self, action: Action) -> SessionResult<()> {
        let current = self.core.active.kind;
        match current.on_action(action) {
            Some(next) => self.next_state(next),
            None => {
                debug!(state = current.name(), ?action, "action ignored");
                Ok(())
            }
        }
    }

    /// Leaves the current state and enters `next`, following any hand-over
    /// the entered state requests.
    pub(crate) fn next_state(&mut self, next: SessionState) -> SessionResult<()> {
        let mut next = next;
        loop {
            let previous = self.core.active.kind;
            self.core.active.exiting = true;
            previous.on_exit(self);

            self.core.active = ActiveState {
                kind: next,
                id: self.core.active.id.wrapping_add(1),
                exiting: false,
            };
            debug!(
                "session[{}]: {} -> {}",
                self.session.configuration.server_url, previous, next
            );

            match next.on_enter(self)? {
                Some(follow_up) => next = follow_up,
                None => return Ok(()),
            }
        }
    }

    /// Creates a native session for the local resource.
    pub(crate) fn create_native_session(&mut self) {
        let handle = self
            .session
            .services
            .native
            .create_session(&self.session.configuration.local_path);
        if let Some(previous) = self.core.native_session.replace(handle) {
            self.session.services.native.unbind(previous);
        }
    }

    /// Tears down the native session. Safe to call without one.
    pub(crate) fn stop_native_session(&mut self) {
        if let Some(handle) = self.core.native_session.take() {
            self.session.services.native.unbind(handle);
        }
    }

    /// Binds the native session with an access token for this resource.
    ///
    /// The token is passed in rather than looked up, so a missing token is
    /// ruled out by the caller. Fails if no native session exists.
    pub(crate) fn bind_with_tokens(&mut self, token: &Token) -> SessionResult<()> {
        let server_url = &self.session.configuration.server_url;
        let handle = self.core.native_session.as_ref().ok_or_else(|| {
            SessionError::IllegalState(format!("no native session for {server_url}"))
        })?;
        self.session
            .services
            .native
            .bind(handle, server_url.as_str(), token.value());
        Ok(())
    }

    /// Returns the cached access token for this resource if it has not expired.
    ///
    /// Read once so that a concurrent `clear_tokens` cannot slip in between
    /// the check and the bind.
    pub(crate) fn valid_access_token(&self) -> Option<Token> {
        self.session
            .user
            .access_token(&self.session.configuration.server_url)
            .filter(Token::is_valid)
    }

    pub(crate) fn discard_access_token(&mut self) {
        self.session
            .user
            .remove_realm(&self.session.configuration.server_url);
    }

    pub(crate) fn is_online(&self) -> bool {
        self.session.services.network.is_online()
    }

    /// Authenticates on behalf of the active state: success moves it to
    /// `Binding`, failure is reported as a session error. Results arriving
    /// after the state was left do not move the state machine.
    pub(crate) fn authenticate_for_state(&mut self) {
        let state_id = self.core.active.id;
        self.authenticate_realm(
            move |session| session.transition_from(state_id, SessionState::Binding),
            move |session, error| session.report_error(Some(state_id), error),
        );
    }

    /// Requests an access token in the background.
    ///
    /// Any previous request is cancelled first. On success the token is
    /// stored on the user before `on_success` runs; on failure `on_error`
    /// receives the server's error. Neither runs if the request is
    /// cancelled.
    pub(crate) fn authenticate_realm<S, E>(&mut self, on_success: S, on_error: E)
    where
        S: FnOnce(&ObjectServerSession) + Send + 'static,
        E: FnOnce(&ObjectServerSession, ObjectServerError) + Send + 'static,
    {
        let task = AuthTask::new();
        if let Some(previous) = self.core.network_request.replace(task.clone()) {
            previous.cancel();
        }

        let session = self.session;
        let weak = session.this.clone();
        let user = Arc::clone(&session.user);
        let auth_server = Arc::clone(&session.services.auth_server);
        let configuration = session.configuration.clone();
        let backoff = BackoffTask::new(configuration.retry.clone(), task.clone());

        debug!(url = %configuration.server_url, "submitting authentication request");
        session.services.executor.submit(Box::new(move || {
            let response = match user.refresh_token() {
                Some(refresh_token) => backoff.run(|| {
                    auth_server.login_to_realm(
                        &refresh_token,
                        &configuration.server_url,
                        user.authentication_url(),
                    )
                }),
                None => Some(objsync_auth::AuthenticateResponse::from_error(
                    ObjectServerError::new(
                        ErrorCode::Unauthorized,
                        format!("user '{}' has no refresh token", user.identity()),
                    ),
                )),
            };

            let Some(response) = response else {
                debug!(url = %configuration.server_url, "authentication cancelled");
                return;
            };
            if task.is_cancelled() {
                return;
            }
            let Some(session) = weak.upgrade() else {
                return;
            };

            match response.into_result() {
                Ok(access_token) => {
                    user.add_realm(
                        &configuration.server_url,
                        AccessDescription::new(
                            access_token,
                            configuration.local_path.clone(),
                            configuration.delete_on_logout,
                        ),
                    );
                    on_success(&session);
                }
                Err(error) => {
                    warn!(url = %configuration.server_url, %error, "authentication failed");
                    on_error(&session, error);
                }
            }
        }));
    }

    /// Authenticates once the network comes back. The listener removes
    /// itself after firing.
    pub(crate) fn wait_for_connectivity(&mut self) {
        let state_id = self.core.active.id;
        let weak = self.session.this.clone();
        let listener: ConnectionListener = Arc::new(move |online| {
            if !online {
                return;
            }
            if let Some(session) = weak.upgrade() {
                session.on_connectivity_restored(state_id);
            }
        });
        let id = self.session.services.network.add_listener(listener);
        if let Some(previous) = self.core.network_listener.replace(id) {
            self.session.services.network.remove_listener(previous);
        }
    }

    /// Cancels the in-flight request and removes the pending listener.
    pub(crate) fn cancel_network_work(&mut self) {
        if let Some(task) = self.core.network_request.take() {
            debug!("cancelling authentication request");
            task.cancel();
        }
        if let Some(id) = self.core.network_listener.take() {
            self.session.services.network.remove_listener(id);
        }
    }

    pub(crate) fn notify_stopped(&mut self) {
        self.deferred.push(Deferred::SessionStopped);
    }
}
