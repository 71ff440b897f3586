//! Integration tests for sessions, registries and the manager.

use objsync_auth::{
    ErrorCode, MockAuthServer, ObjectServerError, ObjectServerUser, Permission, Token, Url,
};
use objsync_session::{
    CloseableSession, ConnectivityMonitor, ErrorHandler, ManualExecutor, ManualSyncPolicy,
    MockNativeClient, NativeCall, ObjectServerSession, RetryConfig, SessionState, SessionStore,
    SyncConfiguration, SyncManager, SyncPolicy, SyncServices, SyncSession,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SERVER_URL: &str = "realm://sync.example.com/~/default";
const LOCAL_PATH: &str = "/data/default.realm";

/// Collaborators whose behavior the tests drive by hand.
struct Harness {
    auth: Arc<MockAuthServer>,
    native: Arc<MockNativeClient>,
    executor: Arc<ManualExecutor>,
    network: Arc<ConnectivityMonitor>,
    user: Arc<ObjectServerUser>,
}

impl Harness {
    fn new() -> Self {
        Self::with_network(true)
    }

    fn with_network(online: bool) -> Self {
        let identity = format!("user-{}", uuid::Uuid::new_v4());
        Self {
            auth: Arc::new(MockAuthServer::new()),
            native: Arc::new(MockNativeClient::new()),
            executor: Arc::new(ManualExecutor::new()),
            network: Arc::new(ConnectivityMonitor::new(online)),
            user: Arc::new(ObjectServerUser::new(
                Token::new("refresh", identity, None, i64::MAX, vec![Permission::Refresh]),
                Url::parse("https://auth.example.com/auth").unwrap(),
            )),
        }
    }

    fn services(&self) -> SyncServices {
        SyncServices {
            auth_server: self.auth.clone(),
            native: self.native.clone(),
            executor: self.executor.clone(),
            network: self.network.clone(),
        }
    }

    fn configuration(&self, local_path: &str) -> SyncConfiguration {
        SyncConfiguration::new(local_path, SERVER_URL, self.user.identity())
            .unwrap()
            .with_retry(RetryConfig::no_retry())
    }

    fn session(&self) -> Arc<ObjectServerSession> {
        self.session_with(Arc::new(ManualSyncPolicy), None)
    }

    fn session_with(
        &self,
        policy: Arc<dyn SyncPolicy>,
        error_handler: Option<Arc<dyn ErrorHandler>>,
    ) -> Arc<ObjectServerSession> {
        ObjectServerSession::new(
            self.configuration(LOCAL_PATH),
            self.services(),
            Arc::clone(&self.user),
            policy,
            error_handler,
        )
    }

    fn bound_session(&self) -> Arc<ObjectServerSession> {
        let session = self.bound_session_on(LOCAL_PATH);
        assert_eq!(session.state(), SessionState::Bound);
        session
    }

    fn bound_session_on(&self, local_path: &str) -> Arc<ObjectServerSession> {
        let session = ObjectServerSession::new(
            self.configuration(local_path),
            self.services(),
            Arc::clone(&self.user),
            Arc::new(ManualSyncPolicy),
            None,
        );
        session.start().unwrap();
        session.bind().unwrap();
        self.executor.run_pending();
        session
    }
}

#[derive(Default)]
struct CountingPolicy {
    created: AtomicUsize,
    stopped: AtomicUsize,
}

impl SyncPolicy for CountingPolicy {
    fn on_session_created(&self, _session: &ObjectServerSession) {
        self.created.fetch_add(1, Ordering::SeqCst);
    }

    fn on_session_stopped(&self, session: &ObjectServerSession) {
        // Runs outside the session lock, so reading the state must not block.
        assert_eq!(session.state(), SessionState::Stopped);
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn start_bind_authenticate_bound() {
    let h = Harness::new();
    let session = h.session();
    assert_eq!(session.state(), SessionState::Initial);

    session.start().unwrap();
    assert_eq!(session.state(), SessionState::Unbound);
    assert_eq!(h.native.created_count(), 1);

    session.bind().unwrap();
    assert_eq!(session.state(), SessionState::Authenticating);
    assert_eq!(h.executor.pending(), 1);

    h.executor.run_pending();
    assert_eq!(session.state(), SessionState::Bound);
    assert!(session.is_bound());
    assert!(session.is_authenticated(session.configuration()));
    assert_eq!(h.auth.request_count(), 1);
    assert_eq!(h.native.bind_count(), 1);
    assert_eq!(h.native.created_count(), 1);

    match h.native.last_bind() {
        Some(NativeCall::Bind { remote_url, .. }) => {
            assert_eq!(remote_url, session.server_url().as_str());
            assert!(!remote_url.contains("/~/"));
        }
        other => panic!("unexpected call {other:?}"),
    }
}

#[test]
fn bind_with_cached_token_skips_authentication() {
    let h = Harness::new();
    h.user
        .add_realm_with_token(SERVER_URL, "cached-token", LOCAL_PATH, false)
        .unwrap();
    let session = h.session();

    session.start().unwrap();
    session.bind().unwrap();

    assert_eq!(session.state(), SessionState::Bound);
    assert_eq!(h.executor.pending(), 0);
    assert_eq!(h.auth.request_count(), 0);
    assert!(matches!(
        h.native.last_bind(),
        Some(NativeCall::Bind { access_token, .. }) if access_token == "cached-token"
    ));
}

#[test]
fn token_expired_in_bound_discards_token_and_reauthenticates() {
    let h = Harness::new();
    let session = h.bound_session();
    let server_url = session.server_url().clone();
    assert!(h.user.access_token(&server_url).is_some());

    session.on_error(ObjectServerError::new(ErrorCode::TokenExpired, "expired"));

    assert_eq!(session.state(), SessionState::Authenticating);
    assert!(h.user.access_token(&server_url).is_none());
    assert_eq!(h.native.created_count(), 2);
    assert_eq!(h.native.unbind_count(), 1);
    assert_eq!(h.native.live_sessions(), 1);

    h.executor.run_pending();
    assert_eq!(session.state(), SessionState::Bound);
    assert_eq!(h.auth.request_count(), 2);
}

#[test]
fn native_error_callback_routes_by_category() {
    let h = Harness::new();
    let session = h.bound_session();

    session.notify_session_error(ErrorCode::ConnectionClosed.int_value(), "closed");
    assert_eq!(session.state(), SessionState::Unbound);
    assert_eq!(h.native.live_sessions(), 1);

    session.bind().unwrap();
    assert_eq!(session.state(), SessionState::Bound);

    session.notify_session_error(ErrorCode::BadChangeset.int_value(), "bad changeset");
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(h.native.live_sessions(), 0);

    // Codes unknown to this client are fatal.
    let other = h.bound_session_on("/data/other.realm");
    other.notify_session_error(99_999, "unknown");
    assert_eq!(other.state(), SessionState::Stopped);
}

#[test]
fn unbind_while_authenticating_then_rebind() {
    let h = Harness::new();
    let session = h.session();
    session.start().unwrap();
    session.bind().unwrap();
    assert_eq!(session.state(), SessionState::Authenticating);

    session.unbind().unwrap();
    assert_eq!(session.state(), SessionState::Unbound);
    assert_eq!(h.native.created_count(), 2);
    assert_eq!(h.native.live_sessions(), 1);

    session.bind().unwrap();
    assert_eq!(session.state(), SessionState::Authenticating);

    // The first request was cancelled and never reaches the server.
    h.executor.run_pending();
    assert_eq!(h.auth.request_count(), 1);
    assert_eq!(session.state(), SessionState::Bound);
}

#[test]
fn unbind_while_binding_with_token() {
    let h = Harness::new();
    h.user
        .add_realm_with_token(SERVER_URL, "cached-token", LOCAL_PATH, false)
        .unwrap();
    let session = h.session();
    session.start().unwrap();
    session.bind().unwrap();
    assert_eq!(session.state(), SessionState::Bound);

    session.unbind().unwrap();
    assert_eq!(session.state(), SessionState::Unbound);
    session.bind().unwrap();
    assert_eq!(session.state(), SessionState::Bound);
    assert_eq!(h.native.bind_count(), 2);
}

#[test]
fn bind_while_authenticating_restarts_request() {
    let h = Harness::new();
    let session = h.session();
    session.start().unwrap();
    session.bind().unwrap();
    session.bind().unwrap();
    assert_eq!(session.state(), SessionState::Authenticating);
    assert_eq!(h.executor.pending(), 2);

    h.executor.run_pending();
    assert_eq!(h.auth.request_count(), 1);
    assert_eq!(session.state(), SessionState::Bound);
}

#[test]
fn fatal_authentication_error_stops_session() {
    let h = Harness::new();
    h.auth.push_error(ErrorCode::AccessDenied, "denied");
    let policy = Arc::new(CountingPolicy::default());
    let session = h.session_with(policy.clone(), None);

    session.start().unwrap();
    session.bind().unwrap();
    h.executor.run_pending();

    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!session.has_native_session());
    assert_eq!(h.native.live_sessions(), 0);
    assert_eq!(policy.stopped.load(Ordering::SeqCst), 1);
}

#[test]
fn recoverable_authentication_error_unbinds() {
    let h = Harness::new();
    h.auth.push_error(ErrorCode::ServiceUnavailable, "try later");
    let session = h.session();

    session.start().unwrap();
    session.bind().unwrap();
    h.executor.run_pending();

    assert_eq!(session.state(), SessionState::Unbound);
    assert_eq!(h.native.live_sessions(), 1);
}

#[test]
fn error_handler_sees_post_transition_state() {
    let h = Harness::new();
    h.auth.push_error(ErrorCode::AccessDenied, "denied");
    let seen: Arc<Mutex<Vec<(Option<SessionState>, ErrorCode)>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let handler: Arc<dyn ErrorHandler> =
        Arc::new(move |session: Option<&SyncSession>, error: &ObjectServerError| {
            sink.lock().push((session.map(SyncSession::state), error.code()));
        });

    let session = h.session_with(Arc::new(ManualSyncPolicy), Some(handler));
    let public = SyncSession::new(Arc::clone(&session));
    session.start().unwrap();
    session.bind().unwrap();
    h.executor.run_pending();

    assert_eq!(public.state(), SessionState::Stopped);
    assert_eq!(
        *seen.lock(),
        vec![(Some(SessionState::Stopped), ErrorCode::AccessDenied)]
    );
}

#[test]
fn errors_before_binding_are_ignored() {
    let h = Harness::new();
    let session = h.session();
    session.on_error(ObjectServerError::new(ErrorCode::BadChangeset, "ignored"));
    assert_eq!(session.state(), SessionState::Initial);

    session.start().unwrap();
    session.on_error(ObjectServerError::new(ErrorCode::BadChangeset, "ignored"));
    assert_eq!(session.state(), SessionState::Unbound);
}

#[test]
fn stopped_session_ignores_everything() {
    let h = Harness::new();
    let session = h.bound_session();
    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Stopped);
    let calls = h.native.calls().len();

    session.start().unwrap();
    session.bind().unwrap();
    session.unbind().unwrap();
    session.stop().unwrap();
    session.on_error(ObjectServerError::new(ErrorCode::TokenExpired, "late"));
    session.notify_commit(9);

    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(h.native.calls().len(), calls);
    assert_eq!(h.executor.pending(), 0);
}

#[test]
fn stop_is_ignored_before_binding() {
    let h = Harness::new();
    let session = h.session();
    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Initial);

    session.start().unwrap();
    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Unbound);
    assert!(session.has_native_session());
}

#[test]
fn offline_authentication_waits_for_connectivity() {
    let h = Harness::with_network(false);
    let session = h.session();
    session.start().unwrap();
    session.bind().unwrap();

    assert_eq!(session.state(), SessionState::Authenticating);
    assert_eq!(h.executor.pending(), 0);
    assert_eq!(h.network.listener_count(), 1);

    h.network.set_online(true);
    assert_eq!(h.network.listener_count(), 0);
    assert_eq!(h.executor.pending(), 1);

    h.executor.run_pending();
    assert_eq!(session.state(), SessionState::Bound);
}

#[test]
fn leaving_authenticating_removes_connectivity_listener() {
    let h = Harness::with_network(false);
    let session = h.session();
    session.start().unwrap();
    session.bind().unwrap();
    assert_eq!(h.network.listener_count(), 1);

    session.unbind().unwrap();
    assert_eq!(h.network.listener_count(), 0);

    h.network.set_online(true);
    assert_eq!(h.executor.pending(), 0);
    assert_eq!(session.state(), SessionState::Unbound);
}

#[test]
fn stale_authentication_result_is_ignored() {
    let h = Harness::new();
    let session = h.session();
    session.start().unwrap();
    session.bind().unwrap();
    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Stopped);

    h.executor.run_pending();
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(h.auth.request_count(), 0);
    assert_eq!(h.native.bind_count(), 0);
}

#[test]
fn commit_forwarded_only_when_bound() {
    let h = Harness::new();
    let session = h.session();
    session.start().unwrap();
    session.notify_commit(1);

    session.bind().unwrap();
    session.notify_commit(2);
    h.executor.run_pending();
    session.notify_commit(3);

    let commits: Vec<u64> = h
        .native
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            NativeCall::Commit { version, .. } => Some(version),
            _ => None,
        })
        .collect();
    assert_eq!(commits, vec![3]);
}

#[test]
fn public_session_close_is_idempotent() {
    let h = Harness::new();
    let policy = Arc::new(CountingPolicy::default());
    let inner = h.session_with(policy.clone(), None);
    let public = SyncSession::new(Arc::clone(&inner));
    inner.start().unwrap();
    inner.bind().unwrap();
    h.executor.run_pending();

    assert!(Arc::ptr_eq(&inner.user_session().unwrap(), &public));
    public.close();
    public.close();

    assert!(public.is_closed());
    assert_eq!(public.state(), SessionState::Stopped);
    assert_eq!(policy.stopped.load(Ordering::SeqCst), 1);
}

#[test]
fn session_store_closes_on_removal_once() {
    let h = Harness::new();
    let store: SessionStore = SessionStore::new();
    let inner = h.session();
    let public = SyncSession::new(Arc::clone(&inner));
    inner.start().unwrap();
    inner.bind().unwrap();
    h.executor.run_pending();

    store
        .add_session(LOCAL_PATH, Arc::clone(&public), Arc::clone(&inner))
        .unwrap();
    assert!(store.has_session(LOCAL_PATH));
    assert!(!public.is_closed());

    assert!(store.remove_session(LOCAL_PATH).is_some());
    assert!(!store.has_session(LOCAL_PATH));
    assert!(public.is_closed());
    assert_eq!(inner.state(), SessionState::Stopped);
    assert_eq!(h.native.unbind_count(), 1);

    assert!(store.remove_session(LOCAL_PATH).is_none());
    assert_eq!(h.native.unbind_count(), 1);
}

#[test]
fn manager_creates_starts_and_binds_once() {
    let h = Harness::new();
    let policy = Arc::new(CountingPolicy::default());
    let manager = SyncManager::new(h.services()).with_policy(policy.clone());

    let first = manager
        .get_session(h.configuration(LOCAL_PATH), &h.user)
        .unwrap();
    let second = manager
        .get_session(h.configuration(LOCAL_PATH), &h.user)
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.state(), SessionState::Unbound);
    assert_eq!(policy.created.load(Ordering::SeqCst), 1);
    assert_eq!(h.user.session_paths(), vec![LOCAL_PATH.to_string()]);
    assert_eq!(manager.sessions().len(), 1);
}

#[test]
fn manager_automatic_policy_binds() {
    let h = Harness::new();
    let manager = SyncManager::new(h.services());
    let session = manager
        .get_session(h.configuration(LOCAL_PATH), &h.user)
        .unwrap();
    assert_eq!(session.state(), SessionState::Authenticating);

    h.executor.run_pending();
    assert_eq!(session.state(), SessionState::Bound);

    session.notify_commit(4);
    assert!(h
        .native
        .calls()
        .contains(&NativeCall::Commit { handle: 1, version: 4 }));

    let removed = manager.remove_session(LOCAL_PATH).unwrap();
    assert!(removed.is_closed());
    assert!(manager.session(LOCAL_PATH).is_none());
    assert!(h.user.session_paths().is_empty());
}

#[test]
fn manager_logout_closes_sessions_and_reports_paths() {
    let h = Harness::new();
    let manager = SyncManager::new(h.services());
    let kept = manager
        .get_session(h.configuration("/data/kept.realm"), &h.user)
        .unwrap();
    let deleted = manager
        .get_session(
            SyncConfiguration::new(
                "/data/deleted.realm",
                "realm://sync.example.com/~/private",
                h.user.identity(),
            )
            .unwrap()
            .with_delete_on_logout(true),
            &h.user,
        )
        .unwrap();
    h.executor.run_pending();
    assert_eq!(kept.state(), SessionState::Bound);
    assert_eq!(deleted.state(), SessionState::Bound);

    let to_delete = manager.logout(&h.user).unwrap();

    assert_eq!(to_delete, vec!["/data/deleted.realm".to_string()]);
    assert!(kept.is_closed());
    assert!(deleted.is_closed());
    assert_eq!(kept.state(), SessionState::Stopped);
    assert!(!h.user.is_logged_in());
    assert!(h.user.refresh_token().is_none());
    assert!(h.user.realms().is_empty());
    assert!(manager.sessions().is_empty());
    assert_eq!(h.native.live_sessions(), 0);

    assert!(manager.logout(&h.user).is_err());
}

#[test]
fn unbound_sessions_release_native_handle_on_removal_and_logout() {
    let h = Harness::new();
    let manager = SyncManager::new(h.services()).with_policy(Arc::new(ManualSyncPolicy));

    let removed = manager
        .get_session(h.configuration("/data/a.realm"), &h.user)
        .unwrap();
    let logged_out = manager
        .get_session(h.configuration("/data/b.realm"), &h.user)
        .unwrap();
    assert_eq!(removed.state(), SessionState::Unbound);
    assert_eq!(h.native.live_sessions(), 2);

    manager.remove_session("/data/a.realm").unwrap();
    assert!(removed.is_closed());
    assert!(!removed.inner().has_native_session());
    assert_eq!(h.native.live_sessions(), 1);

    manager.logout(&h.user).unwrap();
    assert!(logged_out.is_closed());
    assert_eq!(h.native.live_sessions(), 0);
    assert_eq!(h.native.unbind_count(), 2);
}

#[test]
fn sessions_survive_concurrent_callers() {
    let h = Harness::new();
    h.user
        .add_realm_with_token(SERVER_URL, "cached-token", LOCAL_PATH, false)
        .unwrap();
    let session = h.session();
    session.start().unwrap();

    let threads: Vec<_> = (0..8)
        .map(|i| {
            let session = Arc::clone(&session);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    if i % 2 == 0 {
                        session.bind().unwrap();
                    } else {
                        session.unbind().unwrap();
                    }
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert!(matches!(
        session.state(),
        SessionState::Bound | SessionState::Unbound
    ));
    assert_eq!(h.native.live_sessions(), 1);
}
