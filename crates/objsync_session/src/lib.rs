//! # ObjSync Session
//!
//! Sync sessions binding a local replica to a resource on the object server.
//!
//! This crate provides:
//! - The session state machine (initial → unbound → binding → authenticating → bound → stopped)
//! - `ObjectServerSession`, which owns the native session handle
//! - The public `SyncSession` and the session registries
//! - Background authentication with retry and backoff
//! - Connectivity tracking
//! - `SyncManager`, tying sessions to users
//!
//! ## Architecture
//!
//! A session never blocks on the network. Binding without a cached access
//! token routes through authentication, which runs on a
//! [`NetworkExecutor`] and re-enters the session when it completes:
//! 1. `start()` creates a native session (UNBOUND)
//! 2. `bind()` uses a cached token or authenticates first
//! 3. A successful authentication stores the token on the user and binds
//!
//! ## Key Invariants
//!
//! - Transitions on one session are serialized by its lock
//! - Callbacks from a state the session has left are ignored
//! - At most one native session handle is alive per session
//! - Actions on a stopped session are silent no-ops
//! - Policy and error-handler callbacks run without the session lock held

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod manager;
mod native;
mod network;
mod policy;
mod registry;
mod session;
mod state;
mod sync_session;

pub use config::{RetryConfig, SyncConfiguration};
pub use error::{SessionError, SessionResult};
pub use manager::SyncManager;
pub use native::{MockNativeClient, NativeCall, NativeSessionHandle, NativeSyncClient};
pub use network::{
    AuthTask, BackoffTask, ConnectionListener, ConnectivityMonitor, Job, ListenerId,
    ManualExecutor, NetworkExecutor, NetworkMonitor, TokioNetworkExecutor,
};
pub use policy::{AutomaticSyncPolicy, ManualSyncPolicy, SyncPolicy};
pub use registry::{SessionStore, SyncSessionHolder};
pub use session::{ObjectServerSession, SyncServices};
pub use state::SessionState;
pub use sync_session::{CloseableSession, ErrorHandler, SyncSession};
