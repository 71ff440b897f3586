//! Native sync client abstraction.
//!
//! The storage and sync engine lives behind a foreign-function boundary.
//! Sessions talk to it through [`NativeSyncClient`] and own the handles it
//! returns.

use parking_lot::Mutex;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque handle to a native sync session.
///
/// A handle is never zero; "no native session" is `Option::None`. The type
/// is neither `Copy` nor `Clone`, so tearing a session down consumes it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct NativeSessionHandle(NonZeroU64);

impl NativeSessionHandle {
    /// Wraps a raw pointer value returned by the native layer.
    ///
    /// Returns `None` for the null handle.
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Returns the raw value to hand back to the native layer.
    pub fn as_raw(&self) -> u64 {
        self.0.get()
    }
}

/// Operations provided by the native sync engine.
pub trait NativeSyncClient: Send + Sync {
    /// Creates a native session for the local resource at `local_path`.
    fn create_session(&self, local_path: &str) -> NativeSessionHandle;

    /// Binds the session to `remote_url` using `access_token`.
    fn bind(&self, handle: &NativeSessionHandle, remote_url: &str, access_token: &str);

    /// Unbinds and destroys the session.
    fn unbind(&self, handle: NativeSessionHandle);

    /// Tells the native layer that a local commit produced `version`.
    fn notify_commit_happened(&self, handle: &NativeSessionHandle, version: u64);
}

/// A call recorded by [`MockNativeClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeCall {
    /// `create_session(local_path)` returned `handle`.
    Create {
        /// Local path passed in.
        local_path: String,
        /// Raw handle returned.
        handle: u64,
    },
    /// `bind(handle, remote_url, access_token)`.
    Bind {
        /// Raw handle.
        handle: u64,
        /// Remote URL.
        remote_url: String,
        /// Access token value.
        access_token: String,
    },
    /// `unbind(handle)`.
    Unbind {
        /// Raw handle.
        handle: u64,
    },
    /// `notify_commit_happened(handle, version)`.
    Commit {
        /// Raw handle.
        handle: u64,
        /// Commit version.
        version: u64,
    },
}

/// A native client that records every call, for testing.
#[derive(Debug)]
pub struct MockNativeClient {
    next_handle: AtomicU64,
    calls: Mutex<Vec<NativeCall>>,
}

impl MockNativeClient {
    /// Creates a new mock client.
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Returns every call in order.
    pub fn calls(&self) -> Vec<NativeCall> {
        self.calls.lock().clone()
    }

    /// Returns the number of sessions created.
    pub fn created_count(&self) -> usize {
        self.count(|call| matches!(call, NativeCall::Create { .. }))
    }

    /// Returns the number of sessions destroyed.
    pub fn unbind_count(&self) -> usize {
        self.count(|call| matches!(call, NativeCall::Unbind { .. }))
    }

    /// Returns the number of bind calls.
    pub fn bind_count(&self) -> usize {
        self.count(|call| matches!(call, NativeCall::Bind { .. }))
    }

    /// Returns the number of sessions created but not yet destroyed.
    pub fn live_sessions(&self) -> usize {
        self.created_count() - self.unbind_count()
    }

    /// Returns the most recent bind call.
    pub fn last_bind(&self) -> Option<NativeCall> {
        self.calls
            .lock()
            .iter()
            .rev()
            .find(|call| matches!(call, NativeCall::Bind { .. }))
            .cloned()
    }

    fn count(&self, predicate: impl Fn(&NativeCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, call: NativeCall) {
        self.calls.lock().push(call);
    }
}

impl Default for MockNativeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeSyncClient for MockNativeClient {
    fn create_session(&self, local_path: &str) -> NativeSessionHandle {
        let raw = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.record(NativeCall::Create {
            local_path: local_path.to_string(),
            handle: raw,
        });
        NativeSessionHandle(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    fn bind(&self, handle: &NativeSessionHandle, remote_url: &str, access_token: &str) {
        self.record(NativeCall::Bind {
            handle: handle.as_raw(),
            remote_url: remote_url.to_string(),
            access_token: access_token.to_string(),
        });
    }

    fn unbind(&self, handle: NativeSessionHandle) {
        self.record(NativeCall::Unbind {
            handle: handle.as_raw(),
        });
    }

    fn notify_commit_happened(&self, handle: &NativeSessionHandle, version: u64) {
        self.record(NativeCall::Commit {
            handle: handle.as_raw(),
            version,
        });
    }
}
