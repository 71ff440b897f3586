//! Session state machine.
//!
//! Each [`SessionState`] has an entry action, an exit action, a reaction to
//! the four external actions and a reaction to errors. Handlers never block:
//! network work is submitted to the session's executor and comes back
//! through [`ObjectServerSession`](crate::ObjectServerSession) callbacks.
//!
//! | State          | start   | bind    | unbind  | stop    | error          |
//! |----------------|---------|---------|---------|---------|----------------|
//! | Initial        | Unbound | -       | -       | -       | ignored        |
//! | Unbound        | -       | Binding | -       | -       | ignored        |
//! | Binding        | -       | Binding | Unbound | -       | ignored        |
//! | Authenticating | -       | Binding | Unbound | Stopped | by category    |
//! | Bound          | -       | -       | Unbound | Stopped | token / category |
//! | Stopped        | -       | -       | -       | -       | ignored        |

use crate::error::SessionResult;
use crate::session::SessionContext;
use objsync_auth::{ErrorCategory, ErrorCode, ObjectServerError};
use std::fmt;
use tracing::warn;

/// Lifecycle state of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created; no native session exists yet.
    Initial,
    /// A native session exists but is not bound to the remote resource.
    Unbound,
    /// Binding the native session to the remote resource.
    Binding,
    /// Acquiring an access token before binding.
    Authenticating,
    /// Changes are synchronized in both directions.
    Bound,
    /// Terminal. The session can no longer be used.
    Stopped,
}

/// External actions a session reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Start,
    Bind,
    Unbind,
    Stop,
}

impl SessionState {
    /// Returns the upper-case name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Initial => "INITIAL",
            SessionState::Unbound => "UNBOUND",
            SessionState::Binding => "BINDING",
            SessionState::Authenticating => "AUTHENTICATING",
            SessionState::Bound => "BOUND",
            SessionState::Stopped => "STOPPED",
        }
    }

    /// Returns true for the terminal state.
    pub fn is_terminal(self) -> bool {
        self == SessionState::Stopped
    }

    /// State an action leads to, or `None` if the action is ignored.
    pub(crate) fn on_action(self, action: Action) -> Option<SessionState> {
        use Action::*;
        use SessionState::*;
        match (self, action) {
            (Initial, Start) => Some(Unbound),
            (Unbound, Bind) => Some(Binding),
            (Binding, Bind) => Some(Binding),
            (Binding, Unbind) => Some(Unbound),
            (Authenticating, Bind) => Some(Binding),
            (Authenticating, Unbind) => Some(Unbound),
            (Authenticating, Stop) => Some(Stopped),
            (Bound, Unbind) => Some(Unbound),
            (Bound, Stop) => Some(Stopped),
            // Stopped swallows everything: callers may not know yet.
            _ => None,
        }
    }

    /// Runs the entry action. Returns a follow-up state if the state
    /// immediately hands over to another one.
    pub(crate) fn on_enter(self, ctx: &mut SessionContext<'_>) -> SessionResult<Option<SessionState>> {
        match self {
            SessionState::Initial | SessionState::Bound => Ok(None),
            SessionState::Unbound => {
                ctx.stop_native_session();
                ctx.create_native_session();
                Ok(None)
            }
            SessionState::Binding => {
                match ctx.valid_access_token() {
                    Some(token) => {
                        ctx.bind_with_tokens(&token)?;
                        Ok(Some(SessionState::Bound))
                    }
                    None => Ok(Some(SessionState::Authenticating)),
                }
            }
            SessionState::Authenticating => {
                if ctx.is_online() {
                    ctx.authenticate_for_state();
                } else {
                    ctx.wait_for_connectivity();
                }
                Ok(None)
            }
            SessionState::Stopped => {
                ctx.stop_native_session();
                ctx.notify_stopped();
                Ok(None)
            }
        }
    }

    /// Runs the exit action.
    pub(crate) fn on_exit(self, ctx: &mut SessionContext<'_>) {
        if self == SessionState::Authenticating {
            ctx.cancel_network_work();
        }
    }

    /// Reacts to an error reported while in this state.
    pub(crate) fn on_error(
        self,
        ctx: &mut SessionContext<'_>,
        error: &ObjectServerError,
    ) -> SessionResult<()> {
        match self {
            // Nothing is bound yet in these states, so there is nothing to
            // roll back. Binding swallows errors too, even fatal ones.
            SessionState::Initial
            | SessionState::Unbound
            | SessionState::Binding
            | SessionState::Stopped => Ok(()),
            SessionState::Bound if error.code() == ErrorCode::TokenExpired => {
                // The server already rejects the current token, so binding
                // again with it would fail harder. Start over without it.
                ctx.stop_native_session();
                ctx.discard_access_token();
                ctx.create_native_session();
                ctx.next_state(SessionState::Binding)
            }
            SessionState::Authenticating | SessionState::Bound => {
                warn!(state = self.name(), %error, "session error");
                match error.category() {
                    ErrorCategory::Fatal => ctx.next_state(SessionState::Stopped),
                    ErrorCategory::Recoverable => ctx.next_state(SessionState::Unbound),
                }
            }
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SessionState; 6] = [
        SessionState::Initial,
        SessionState::Unbound,
        SessionState::Binding,
        SessionState::Authenticating,
        SessionState::Bound,
        SessionState::Stopped,
    ];

    #[test]
    fn transition_table() {
        use Action::*;
        use SessionState::*;

        assert_eq!(Initial.on_action(Start), Some(Unbound));
        assert_eq!(Initial.on_action(Bind), None);
        assert_eq!(Unbound.on_action(Bind), Some(Binding));
        assert_eq!(Unbound.on_action(Stop), None);
        assert_eq!(Binding.on_action(Bind), Some(Binding));
        assert_eq!(Binding.on_action(Unbind), Some(Unbound));
        assert_eq!(Binding.on_action(Stop), None);
        assert_eq!(Authenticating.on_action(Bind), Some(Binding));
        assert_eq!(Authenticating.on_action(Unbind), Some(Unbound));
        assert_eq!(Authenticating.on_action(Stop), Some(Stopped));
        assert_eq!(Bound.on_action(Bind), None);
        assert_eq!(Bound.on_action(Unbind), Some(Unbound));
        assert_eq!(Bound.on_action(Stop), Some(Stopped));
    }

    #[test]
    fn stopped_ignores_every_action() {
        for action in [Action::Start, Action::Bind, Action::Unbind, Action::Stop] {
            assert_eq!(SessionState::Stopped.on_action(action), None);
        }
    }

    #[test]
    fn only_initial_reacts_to_start() {
        for state in ALL {
            let expected = (state == SessionState::Initial).then_some(SessionState::Unbound);
            assert_eq!(state.on_action(Action::Start), expected);
        }
    }

    #[test]
    fn names() {
        assert_eq!(SessionState::Authenticating.to_string(), "AUTHENTICATING");
        assert!(SessionState::Stopped.is_terminal());
        assert!(!SessionState::Bound.is_terminal());
    }
}
