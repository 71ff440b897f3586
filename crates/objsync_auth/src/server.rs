//! Authentication server abstraction.

use crate::error::{ErrorCode, ObjectServerError};
use crate::token::{Permission, Token};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;

/// Outcome of a request to the authentication server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticateResponse {
    /// The server issued an access token.
    Success {
        /// Access token for the requested resource.
        access_token: Token,
    },
    /// The server refused the request or could not be reached.
    Failure(ObjectServerError),
}

impl AuthenticateResponse {
    /// Creates a successful response.
    pub fn from_token(access_token: Token) -> Self {
        Self::Success { access_token }
    }

    /// Creates a failed response.
    pub fn from_error(error: ObjectServerError) -> Self {
        Self::Failure(error)
    }

    /// Returns true if an access token was issued.
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Converts the response into a `Result`.
    pub fn into_result(self) -> Result<Token, ObjectServerError> {
        match self {
            Self::Success { access_token } => Ok(access_token),
            Self::Failure(error) => Err(error),
        }
    }
}

/// Exchanges refresh tokens for access tokens.
///
/// Calls are synchronous; callers run them on a background executor.
pub trait AuthenticationServer: Send + Sync {
    /// Requests an access token for `server_url` on behalf of the owner of `refresh_token`.
    fn login_to_realm(
        &self,
        refresh_token: &Token,
        server_url: &Url,
        authentication_url: &Url,
    ) -> AuthenticateResponse;
}

/// A scripted authentication server for testing.
///
/// Queued responses are returned in order. Once the queue is empty a fresh
/// token is issued for every request.
#[derive(Debug, Default)]
pub struct MockAuthServer {
    responses: Mutex<VecDeque<AuthenticateResponse>>,
    requests: AtomicUsize,
}

impl MockAuthServer {
    /// Creates a mock server that grants every request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the next response.
    pub fn push_response(&self, response: AuthenticateResponse) {
        self.responses.lock().push_back(response);
    }

    /// Queues a failure with the given code.
    pub fn push_error(&self, code: ErrorCode, message: &str) {
        self.push_response(AuthenticateResponse::from_error(ObjectServerError::new(
            code, message,
        )));
    }

    /// Returns the number of requests served.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl AuthenticationServer for MockAuthServer {
    fn login_to_realm(
        &self,
        refresh_token: &Token,
        server_url: &Url,
        _authentication_url: &Url,
    ) -> AuthenticateResponse {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(response) = self.responses.lock().pop_front() {
            return response;
        }
        AuthenticateResponse::from_token(Token::new(
            uuid::Uuid::new_v4().to_string(),
            refresh_token.identity(),
            Some(server_url.path().to_string()),
            i64::MAX,
            vec![Permission::Upload, Permission::Download],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls() -> (Url, Url) {
        (
            Url::parse("realm://sync.example.com/u/default").unwrap(),
            Url::parse("https://auth.example.com/auth").unwrap(),
        )
    }

    #[test]
    fn mock_issues_tokens_by_default() {
        let server = MockAuthServer::new();
        let (remote, auth) = urls();
        let refresh = Token::new("r", "u", None, i64::MAX, vec![Permission::Refresh]);

        let token = server
            .login_to_realm(&refresh, &remote, &auth)
            .into_result()
            .unwrap();
        assert_eq!(token.identity(), "u");
        assert_eq!(token.path(), Some("/u/default"));
        assert_eq!(server.request_count(), 1);
    }

    #[test]
    fn mock_replays_queued_responses() {
        let server = MockAuthServer::new();
        server.push_error(ErrorCode::AccessDenied, "no access");
        let (remote, auth) = urls();
        let refresh = Token::new("r", "u", None, i64::MAX, vec![]);

        let response = server.login_to_realm(&refresh, &remote, &auth);
        assert!(!response.is_valid());
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code(), ErrorCode::AccessDenied);

        assert!(server.login_to_realm(&refresh, &remote, &auth).is_valid());
    }
}
