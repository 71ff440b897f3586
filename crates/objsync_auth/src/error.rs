//! Error types for tokens, users and the authentication server.

use std::fmt;
use thiserror::Error;

/// Result type for authentication and bookkeeping operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors raised by the token and user bookkeeping layer.
#[derive(Error, Debug)]
pub enum AuthError {
    /// A required argument was missing or empty.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// A server URL could not be parsed after placeholder substitution.
    #[error("could not build a valid URL from '{url}': {source}")]
    InvalidUrl {
        /// The URL after substitution.
        url: String,
        /// Underlying parse failure.
        #[source]
        source: url::ParseError,
    },

    /// A persisted document could not be read or written.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The operation is not valid in the current state.
    #[error("illegal state: {0}")]
    IllegalState(String),
}

/// How an [`ObjectServerError`] should be handled by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The session cannot continue.
    Fatal,
    /// The session can retry after unbinding.
    Recoverable,
}

macro_rules! error_codes {
    ($( $(#[$doc:meta])* $name:ident = $value:expr, $category:ident; )*) => {
        /// Error codes reported by the sync client, the object server and the
        /// authentication server.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ErrorCode {
            $( $(#[$doc])* $name, )*
        }

        impl ErrorCode {
            /// Returns the numeric value of this code.
            pub fn int_value(self) -> i32 {
                match self {
                    $( ErrorCode::$name => $value, )*
                }
            }

            /// Returns how a session should react to this code.
            pub fn category(self) -> ErrorCategory {
                match self {
                    $( ErrorCode::$name => ErrorCategory::$category, )*
                }
            }

            /// Maps a numeric code to an `ErrorCode`, falling back to `Unknown`.
            pub fn from_int(value: i32) -> ErrorCode {
                match value {
                    $( v if v == $value => ErrorCode::$name, )*
                    _ => ErrorCode::Unknown,
                }
            }
        }
    };
}

error_codes! {
    /// Catch-all for codes this client does not know.
    Unknown = -1, Fatal;
    /// I/O failure while talking to a server.
    IoException = -2, Recoverable;
    /// A server response could not be parsed.
    JsonException = -3, Fatal;

    /// Connection closed (no error).
    ConnectionClosed = 100, Recoverable;
    /// Other connection level error.
    OtherError = 101, Fatal;
    /// Unknown type of input message.
    UnknownMessage = 102, Fatal;
    /// Bad syntax in input message head.
    BadSyntax = 103, Fatal;
    /// Limits exceeded in input message.
    LimitsExceeded = 104, Fatal;
    /// Wrong protocol version.
    WrongProtocolVersion = 105, Fatal;
    /// Bad session identifier in input message.
    BadSessionIdent = 106, Fatal;
    /// Overlapping reuse of session identifier.
    ReuseOfSessionIdent = 107, Fatal;
    /// Client file bound in other session.
    BoundInOtherSession = 108, Fatal;
    /// Bad input message order.
    BadMessageOrder = 109, Fatal;
    /// Error in decompression.
    BadDecompression = 110, Fatal;
    /// Bad server version in changeset header.
    BadChangesetHeaderSyntax = 111, Fatal;
    /// Bad size specified in changeset header.
    BadChangesetSize = 112, Fatal;
    /// Bad changesets.
    BadChangesets = 113, Fatal;

    /// Session closed (no error).
    SessionClosed = 200, Recoverable;
    /// Other session level error.
    OtherSessionError = 201, Recoverable;
    /// Access token expired.
    TokenExpired = 202, Recoverable;
    /// Bad user authentication.
    BadAuthentication = 203, Fatal;
    /// Illegal remote path.
    IllegalRealmPath = 204, Fatal;
    /// No such remote resource.
    NoSuchPath = 205, Fatal;
    /// Permission denied.
    PermissionDenied = 206, Fatal;
    /// Bad server file identifier.
    BadServerFileIdent = 207, Fatal;
    /// Bad client file identifier.
    BadClientFileIdent = 208, Fatal;
    /// Bad server version.
    BadServerVersion = 209, Fatal;
    /// Bad client version.
    BadClientVersion = 210, Fatal;
    /// Diverging histories.
    DivergingHistories = 211, Fatal;
    /// Bad changeset.
    BadChangeset = 212, Fatal;
    /// Disabled session.
    DisabledSession = 213, Fatal;
    /// Partial sync disabled.
    PartialSyncDisabled = 214, Fatal;
    /// Unsupported session-level feature.
    UnsupportedSessionFeature = 215, Fatal;
    /// Bad origin file identifier.
    BadOriginFileIdent = 216, Fatal;
    /// Synchronization no longer possible for the client-side file.
    BadClientFile = 217, Fatal;
    /// Server file was deleted while the session was bound to it.
    ServerFileDeleted = 218, Fatal;
    /// Client file has been blacklisted.
    ClientFileBlacklisted = 219, Fatal;
    /// User has been blacklisted.
    UserBlacklisted = 220, Fatal;
    /// Serialized transaction before upload completion.
    TransactBeforeUpload = 221, Fatal;
    /// Client file has expired.
    ClientFileExpired = 222, Fatal;
    /// User mismatch for client file identifier.
    UserMismatch = 223, Fatal;
    /// Too many sessions in connection.
    TooManySessions = 224, Fatal;
    /// Invalid schema change.
    InvalidSchemaChange = 225, Fatal;

    /// HTTP 400.
    HttpBadRequest = 400, Fatal;
    /// HTTP 401.
    Unauthorized = 401, Fatal;
    /// HTTP 403.
    Forbidden = 403, Fatal;
    /// HTTP 404.
    NotFound = 404, Fatal;
    /// HTTP 408.
    RequestTimeout = 408, Recoverable;
    /// HTTP 500.
    InternalServerError = 500, Recoverable;
    /// HTTP 502.
    BadGateway = 502, Recoverable;
    /// HTTP 503.
    ServiceUnavailable = 503, Recoverable;

    /// Generic authentication server failure.
    OtherAuthError = 600, Fatal;
    /// Invalid request parameters.
    InvalidParameters = 601, Fatal;
    /// Missing request parameters.
    MissingParameters = 602, Fatal;
    /// Wrong credentials.
    InvalidCredentials = 611, Fatal;
    /// Unknown account.
    UnknownAccount = 612, Fatal;
    /// Account already exists.
    ExistingAccount = 613, Fatal;
    /// Access denied to the requested resource.
    AccessDenied = 614, Fatal;
    /// The refresh token has expired.
    ExpiredRefreshToken = 615, Fatal;
    /// The host is not valid for the authentication server.
    InvalidHost = 616, Fatal;
}

/// An error reported by a remote server or the native sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectServerError {
    code: ErrorCode,
    message: String,
}

impl ObjectServerError {
    /// Creates a new error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Builds an error from the numeric code delivered by the native layer.
    pub fn from_native(code: i32, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::from_int(code), message)
    }

    /// Returns the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the category of the underlying code.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Returns true if the error is fatal for the session.
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Fatal
    }
}

impl fmt::Display for ObjectServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}({}): {}",
            self.code,
            self.code.int_value(),
            self.message
        )
    }
}

impl std::error::Error for ObjectServerError {}
