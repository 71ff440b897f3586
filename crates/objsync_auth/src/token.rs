//! Signed access and refresh credentials.
//!
//! The JSON form is the one issued by the authentication server:
//!
//! ```json
//! {
//!   "token": "<opaque value>",
//!   "token_data": {
//!     "identity": "...",
//!     "path": "/...",
//!     "expires": 1816358184,
//!     "access": ["upload", "download"],
//!     "is_admin": false
//!   }
//! }
//! ```

use crate::error::AuthResult;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// A capability granted by a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Upload changes to the remote resource.
    Upload,
    /// Download changes from the remote resource.
    Download,
    /// Use the token to obtain new access tokens.
    Refresh,
    /// Manage the remote resource.
    Manage,
    /// A capability this client does not recognise.
    Unknown,
}

impl Permission {
    /// All capabilities a client can be granted.
    pub const ALL: [Permission; 4] = [
        Permission::Upload,
        Permission::Download,
        Permission::Refresh,
        Permission::Manage,
    ];

    /// Returns the wire name of the permission.
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Upload => "upload",
            Permission::Download => "download",
            Permission::Refresh => "refresh",
            Permission::Manage => "manage",
            Permission::Unknown => "unknown",
        }
    }

    /// Parses a wire name. Names this client does not know map to `Unknown`.
    pub fn from_name(name: &str) -> Permission {
        match name.to_ascii_lowercase().as_str() {
            "upload" => Permission::Upload,
            "download" => Permission::Download,
            "refresh" => Permission::Refresh,
            "manage" => Permission::Manage,
            _ => Permission::Unknown,
        }
    }
}

/// Immutable credential issued by the authentication server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    value: String,
    identity: String,
    path: Option<String>,
    expires_sec: i64,
    permissions: Vec<Permission>,
    is_admin: bool,
}

#[derive(Deserialize)]
struct TokenDocument {
    token: String,
    token_data: TokenData,
}

#[derive(Deserialize)]
struct TokenData {
    identity: String,
    #[serde(default)]
    path: Option<String>,
    expires: i64,
    #[serde(default)]
    access: Vec<String>,
    #[serde(default)]
    is_admin: bool,
}

impl Token {
    /// Creates a new token.
    pub fn new(
        value: impl Into<String>,
        identity: impl Into<String>,
        path: Option<String>,
        expires_sec: i64,
        permissions: Vec<Permission>,
    ) -> Self {
        Self {
            value: value.into(),
            identity: identity.into(),
            path,
            expires_sec,
            permissions,
            is_admin: false,
        }
    }

    /// Marks the token as belonging to an administrator.
    pub fn with_admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }

    /// Parses a token from its JSON document.
    ///
    /// Unrecognised permission names become [`Permission::Unknown`] and a
    /// missing `is_admin` flag defaults to `false`.
    #[allow(clippy::should_implement_trait)]
    pub fn from(document: &JsonValue) -> AuthResult<Token> {
        let doc = TokenDocument::deserialize(document)?;
        Ok(Self::from_document(doc))
    }

    /// Parses a token from a JSON string.
    pub fn from_json(json: &str) -> AuthResult<Token> {
        let doc: TokenDocument = serde_json::from_str(json)?;
        Ok(Self::from_document(doc))
    }

    fn from_document(doc: TokenDocument) -> Token {
        let data = doc.token_data;
        Token {
            value: doc.token,
            identity: data.identity,
            path: data.path,
            expires_sec: data.expires,
            permissions: data
                .access
                .iter()
                .map(|name| {
                    let permission = Permission::from_name(name);
                    if permission == Permission::Unknown {
                        debug!(name = %name, "unrecognised token permission");
                    }
                    permission
                })
                .collect(),
            is_admin: data.is_admin,
        }
    }

    /// Returns the JSON document for this token.
    pub fn to_json(&self) -> JsonValue {
        serde_json::json!({
            "token": self.value,
            "token_data": {
                "identity": self.identity,
                "path": self.path,
                "expires": self.expires_sec,
                "access": self.permissions.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
                "is_admin": self.is_admin,
            }
        })
    }

    /// Returns the opaque credential.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns the identity the token was issued to.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the resource path the token authorizes, if any.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns the expiry in epoch seconds.
    pub fn expires_sec(&self) -> i64 {
        self.expires_sec
    }

    /// Returns the expiry in epoch milliseconds, saturating at `i64::MAX`.
    pub fn expires_ms(&self) -> i64 {
        self.expires_sec.saturating_mul(1000)
    }

    /// Returns the granted permissions in the order they were issued.
    pub fn permissions(&self) -> &[Permission] {
        &self.permissions
    }

    /// Returns true if the token grants `permission`.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Returns true if the token belongs to an administrator.
    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    /// Returns true if the token expires after `now_ms`.
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        self.expires_ms() > now_ms
    }

    /// Returns true if the token has not expired yet.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(now_ms())
    }
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Token {
        Token::new(
            "token_value",
            "user-1",
            None,
            1_816_358_184,
            vec![Permission::Download, Permission::Upload, Permission::Manage],
        )
        .with_admin(true)
    }

    #[test]
    fn json_round_trip() {
        let token = sample();
        let parsed = Token::from(&token.to_json()).unwrap();
        assert_eq!(parsed, token);
        assert_eq!(
            parsed.permissions(),
            &[Permission::Download, Permission::Upload, Permission::Manage]
        );
        assert!(parsed.path().is_none());
    }

    #[test]
    fn unknown_permissions_and_missing_admin_flag() {
        let json = r#"{"token":"abc","token_data":{"identity":"id","path":"","expires":10,"access":["refresh","teleport"]}}"#;
        let token = Token::from_json(json).unwrap();
        assert_eq!(token.permissions(), &[Permission::Refresh, Permission::Unknown]);
        assert!(!token.is_admin());
        assert_eq!(token.path(), Some(""));
    }

    #[test]
    fn malformed_document_is_rejected() {
        let json = r#"{"token":"abc"}"#;
        assert!(Token::from_json(json).is_err());
    }

    #[test]
    fn expires_ms_saturates() {
        let token = Token::new("v", "id", None, i64::MAX, vec![]);
        assert_eq!(token.expires_ms(), i64::MAX);
        assert!(token.is_valid());

        let token = Token::new("v", "id", None, i64::MAX / 1000 + 1, vec![]);
        assert_eq!(token.expires_ms(), i64::MAX);
    }

    #[test]
    fn expired_token_is_not_valid() {
        let token = Token::new("v", "id", None, 1, vec![]);
        assert!(!token.is_valid());
        assert!(token.is_valid_at(999));
        assert!(!token.is_valid_at(1000));
    }

    proptest! {
        #[test]
        fn expires_ms_never_wraps(expires in 0i64..=i64::MAX) {
            let token = Token::new("v", "id", None, expires, vec![]);
            prop_assert!(token.expires_ms() >= expires);
        }
    }
}
