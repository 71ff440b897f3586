//! Logged-in identities and their cached credentials.
//!
//! An [`ObjectServerUser`] is shared between every session opened on its
//! behalf, so all mutable state sits behind a single lock.
//!
//! ## Persisted form
//!
//! ```json
//! {
//!   "authUrl": "https://auth.example.com/auth",
//!   "userToken": { "token": "...", "token_data": { ... } },
//!   "realms": [
//!     { "uri": "realm://...", "description": { "accessToken": { ... }, "localPath": "...", "deleteOnLogout": false } }
//!   ]
//! }
//! ```

use crate::error::{AuthError, AuthResult};
use crate::token::{now_ms, Permission, Token};
use crate::util::get_full_server_url;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

/// Access granted to one remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDescription {
    /// Access token for the remote resource.
    pub access_token: Token,
    /// Local resource the remote one is synchronized into.
    pub local_path: String,
    /// Whether the local resource is deleted when the user logs out.
    pub delete_on_logout: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescriptionDocument {
    access_token: JsonValue,
    local_path: String,
    delete_on_logout: bool,
}

#[derive(Serialize, Deserialize)]
struct RealmDocument {
    uri: String,
    description: DescriptionDocument,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserDocument {
    auth_url: String,
    user_token: Option<JsonValue>,
    #[serde(default)]
    realms: Vec<RealmDocument>,
}

impl AccessDescription {
    /// Creates a new access description.
    pub fn new(access_token: Token, local_path: impl Into<String>, delete_on_logout: bool) -> Self {
        Self {
            access_token,
            local_path: local_path.into(),
            delete_on_logout,
        }
    }

    /// Returns the JSON document for this description.
    pub fn to_json(&self) -> AuthResult<JsonValue> {
        Ok(serde_json::to_value(self.to_document())?)
    }

    /// Parses a description from its JSON document.
    pub fn from_json(document: &JsonValue) -> AuthResult<AccessDescription> {
        let doc = DescriptionDocument::deserialize(document)?;
        Self::from_document(doc)
    }

    fn to_document(&self) -> DescriptionDocument {
        DescriptionDocument {
            access_token: self.access_token.to_json(),
            local_path: self.local_path.clone(),
            delete_on_logout: self.delete_on_logout,
        }
    }

    fn from_document(doc: DescriptionDocument) -> AuthResult<AccessDescription> {
        Ok(AccessDescription {
            access_token: Token::from(&doc.access_token)?,
            local_path: doc.local_path,
            delete_on_logout: doc.delete_on_logout,
        })
    }
}

#[derive(Debug, Clone)]
struct UserState {
    refresh_token: Option<Token>,
    realms: BTreeMap<String, AccessDescription>,
    sessions: Vec<String>,
    logged_in: bool,
}

/// A user logged in to the object server.
#[derive(Debug)]
pub struct ObjectServerUser {
    identity: String,
    authentication_url: Url,
    state: RwLock<UserState>,
}

impl ObjectServerUser {
    /// Creates a logged-in user from its refresh token.
    pub fn new(refresh_token: Token, authentication_url: Url) -> Self {
        Self {
            identity: refresh_token.identity().to_string(),
            authentication_url,
            state: RwLock::new(UserState {
                refresh_token: Some(refresh_token),
                realms: BTreeMap::new(),
                sessions: Vec::new(),
                logged_in: true,
            }),
        }
    }

    /// Returns the identity of the user.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the URL of the authentication server that issued the tokens.
    pub fn authentication_url(&self) -> &Url {
        &self.authentication_url
    }

    /// Returns the refresh token, unless it has been cleared.
    pub fn refresh_token(&self) -> Option<Token> {
        self.state.read().refresh_token.clone()
    }

    /// Replaces the refresh token.
    pub fn set_refresh_token(&self, token: Token) {
        self.state.write().refresh_token = Some(token);
    }

    /// Returns true if the user has not logged out.
    pub fn is_logged_in(&self) -> bool {
        self.state.read().logged_in
    }

    /// Returns true if the user is logged in and holds an unexpired refresh token.
    pub fn is_valid(&self) -> bool {
        let state = self.state.read();
        state.logged_in
            && state
                .refresh_token
                .as_ref()
                .is_some_and(|token| token.is_valid())
    }

    /// Returns true if an unexpired access token exists for `server_url`.
    ///
    /// No network call is made.
    pub fn is_authenticated(&self, server_url: &Url) -> bool {
        let now = now_ms();
        self.state
            .read()
            .realms
            .get(server_url.as_str())
            .is_some_and(|desc| desc.access_token.is_valid_at(now))
    }

    /// Returns the access token cached for `server_url`.
    pub fn access_token(&self, server_url: &Url) -> Option<Token> {
        self.state
            .read()
            .realms
            .get(server_url.as_str())
            .map(|desc| desc.access_token.clone())
    }

    /// Stores the access description for `uri`, replacing any previous one.
    pub fn add_realm(&self, uri: &Url, description: AccessDescription) {
        self.state
            .write()
            .realms
            .insert(uri.as_str().to_string(), description);
    }

    /// Stores a long-lived access token granting every permission on `uri`.
    ///
    /// A `/~/` segment in `uri` is replaced by the user's identity.
    pub fn add_realm_with_token(
        &self,
        uri: &str,
        access_token: &str,
        local_path: &str,
        delete_on_logout: bool,
    ) -> AuthResult<()> {
        if uri.is_empty() {
            return Err(AuthError::IllegalArgument("non-empty 'uri' required".into()));
        }
        if access_token.is_empty() {
            return Err(AuthError::IllegalArgument(
                "non-empty 'accessToken' required".into(),
            ));
        }

        let resolved = get_full_server_url(uri, &self.identity)?;
        let token = Token::new(
            access_token,
            self.identity.clone(),
            Some(resolved.path().to_string()),
            i64::MAX,
            Permission::ALL.to_vec(),
        );
        self.add_realm(&resolved, AccessDescription::new(token, local_path, delete_on_logout));
        Ok(())
    }

    /// Removes the access description for `uri`.
    pub fn remove_realm(&self, uri: &Url) -> Option<AccessDescription> {
        self.state.write().realms.remove(uri.as_str())
    }

    /// Returns every cached access description.
    pub fn realms(&self) -> Vec<AccessDescription> {
        self.state.read().realms.values().cloned().collect()
    }

    /// Marks the user as logged out. Cached tokens are kept.
    pub fn local_logout(&self) {
        self.state.write().logged_in = false;
    }

    /// Drops every access token and the refresh token.
    pub fn clear_tokens(&self) {
        let mut state = self.state.write();
        state.realms.clear();
        state.refresh_token = None;
    }

    /// Records a session opened on behalf of this user.
    pub fn register_session(&self, local_path: &str) {
        let mut state = self.state.write();
        if !state.sessions.iter().any(|path| path == local_path) {
            state.sessions.push(local_path.to_string());
        }
    }

    /// Forgets a session opened on behalf of this user.
    pub fn unregister_session(&self, local_path: &str) {
        self.state.write().sessions.retain(|path| path != local_path);
    }

    /// Returns the local paths of the user's active sessions.
    pub fn session_paths(&self) -> Vec<String> {
        self.state.read().sessions.clone()
    }

    /// Serializes the user, including every access description.
    ///
    /// Fails with [`AuthError::IllegalState`] once the tokens have been
    /// cleared, since the document could not be restored.
    pub fn to_json(&self) -> AuthResult<String> {
        let state = self.state.read();
        let refresh_token = state.refresh_token.as_ref().ok_or_else(|| {
            AuthError::IllegalState(format!("user '{}' has no refresh token", self.identity))
        })?;
        let doc = UserDocument {
            auth_url: self.authentication_url.to_string(),
            user_token: Some(refresh_token.to_json()),
            realms: state
                .realms
                .iter()
                .map(|(uri, desc)| RealmDocument {
                    uri: uri.clone(),
                    description: desc.to_document(),
                })
                .collect(),
        };
        Ok(serde_json::to_string(&doc)?)
    }

    /// Restores a user serialized with [`ObjectServerUser::to_json`].
    ///
    /// The user is only built once the whole document has been read.
    pub fn from_json(json: &str) -> AuthResult<ObjectServerUser> {
        let doc: UserDocument = serde_json::from_str(json)?;
        let auth_url = Url::parse(&doc.auth_url).map_err(|source| AuthError::InvalidUrl {
            url: doc.auth_url.clone(),
            source,
        })?;
        let user_token = doc
            .user_token
            .ok_or_else(|| AuthError::IllegalArgument("missing 'userToken'".into()))?;
        let refresh_token = Token::from(&user_token)?;

        let mut realms = BTreeMap::new();
        for realm in doc.realms {
            realms.insert(realm.uri, AccessDescription::from_document(realm.description)?);
        }

        debug!(identity = refresh_token.identity(), realms = realms.len(), "restored user");
        let user = ObjectServerUser::new(refresh_token, auth_url);
        user.state.write().realms = realms;
        Ok(user)
    }
}

impl PartialEq for ObjectServerUser {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        if self.identity != other.identity || self.authentication_url != other.authentication_url {
            return false;
        }
        let mine = self.state.read();
        let theirs = other.state.read();
        mine.refresh_token == theirs.refresh_token && mine.realms == theirs.realms
    }
}

impl Eq for ObjectServerUser {}
