//! URL helpers shared by users and sessions.

use crate::error::{AuthError, AuthResult};
use url::Url;

/// Path segment replaced by the identity of the user opening a resource.
pub const USER_PLACEHOLDER: &str = "/~/";

/// Replaces the `/~/` placeholder in `server_url` with `/{user_identity}/`.
///
/// Fails with [`AuthError::InvalidUrl`] if the result is not a valid URL.
pub fn get_full_server_url(server_url: &str, user_identity: &str) -> AuthResult<Url> {
    let resolved = server_url.replacen(USER_PLACEHOLDER, &format!("/{user_identity}/"), 1);
    Url::parse(&resolved).map_err(|source| AuthError::InvalidUrl {
        url: resolved,
        source,
    })
}
