//! # ObjSync Auth
//!
//! Credential bookkeeping for the object server sync client.
//!
//! This crate provides:
//! - `Token` access/refresh credentials and their JSON form
//! - `ObjectServerUser` with cached per-resource access tokens
//! - The error-code catalog reported by servers and the native sync client
//! - The `AuthenticationServer` contract used to obtain access tokens
//! - `/~/` placeholder resolution for server URLs
//!
//! This crate performs no I/O of its own.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod error;
mod server;
mod token;
mod user;
pub mod util;

pub use error::{AuthError, AuthResult, ErrorCategory, ErrorCode, ObjectServerError};
pub use server::{AuthenticateResponse, AuthenticationServer, MockAuthServer};
pub use token::{Permission, Token};
pub use user::{AccessDescription, ObjectServerUser};
pub use url::Url;
