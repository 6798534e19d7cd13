//! ytcipher Common Types
//!
//! Shared infrastructure for the ytcipher service:
//!
//! - [`error`] - The `CipherError` taxonomy and its HTTP status mapping
//! - [`auth`] - Optional API-token authentication with constant-time
//!   comparison
//! - [`player_url`] - Player URL validation/normalization and the cache-key
//!   policy for on-disk player files

pub mod auth;
pub mod error;
pub mod player_url;

pub use auth::AuthConfig;
pub use error::{CipherError, Result};
pub use player_url::KeyMode;
