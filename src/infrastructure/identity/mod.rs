//! Identity-based database authentication.
//!
//! Provides access tokens that stand in for a static database password.

mod credential;
mod token;

pub use credential::{ClientSecretCredential, DefaultCredential, ManagedIdentityCredential};
pub use token::{AccessToken, IdentityError, TokenProvider, DEFAULT_REFRESH_SKEW_SECONDS};
