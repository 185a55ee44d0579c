//! Access tokens and the provider boundary.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// Tokens are refreshed this long before they actually expire.
pub const DEFAULT_REFRESH_SKEW_SECONDS: i64 = 300;

/// Errors returned by identity providers.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    #[error("No credential available: {0}")]
    Unavailable(String),
}

/// A bearer token with its expiry.
#[derive(Clone)]
pub struct AccessToken {
    secret: String,
    expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            secret: secret.into(),
            expires_on,
        }
    }

    /// Token valid for `seconds` from now.
    pub fn expiring_in(secret: impl Into<String>, seconds: i64) -> Self {
        Self::new(secret, Utc::now() + Duration::seconds(seconds))
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expires_on(&self) -> DateTime<Utc> {
        self.expires_on
    }

    /// True once `now` is within `skew` of expiry.
    pub fn needs_refresh_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now + skew >= self.expires_on
    }

    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh_at(Utc::now(), Duration::seconds(DEFAULT_REFRESH_SKEW_SECONDS))
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"***")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Source of bearer tokens for a given scope.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, IdentityError>;
}
