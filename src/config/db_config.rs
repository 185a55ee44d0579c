//! Database configuration and connection string resolution.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::ServiceError;
use crate::infrastructure::identity::{AccessToken, TokenProvider};
use crate::infrastructure::postgres::{PoolEvents, TracingEvents};

use super::DatabaseSettings;

const MISSING_SERVER_OR_USER: &str =
    "Please set the environment variables POSTGRES_SERVER, POSTGRES_USER";
const MISSING_ENCRYPTION_KEY: &str = "Please set the environment variable POSTGRES_ENCRYPTION_KEY";

/// Validated database configuration.
///
/// Immutable after construction except for the memoized access token used
/// when no static password is configured.
pub struct DbConfig {
    host: Option<String>,
    port: u16,
    database: Option<String>,
    user: Option<String>,
    password: Option<String>,
    encryption_key: String,
    connection_string: Option<String>,
    token_scope: String,
    token_provider: Arc<dyn TokenProvider>,
    token: Mutex<Option<AccessToken>>,
    events: Arc<dyn PoolEvents>,
}

/// Trim and drop empty values.
fn normalize(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl DbConfig {
    pub fn new(
        settings: DatabaseSettings,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Result<Self, ServiceError> {
        let host = normalize(settings.server);
        let user = normalize(settings.user);
        let connection_string = normalize(settings.connection_string);

        if connection_string.is_none() && (host.is_none() || user.is_none()) {
            return Err(ServiceError::misconfigured(MISSING_SERVER_OR_USER));
        }

        let encryption_key = normalize(settings.encryption_key)
            .ok_or_else(|| ServiceError::misconfigured(MISSING_ENCRYPTION_KEY))?;

        Ok(Self {
            host,
            port: settings.port,
            database: normalize(settings.db),
            user,
            password: normalize(settings.password),
            encryption_key,
            connection_string,
            token_scope: settings.token_scope.trim().to_string(),
            token_provider,
            token: Mutex::new(None),
            events: Arc::new(TracingEvents),
        })
    }

    /// Report credential events through `events`, normally the same sink the
    /// pool manager uses.
    pub fn with_events(mut self, events: Arc<dyn PoolEvents>) -> Self {
        self.events = events;
        self
    }

    /// Key used by callers for field-level decryption.
    pub fn encryption_key(&self) -> &str {
        &self.encryption_key
    }

    /// True when the password comes from the identity provider.
    pub fn uses_identity_auth(&self) -> bool {
        self.connection_string.is_none() && self.password.is_none()
    }

    /// Produce the connection string, fetching an access token first when
    /// no static password is configured.
    ///
    /// The token is memoized until it is due for refresh, so repeated calls
    /// hit the identity provider once per token lifetime.
    pub async fn resolve_connection_string(&self) -> Result<String, ServiceError> {
        if let Some(connection_string) = &self.connection_string {
            return Ok(connection_string.clone());
        }

        let password = match &self.password {
            Some(password) => password.clone(),
            None => self.access_token().await?,
        };

        Ok(format!(
            "postgresql://{}:{}@{}:{}/{}",
            urlencoding::encode(self.user.as_deref().unwrap_or_default()),
            urlencoding::encode(&password),
            self.host.as_deref().unwrap_or_default(),
            self.port,
            self.database.as_deref().unwrap_or_default(),
        ))
    }

    async fn access_token(&self) -> Result<String, ServiceError> {
        let mut cached = self.token.lock().await;

        if let Some(token) = cached.as_ref() {
            if !token.needs_refresh() {
                return Ok(token.secret().to_string());
            }
            self.events.info(&format!(
                "Access token expiring at {} due for refresh",
                token.expires_on()
            ));
        }

        let token = self
            .token_provider
            .get_token(&self.token_scope)
            .await
            .map_err(|e| {
                self.events.error(&format!("Failed to obtain database access token: {}", e));
                ServiceError::unavailable(format!("Error obtaining database access token: {}", e))
            })?;

        self.events.info("Using Postgres Entra Authorization");

        let secret = token.secret().to_string();
        *cached = Some(token);
        Ok(secret)
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connection_string", &self.connection_string.as_deref().map(mask_password))
            .field("token_scope", &self.token_scope)
            .finish_non_exhaustive()
    }
}

/// Mask the password in a connection string for safe logging.
///
/// Handles both URLs (`postgresql://user:pw@host/db`) and keyword/value
/// strings (`host=h password=pw`).
pub fn mask_password(url: &str) -> String {
    let Some(scheme_end) = url.find("://").map(|p| p + 3) else {
        return mask_keyword_password(url);
    };

    if let Some(at_pos) = url.rfind('@').filter(|&at| at > scheme_end) {
        if let Some(colon_pos) = url[scheme_end..at_pos].find(':') {
            let prefix = &url[..scheme_end + colon_pos + 1];
            let suffix = &url[at_pos..];
            return format!("{}***{}", prefix, suffix);
        }
    }
    url.to_string()
}

fn mask_keyword_password(dsn: &str) -> String {
    let mut masked = Vec::new();
    let mut in_quoted_password = false;

    for token in dsn.split_whitespace() {
        if in_quoted_password {
            // Rest of a quoted value containing spaces
            in_quoted_password = !token.ends_with('\'');
            continue;
        }

        match token.split_once('=') {
            Some((key, value)) if key.eq_ignore_ascii_case("password") => {
                in_quoted_password =
                    value.starts_with('\'') && (value.len() == 1 || !value.ends_with('\''));
                masked.push("password=***".to_string());
            }
            _ => masked.push(token.to_string()),
        }
    }

    masked.join(" ")
}
