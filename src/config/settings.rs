use config::{Config, ConfigError, Environment, File};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::env;

/// Default audience for Azure Database for PostgreSQL access tokens.
pub const DEFAULT_TOKEN_SCOPE: &str = "https://ossrdbms-aad.database.windows.net/.default";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseSettings,
    pub identity: IdentitySettings,
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Raw database settings as read from the environment.
///
/// Required fields are optional here on purpose: presence is validated by
/// [`DbConfig::new`](super::DbConfig::new) so that a missing value surfaces
/// as a misconfiguration error rather than a deserialization failure.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// POSTGRES_SERVER
    pub server: Option<String>,
    /// POSTGRES_PORT
    #[serde(default = "default_db_port")]
    pub port: u16,
    /// POSTGRES_DB
    pub db: Option<String>,
    /// POSTGRES_USER
    pub user: Option<String>,
    /// POSTGRES_PASSWORD
    pub password: Option<String>,
    /// POSTGRES_ENCRYPTION_KEY
    pub encryption_key: Option<String>,
    /// POSTGRES_CONNECTION_STRING
    pub connection_string: Option<String>,
    /// Audience requested from the identity provider
    #[serde(default = "default_token_scope")]
    pub token_scope: String,
    /// Maximum number of pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Idle connections are closed after this many seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    /// How long a single borrow may wait for a free connection
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_seconds: u64,
    /// Borrow attempts before giving up
    #[serde(default = "default_acquire_attempts")]
    pub acquire_attempts: u32,
}

/// Azure identity settings (AZURE_* and the App Service IDENTITY_* pair).
#[derive(Debug, Clone, Deserialize)]
pub struct IdentitySettings {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_authority_host")]
    pub authority_host: String,
    /// App Service managed identity endpoint (IDENTITY_ENDPOINT)
    #[serde(default)]
    pub endpoint: Option<String>,
    /// App Service managed identity header (IDENTITY_HEADER)
    #[serde(default)]
    pub header: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_port() -> u16 {
    5432
}

fn default_token_scope() -> String {
    DEFAULT_TOKEN_SCOPE.to_string()
}

fn default_max_connections() -> u32 {
    30
}

fn default_idle_timeout() -> u64 {
    180 // 3 minutes
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_acquire_attempts() -> u32 {
    3
}

fn default_authority_host() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        Ok(Self {
            server: load_section("SERVER", &run_mode)?,
            database: load_section("POSTGRES", &run_mode)?,
            identity: load_identity(&run_mode)?,
            otel: load_section("OTEL", &run_mode)?,
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Build one settings section from `config/<section>[-<run_mode>]` files and
/// `<PREFIX>_*` environment variables. Keys keep their underscores, so
/// `POSTGRES_ENCRYPTION_KEY` maps to `encryption_key`.
fn load_section<T: DeserializeOwned>(prefix: &str, run_mode: &str) -> Result<T, ConfigError> {
    build_section(prefix, run_mode, Environment::with_prefix(prefix))
}

// Environment values stay strings: numeric fields are converted while
// deserializing, so secrets such as "007" keep their leading zeros.
fn build_section<T: DeserializeOwned>(
    prefix: &str,
    run_mode: &str,
    environment: Environment,
) -> Result<T, ConfigError> {
    let section = prefix.to_lowercase();

    Config::builder()
        .add_source(File::with_name(&format!("config/{}", section)).required(false))
        .add_source(File::with_name(&format!("config/{}-{}", section, run_mode)).required(false))
        .add_source(environment)
        .build()?
        .try_deserialize()
}

/// Identity settings come from two prefixes: the `AZURE_*` service principal
/// variables and the `IDENTITY_*` pair injected by App Service.
fn load_identity(run_mode: &str) -> Result<IdentitySettings, ConfigError> {
    let mut identity: IdentitySettings = load_section("AZURE", run_mode)?;
    let app_service: AppServiceIdentity = load_section("IDENTITY", run_mode)?;
    identity.endpoint = app_service.endpoint;
    identity.header = app_service.header;
    Ok(identity)
}

#[derive(Debug, Deserialize)]
struct AppServiceIdentity {
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    header: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Every pool tunable at its default, no connection details filled in.
impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            server: None,
            port: default_db_port(),
            db: None,
            user: None,
            password: None,
            encryption_key: None,
            connection_string: None,
            token_scope: default_token_scope(),
            max_connections: default_max_connections(),
            idle_timeout_seconds: default_idle_timeout(),
            acquire_timeout_seconds: default_acquire_timeout(),
            acquire_attempts: default_acquire_attempts(),
        }
    }
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            tenant_id: None,
            client_id: None,
            client_secret: None,
            authority_host: default_authority_host(),
            endpoint: None,
            header: None,
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8080);
    }

    #[test]
    fn test_database_defaults() {
        let db = DatabaseSettings::default();
        assert_eq!(db.port, 5432);
        assert_eq!(db.max_connections, 30);
        assert_eq!(db.idle_timeout_seconds, 180);
        assert_eq!(db.acquire_attempts, 3);
        assert_eq!(db.token_scope, DEFAULT_TOKEN_SCOPE);
        assert!(db.server.is_none());
        assert!(db.encryption_key.is_none());
    }

    #[test]
    fn test_database_section_deserializes_with_defaults() {
        let db: DatabaseSettings = Config::builder()
            .set_override("server", "db.local")
            .unwrap()
            .set_override("user", "svc")
            .unwrap()
            .set_override("encryption_key", "k1")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(db.server.as_deref(), Some("db.local"));
        assert_eq!(db.user.as_deref(), Some("svc"));
        assert_eq!(db.encryption_key.as_deref(), Some("k1"));
        assert_eq!(db.port, 5432);
        assert_eq!(db.max_connections, 30);
        assert!(db.password.is_none());
    }

    fn env_map(vars: &[(&str, &str)]) -> config::Map<String, String> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_numeric_looking_secrets_are_kept_verbatim() {
        let vars = env_map(&[
            ("POSTGRES_SERVER", "db.local"),
            ("POSTGRES_USER", "0042"),
            ("POSTGRES_PASSWORD", "007"),
            ("POSTGRES_ENCRYPTION_KEY", "0123456789"),
            ("POSTGRES_PORT", "6432"),
            ("POSTGRES_MAX_CONNECTIONS", "10"),
        ]);

        let db: DatabaseSettings = build_section(
            "POSTGRES",
            "test",
            Environment::with_prefix("POSTGRES").source(Some(vars)),
        )
        .unwrap();

        assert_eq!(db.user.as_deref(), Some("0042"));
        assert_eq!(db.password.as_deref(), Some("007"));
        assert_eq!(db.encryption_key.as_deref(), Some("0123456789"));
        assert_eq!(db.port, 6432);
        assert_eq!(db.max_connections, 10);
    }

    #[test]
    fn test_env_strings_convert_to_typed_fields() {
        let vars = env_map(&[("OTEL_ENABLED", "true"), ("OTEL_SAMPLING_RATIO", "0.25")]);

        let otel: OtelConfig = build_section(
            "OTEL",
            "test",
            Environment::with_prefix("OTEL").source(Some(vars)),
        )
        .unwrap();

        assert!(otel.enabled);
        assert_eq!(otel.sampling_ratio, 0.25);
    }

    #[test]
    fn test_otel_disabled_by_default() {
        let otel = OtelConfig::default();
        assert!(!otel.enabled);
        assert_eq!(otel.sampling_ratio, 1.0);
    }
}
