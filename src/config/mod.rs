mod db_config;
mod settings;

pub use db_config::{mask_password, DbConfig};
pub use settings::{
    DatabaseSettings, IdentitySettings, OtelConfig, ServerConfig, Settings, DEFAULT_TOKEN_SCOPE,
};
