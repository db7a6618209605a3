pub mod config;
pub mod key;

pub use config::{
    AppConfig, DatabaseConfig, KeyConfig, LogConfig, ModelSettingsConfig, PoolConfig,
    ServerConfig, UpstreamConfig,
};
pub use key::{ApiKey, KeyStats, KeyStatus};
