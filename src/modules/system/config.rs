//! Config loading: `config.json` in the data dir, overlaid with environment
//! variables. A missing file is written back with defaults.

use std::fs;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::constants;
use crate::models::config::{AppConfig, KeyConfig};

pub fn get_data_dir() -> PathBuf {
    std::env::var(constants::DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(constants::DEFAULT_DATA_DIR))
}

pub fn load_app_config() -> Result<AppConfig, String> {
    let data_dir = get_data_dir();
    let config_path = data_dir.join(constants::CONFIG_FILE);

    if !config_path.exists() {
        let config = AppConfig::default();
        let _ = save_app_config(&config);
        return Ok(config);
    }

    let content = fs::read_to_string(&config_path)
        .map_err(|e| format!("failed_to_read_config_file: {e}"))?;
    serde_json::from_str(&content).map_err(|e| format!("failed_to_parse_config_file: {e}"))
}

pub fn save_app_config(config: &AppConfig) -> Result<(), String> {
    let data_dir = get_data_dir();
    if !data_dir.exists() {
        fs::create_dir_all(&data_dir).map_err(|e| format!("failed_to_create_data_dir: {e}"))?;
    }
    let config_path = data_dir.join(constants::CONFIG_FILE);
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("failed_to_serialize_config: {e}"))?;
    fs::write(&config_path, content).map_err(|e| format!("failed_to_save_config: {e}"))
}

pub fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(host) = std::env::var("HOST") {
        if !host.trim().is_empty() {
            config.server.host = host.trim().to_string();
        }
    }

    if let Ok(port) = std::env::var("PORT") {
        let trimmed = port.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u16>() {
                Ok(p) if p > 0 => {
                    config.server.port = p;
                    info!("Using server port from environment: {p}");
                }
                _ => warn!("ignoring invalid PORT value: {port}"),
            }
        }
    }

    if let Ok(admin_key) = std::env::var("ADMIN_KEY") {
        if !admin_key.trim().is_empty() {
            info!("Using admin key from environment");
            config.server.admin_key = Some(admin_key);
        }
    }

    if let Ok(strategy) = std::env::var("POOL_STRATEGY") {
        if crate::proxy::pool::StrategyKind::parse(&strategy).is_some() {
            config.pool.strategy = strategy.trim().to_ascii_lowercase();
        } else if !strategy.trim().is_empty() {
            warn!("ignoring invalid POOL_STRATEGY value: {strategy}");
        }
    }

    // Comma-separated secrets appended to the configured key list.
    if let Ok(keys) = std::env::var("GEMINI_API_KEYS") {
        let mut appended = 0usize;
        for (index, secret) in keys
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .enumerate()
        {
            if config.keys.iter().any(|k| k.key == secret) {
                continue;
            }
            config.keys.push(KeyConfig {
                key: secret.to_string(),
                name: format!("env-{}", index + 1),
                enabled: true,
                tags: vec!["env".to_string()],
            });
            appended += 1;
        }
        if appended > 0 {
            info!("Appended {appended} key(s) from environment");
        }
    }
}
