pub mod constants;
pub mod error;
pub mod models;
pub mod modules;
pub mod proxy;

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::models::config::AppConfig;
use crate::modules::persistence::SqliteStore;
use crate::modules::system::{config as system_config, logger};
use crate::proxy::handlers::admin::{SETTING_COOLDOWN, SETTING_MAX_FAILURES, SETTING_STRATEGY};
use crate::proxy::pool::{KeyPool, KeyProvider, KeyStore, StrategyKind};
use crate::proxy::state::AppState;
use crate::proxy::upstream::GeminiClient;

/// Builds the full application state: storage, pool (reconciled with the
/// store), and the dispatch client.
pub fn build_app_state(config: AppConfig) -> Result<AppState, String> {
    let store = open_store(&config);

    let storage: Option<Arc<dyn KeyStore>> = store
        .as_ref()
        .map(|s| Arc::clone(s) as Arc<dyn KeyStore>);
    let pool = Arc::new(KeyPool::new(&config.keys, &config.pool, storage));

    if pool.has_storage() {
        match pool.sync_config_to_store(&config.keys) {
            Ok(synced) if synced > 0 => info!("Synced {synced} config key(s) to storage"),
            Ok(_) => {}
            Err(err) => warn!("Config-to-storage sync failed: {err}"),
        }
        match pool.load_from_store() {
            Ok(count) => info!("Loaded {count} key(s) from storage"),
            Err(err) => warn!("Loading keys from storage failed: {err}"),
        }
    }

    if let Some(store) = &store {
        apply_persisted_pool_settings(&pool, store);
    }

    let provider: Arc<dyn KeyProvider> = pool.clone();
    let client = GeminiClient::new(provider, &config.upstream, config.model_settings.clone())
        .map_err(|err| format!("failed_to_build_upstream_client: {err}"))?;

    Ok(AppState {
        pool,
        client: Arc::new(client),
        store,
        config: Arc::new(config),
        started_at: Instant::now(),
    })
}

fn open_store(config: &AppConfig) -> Option<Arc<SqliteStore>> {
    let path = config
        .database
        .path
        .as_ref()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| system_config::get_data_dir().join(constants::DATABASE_FILE));

    match SqliteStore::open(&path) {
        Ok(store) => Some(Arc::new(store)),
        Err(err) => {
            // The pool still works from config alone; stats just won't
            // survive restarts.
            warn!("Failed to open database at {path:?}, continuing without persistence: {err}");
            None
        }
    }
}

/// Settings persisted through the admin API supersede the static config.
fn apply_persisted_pool_settings(pool: &KeyPool, store: &SqliteStore) {
    if let Ok(Some(value)) = store.get_setting(SETTING_STRATEGY) {
        match StrategyKind::parse(&value) {
            Some(kind) => pool.set_strategy(kind),
            None => warn!("ignoring persisted strategy {value:?}"),
        }
    }
    if let Ok(Some(value)) = store.get_setting(SETTING_COOLDOWN) {
        match value.parse::<u64>() {
            Ok(seconds) if seconds > 0 => pool.set_cooldown_seconds(seconds),
            _ => warn!("ignoring persisted cooldown {value:?}"),
        }
    }
    if let Ok(Some(value)) = store.get_setting(SETTING_MAX_FAILURES) {
        match value.parse::<u32>() {
            Ok(count) if count > 0 => pool.set_max_consecutive_failures(count),
            _ => warn!("ignoring persisted failure threshold {value:?}"),
        }
    }
}

async fn serve(state: AppState) -> Result<(), String> {
    let address = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    );
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|err| format!("failed_to_bind_{address}: {err}"))?;

    info!(
        "keywheel {} listening on {address} ({} key(s), strategy {})",
        constants::VERSION,
        state.pool.size(),
        state.pool.strategy_name()
    );

    let router = proxy::routes::build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .map_err(|err| format!("server_error: {err}"))
}

pub fn run() {
    let mut config = match system_config::load_app_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {err}");
            std::process::exit(1);
        }
    };
    system_config::apply_env_overrides(&mut config);

    logger::init_logger(&config.log);

    if config.keys.is_empty() {
        warn!("No keys configured; the pool will rely on storage or the admin API");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to create Tokio runtime: {err}");
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        let state = match build_app_state(config) {
            Ok(state) => state,
            Err(err) => {
                error!("Startup failed: {err}");
                std::process::exit(1);
            }
        };
        if let Err(err) = serve(state).await {
            error!("{err}");
            std::process::exit(1);
        }
        info!("Shut down cleanly");
    });
}
