//! The key pool: one shared mutable structure guarding every upstream key,
//! its health state, and its counters behind a single lock.

pub mod strategy;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::models::config::{KeyConfig, PoolConfig};
use crate::models::key::{ApiKey, KeyStatus};

pub use strategy::{Strategy, StrategyKind};

/// The narrow pool handle the dispatch client consumes. Kept as a trait so
/// tests can interpose a recording implementation.
pub trait KeyProvider: Send + Sync {
    /// Picks an available key. Never blocks on IO; errors distinguish an
    /// empty pool from one where every enabled key is cooling down.
    fn acquire(&self) -> AppResult<ApiKey>;

    /// Returns a key to the pool. A no-op today, kept for future lease
    /// semantics; must be safe to call with `None`.
    fn release(&self, key: Option<&ApiKey>);

    fn report_success(&self, key: &ApiKey, prompt_tokens: u64, completion_tokens: u64, model: &str);

    fn report_failure(&self, key: &ApiKey, error: &AppError, model: &str);
}

/// Persistence seam for the pool: create/get/list/update/delete/exists.
pub trait KeyStore: Send + Sync {
    fn create_key(&self, key: &ApiKey) -> AppResult<()>;
    fn get_key(&self, id: &str) -> AppResult<Option<ApiKey>>;
    fn list_keys(&self) -> AppResult<Vec<ApiKey>>;
    fn update_key(&self, key: &ApiKey) -> AppResult<()>;
    fn delete_key(&self, id: &str) -> AppResult<()>;
    fn key_exists(&self, api_key: &str) -> AppResult<bool>;
}

struct PoolInner {
    keys: Vec<ApiKey>,
    strategy: Strategy,
    cooldown_seconds: u64,
    max_consecutive_failures: u32,
    consecutive_failures: HashMap<String, u32>,
}

pub struct KeyPool {
    inner: Mutex<PoolInner>,
    storage: Option<Arc<dyn KeyStore>>,
}

impl KeyPool {
    pub fn new(
        configs: &[KeyConfig],
        pool_config: &PoolConfig,
        storage: Option<Arc<dyn KeyStore>>,
    ) -> Self {
        let strategy_kind =
            StrategyKind::parse(&pool_config.strategy).unwrap_or(StrategyKind::RoundRobin);
        let keys = configs.iter().map(ApiKey::from_config).collect();
        Self {
            inner: Mutex::new(PoolInner {
                keys,
                strategy: Strategy::new(strategy_kind),
                cooldown_seconds: pool_config.cooldown_seconds.max(1),
                max_consecutive_failures: pool_config.max_consecutive_failures.max(1),
                consecutive_failures: HashMap::new(),
            }),
            storage,
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().keys.len()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.inner.lock().strategy.name()
    }

    pub fn cooldown_seconds(&self) -> u64 {
        self.inner.lock().cooldown_seconds
    }

    pub fn max_consecutive_failures(&self) -> u32 {
        self.inner.lock().max_consecutive_failures
    }

    pub fn set_strategy(&self, kind: StrategyKind) {
        self.inner.lock().strategy = Strategy::new(kind);
    }

    pub fn set_cooldown_seconds(&self, seconds: u64) {
        if seconds > 0 {
            self.inner.lock().cooldown_seconds = seconds;
        }
    }

    pub fn set_max_consecutive_failures(&self, count: u32) {
        if count > 0 {
            self.inner.lock().max_consecutive_failures = count;
        }
    }

    pub fn has_storage(&self) -> bool {
        self.storage.is_some()
    }

    /// Copies of every key with the secret blanked, safe for concurrent
    /// readers and for serialization.
    pub fn snapshot(&self) -> Vec<ApiKey> {
        let inner = self.inner.lock();
        inner
            .keys
            .iter()
            .map(|key| {
                let mut copy = key.clone();
                copy.api_key.clear();
                copy
            })
            .collect()
    }

    /// Internal lookup that keeps the secret; used by the admin probe.
    pub fn get_key_by_id(&self, id: &str) -> Option<ApiKey> {
        let inner = self.inner.lock();
        inner.keys.iter().find(|key| key.id == id).cloned()
    }

    /// Adds a key, persisting it first so the store never lags the pool on
    /// insertion.
    pub fn add_key(&self, key: ApiKey) -> AppResult<ApiKey> {
        let mut inner = self.inner.lock();
        if inner.keys.iter().any(|existing| existing.api_key == key.api_key) {
            return Err(AppError::invalid_request("Key already exists"));
        }

        if let Some(storage) = &self.storage {
            storage.create_key(&key)?;
        }

        inner.keys.push(key.clone());
        Ok(key)
    }

    /// Removes a key from memory, then from storage. A failed storage delete
    /// is logged and the key stays removed; reconciliation happens on the
    /// next startup sync.
    pub fn remove_key(&self, id: &str) -> AppResult<()> {
        let mut inner = self.inner.lock();
        let position = inner
            .keys
            .iter()
            .position(|key| key.id == id)
            .ok_or_else(|| AppError::not_found("Key"))?;
        inner.keys.remove(position);
        inner.consecutive_failures.remove(id);
        drop(inner);

        if let Some(storage) = &self.storage {
            if let Err(err) = storage.delete_key(id) {
                warn!("failed to delete key {id} from storage: {err}");
            }
        }
        Ok(())
    }

    /// Rebuilds the in-memory slice from the store, superseding config.
    pub fn load_from_store(&self) -> AppResult<usize> {
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| AppError::internal("No storage configured"))?;
        let mut keys = storage.list_keys()?;
        for key in &mut keys {
            key.status = if key.enabled {
                KeyStatus::Active
            } else {
                KeyStatus::Disabled
            };
            key.cooldown_until = None;
        }

        let mut inner = self.inner.lock();
        let count = keys.len();
        inner.keys = keys;
        inner.consecutive_failures.clear();
        Ok(count)
    }

    /// Inserts config-declared keys the store does not already have. Returns
    /// how many were inserted.
    pub fn sync_config_to_store(&self, configs: &[KeyConfig]) -> AppResult<usize> {
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| AppError::internal("No storage configured"))?;

        let mut synced = 0;
        for config in configs {
            match storage.key_exists(&config.key) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    debug!("key existence check failed, skipping: {err}");
                    continue;
                }
            }
            let key = ApiKey::from_config(config);
            if storage.create_key(&key).is_ok() {
                synced += 1;
            }
        }
        Ok(synced)
    }

    fn sync_key_to_storage(&self, key: &ApiKey) {
        if let Some(storage) = &self.storage {
            if let Err(err) = storage.update_key(key) {
                debug!("best-effort key sync failed for {}: {err}", key.id);
            }
        }
    }
}

impl KeyProvider for KeyPool {
    fn acquire(&self) -> AppResult<ApiKey> {
        let mut inner = self.inner.lock();

        if inner.keys.is_empty() {
            return Err(AppError::no_available_keys());
        }

        // Lazy cooldown sweep: expired deadlines flip back to Active here,
        // not on a timer.
        for key in &mut inner.keys {
            key.reset_cooldown();
        }

        match inner.strategy.select(&inner.keys) {
            Some(key) => Ok(key.clone()),
            None => {
                if all_enabled_rate_limited(&inner.keys) {
                    Err(AppError::all_keys_rate_limited())
                } else {
                    Err(AppError::no_available_keys())
                }
            }
        }
    }

    fn release(&self, _key: Option<&ApiKey>) {}

    fn report_success(&self, key: &ApiKey, prompt_tokens: u64, completion_tokens: u64, model: &str) {
        let mut inner = self.inner.lock();
        let Some(position) = inner.keys.iter().position(|k| k.id == key.id) else {
            return;
        };
        inner.keys[position].increment_stats(true, prompt_tokens, completion_tokens, model);
        inner.consecutive_failures.insert(key.id.clone(), 0);
        let updated = inner.keys[position].clone();
        drop(inner);
        self.sync_key_to_storage(&updated);
    }

    fn report_failure(&self, key: &ApiKey, error: &AppError, model: &str) {
        let mut inner = self.inner.lock();
        let Some(position) = inner.keys.iter().position(|k| k.id == key.id) else {
            return;
        };
        inner.keys[position].increment_stats(false, 0, 0, model);

        let cooldown = inner.cooldown_seconds;
        let threshold = inner.max_consecutive_failures;

        if error.is_rate_limit() {
            inner.keys[position].set_rate_limited(cooldown);
            inner.consecutive_failures.insert(key.id.clone(), 0);
        } else {
            let tripped = {
                let failures = inner
                    .consecutive_failures
                    .entry(key.id.clone())
                    .or_insert(0);
                *failures += 1;
                if *failures >= threshold {
                    *failures = 0;
                    true
                } else {
                    false
                }
            };
            if tripped {
                inner.keys[position].set_rate_limited(cooldown);
            }
        }

        let updated = inner.keys[position].clone();
        drop(inner);
        self.sync_key_to_storage(&updated);
    }
}

/// True when at least one enabled key exists and every enabled key sits in a
/// live cooldown.
fn all_enabled_rate_limited(keys: &[ApiKey]) -> bool {
    let mut has_enabled = false;
    for key in keys {
        if !key.enabled || key.status == KeyStatus::Disabled {
            continue;
        }
        has_enabled = true;
        if key.is_available() {
            return false;
        }
    }
    has_enabled
}
