use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::config::KeyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Key is available for selection.
    Active,
    /// Key is cooling down after a rate limit or repeated failures.
    RateLimited,
    /// Key has been manually disabled.
    Disabled,
}

/// One upstream API key with its metadata and usage counters.
///
/// The raw secret never serializes outward; `masked_key` is the display form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    #[serde(skip_serializing, default)]
    pub api_key: String,
    #[serde(rename = "key")]
    pub masked_key: String,
    pub name: String,
    pub status: KeyStatus,
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub stats: KeyStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyStats {
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_usage: HashMap<String, u64>,
}

impl ApiKey {
    pub fn from_config(config: &KeyConfig) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            api_key: config.key.clone(),
            masked_key: mask_api_key(&config.key),
            name: config.name.clone(),
            status: if config.enabled {
                KeyStatus::Active
            } else {
                KeyStatus::Disabled
            },
            enabled: config.enabled,
            tags: config.tags.clone(),
            stats: KeyStats::default(),
            cooldown_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the key may be handed out right now. A rate-limited key whose
    /// cooldown deadline has passed counts as available; the status flip back
    /// to `Active` happens lazily in the pool's acquire sweep.
    pub fn is_available(&self) -> bool {
        if !self.enabled || self.status == KeyStatus::Disabled {
            return false;
        }
        if self.status == KeyStatus::RateLimited {
            if let Some(until) = self.cooldown_until {
                if Utc::now() < until {
                    return false;
                }
            }
        }
        true
    }

    pub fn set_rate_limited(&mut self, cooldown_seconds: u64) {
        self.status = KeyStatus::RateLimited;
        self.cooldown_until = Some(Utc::now() + Duration::seconds(cooldown_seconds as i64));
    }

    /// Returns the key to `Active` if its cooldown has expired.
    pub fn reset_cooldown(&mut self) -> bool {
        if self.status != KeyStatus::RateLimited {
            return false;
        }
        match self.cooldown_until {
            Some(until) if Utc::now() < until => false,
            _ => {
                self.status = KeyStatus::Active;
                self.cooldown_until = None;
                true
            }
        }
    }

    pub fn increment_stats(
        &mut self,
        success: bool,
        prompt_tokens: u64,
        completion_tokens: u64,
        model: &str,
    ) {
        self.stats.request_count += 1;
        if success {
            self.stats.success_count += 1;
        } else {
            self.stats.error_count += 1;
        }
        self.stats.prompt_tokens += prompt_tokens;
        self.stats.completion_tokens += completion_tokens;
        let now = Utc::now();
        self.stats.last_used_at = Some(now);
        self.updated_at = now;
        if !model.is_empty() {
            *self.stats.model_usage.entry(model.to_string()).or_insert(0) += 1;
        }
    }
}

impl KeyStats {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Success rate in [0.0, 1.0]; zero when the key has never been used.
    pub fn success_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.request_count as f64
    }
}

/// Masked display form, e.g. "AIzaSyABC123xyz" -> "AIzaSy...xyz".
pub fn mask_api_key(api_key: &str) -> String {
    if api_key.len() < 12 {
        return "*".repeat(api_key.len());
    }
    format!("{}...{}", &api_key[..6], &api_key[api_key.len() - 3..])
}
