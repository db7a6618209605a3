//! Key selection strategies. Each strategy sees the full key slice, filters
//! to the currently available sub-slice, and picks one key or none. Strategies
//! never mutate key state.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::models::key::ApiKey;

const MIN_WEIGHT: f64 = 0.1;
const DEFAULT_WEIGHT: f64 = 0.5;
const MAX_WEIGHT: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    RoundRobin,
    Random,
    LeastUsed,
    Weighted,
}

impl StrategyKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "round_robin" | "roundrobin" => Some(StrategyKind::RoundRobin),
            "random" => Some(StrategyKind::Random),
            "least_used" | "leastused" => Some(StrategyKind::LeastUsed),
            "weighted" => Some(StrategyKind::Weighted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::RoundRobin => "round_robin",
            StrategyKind::Random => "random",
            StrategyKind::LeastUsed => "least_used",
            StrategyKind::Weighted => "weighted",
        }
    }
}

#[derive(Debug)]
pub enum Strategy {
    /// Sequential rotation over the available sub-slice. The counter is never
    /// reset when the available set changes; fairness is best-effort,
    /// determinism holds within a stable set.
    RoundRobin { counter: AtomicU64 },
    Random,
    LeastUsed,
    /// Pick proportional to success rate clamped to [0.1, 1.0]; unused keys
    /// weigh 0.5 so new keys enter rotation.
    Weighted,
}

impl Strategy {
    pub fn new(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::RoundRobin => Strategy::RoundRobin {
                counter: AtomicU64::new(0),
            },
            StrategyKind::Random => Strategy::Random,
            StrategyKind::LeastUsed => Strategy::LeastUsed,
            StrategyKind::Weighted => Strategy::Weighted,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::RoundRobin { .. } => StrategyKind::RoundRobin,
            Strategy::Random => StrategyKind::Random,
            Strategy::LeastUsed => StrategyKind::LeastUsed,
            Strategy::Weighted => StrategyKind::Weighted,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Picks one available key, or `None` when nothing is selectable.
    pub fn select<'a>(&self, keys: &'a [ApiKey]) -> Option<&'a ApiKey> {
        let available: Vec<&ApiKey> = keys.iter().filter(|key| key.is_available()).collect();
        if available.is_empty() {
            return None;
        }

        match self {
            Strategy::RoundRobin { counter } => {
                let index = counter.fetch_add(1, Ordering::Relaxed);
                Some(available[(index % available.len() as u64) as usize])
            }
            Strategy::Random => {
                let index = rand::thread_rng().gen_range(0..available.len());
                Some(available[index])
            }
            Strategy::LeastUsed => {
                // Ties break toward the first occurrence in the slice.
                let mut best = available[0];
                for &key in &available[1..] {
                    if key.stats.request_count < best.stats.request_count {
                        best = key;
                    }
                }
                Some(best)
            }
            Strategy::Weighted => Some(select_weighted(&available)),
        }
    }
}

fn select_weighted<'a>(available: &[&'a ApiKey]) -> &'a ApiKey {
    let weights: Vec<f64> = available.iter().map(|key| key_weight(key)).collect();
    let total: f64 = weights.iter().sum();

    let mut roll = rand::thread_rng().gen::<f64>() * total;
    for (key, weight) in available.iter().copied().zip(&weights) {
        if roll <= *weight {
            return key;
        }
        roll -= weight;
    }
    available[available.len() - 1]
}

fn key_weight(key: &ApiKey) -> f64 {
    if key.stats.request_count == 0 {
        return DEFAULT_WEIGHT;
    }
    key.stats.success_rate().clamp(MIN_WEIGHT, MAX_WEIGHT)
}
