pub mod common;
pub mod handlers;
pub mod mappers;
pub mod middleware;
pub mod pool;
pub mod routes;
pub mod state;
pub mod upstream;

pub use pool::{KeyPool, KeyProvider, KeyStore, StrategyKind};
pub use state::AppState;
pub use upstream::{GeminiClient, StreamEvent};

#[cfg(test)]
mod tests;
