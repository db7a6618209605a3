use std::sync::Arc;
use std::time::Instant;

use crate::models::config::AppConfig;
use crate::modules::persistence::SqliteStore;
use crate::proxy::pool::KeyPool;
use crate::proxy::upstream::GeminiClient;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<KeyPool>,
    pub client: Arc<GeminiClient>,
    pub store: Option<Arc<SqliteStore>>,
    pub config: Arc<AppConfig>,
    pub started_at: Instant,
}
