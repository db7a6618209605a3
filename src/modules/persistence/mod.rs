//! SQLite persistence for keys and key-value settings. Writes are small and
//! blocking; stat updates from the pool are best-effort.

use std::collections::HashMap;
use std::path::Path;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{AppError, AppResult};
use crate::models::key::{ApiKey, KeyStats, KeyStatus};
use crate::proxy::pool::KeyStore;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::internal("Failed to create data directory").with_cause(e))?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| AppError::internal("Failed to open database").with_cause(e))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::internal("Failed to open database").with_cause(e))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS keys (
                id TEXT PRIMARY KEY,
                api_key TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                tags TEXT NOT NULL DEFAULT '[]',
                enabled INTEGER NOT NULL DEFAULT 1,
                request_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                model_usage TEXT NOT NULL DEFAULT '{}',
                last_used_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .map_err(|e| AppError::internal("Failed to initialize database schema").with_cause(e))
    }

    pub fn get_setting(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_error)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().timestamp()],
        )
        .map(|_| ())
        .map_err(db_error)
    }
}

fn db_error(err: rusqlite::Error) -> AppError {
    AppError::internal("Database operation failed").with_cause(err)
}

fn row_to_key(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
    let tags_json: String = row.get("tags")?;
    let model_usage_json: String = row.get("model_usage")?;
    let enabled: bool = row.get("enabled")?;
    let last_used_at: Option<i64> = row.get("last_used_at")?;
    let created_at: i64 = row.get("created_at")?;
    let updated_at: i64 = row.get("updated_at")?;
    let api_key: String = row.get("api_key")?;

    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    let model_usage: HashMap<String, u64> =
        serde_json::from_str(&model_usage_json).unwrap_or_default();

    Ok(ApiKey {
        id: row.get("id")?,
        masked_key: crate::models::key::mask_api_key(&api_key),
        api_key,
        name: row.get("name")?,
        status: if enabled {
            KeyStatus::Active
        } else {
            KeyStatus::Disabled
        },
        enabled,
        tags,
        stats: KeyStats {
            request_count: row.get::<_, i64>("request_count")? as u64,
            success_count: row.get::<_, i64>("success_count")? as u64,
            error_count: row.get::<_, i64>("error_count")? as u64,
            prompt_tokens: row.get::<_, i64>("prompt_tokens")? as u64,
            completion_tokens: row.get::<_, i64>("completion_tokens")? as u64,
            last_used_at: last_used_at.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            model_usage,
        },
        cooldown_until: None,
        created_at: Utc.timestamp_opt(created_at, 0).single().unwrap_or_else(Utc::now),
        updated_at: Utc.timestamp_opt(updated_at, 0).single().unwrap_or_else(Utc::now),
    })
}

impl KeyStore for SqliteStore {
    fn create_key(&self, key: &ApiKey) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO keys (
                id, api_key, name, tags, enabled,
                request_count, success_count, error_count,
                prompt_tokens, completion_tokens, model_usage,
                last_used_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                key.id,
                key.api_key,
                key.name,
                serde_json::to_string(&key.tags).unwrap_or_else(|_| "[]".to_string()),
                key.enabled,
                key.stats.request_count as i64,
                key.stats.success_count as i64,
                key.stats.error_count as i64,
                key.stats.prompt_tokens as i64,
                key.stats.completion_tokens as i64,
                serde_json::to_string(&key.stats.model_usage)
                    .unwrap_or_else(|_| "{}".to_string()),
                key.stats.last_used_at.map(|ts| ts.timestamp()),
                key.created_at.timestamp(),
                key.updated_at.timestamp(),
            ],
        )
        .map(|_| ())
        .map_err(db_error)
    }

    fn get_key(&self, id: &str) -> AppResult<Option<ApiKey>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT * FROM keys WHERE id = ?1", params![id], row_to_key)
            .optional()
            .map_err(db_error)
    }

    fn list_keys(&self) -> AppResult<Vec<ApiKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM keys ORDER BY created_at ASC")
            .map_err(db_error)?;
        let keys = stmt
            .query_map([], row_to_key)
            .map_err(db_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error)?;
        Ok(keys)
    }

    fn update_key(&self, key: &ApiKey) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE keys SET
                name = ?2, tags = ?3, enabled = ?4,
                request_count = ?5, success_count = ?6, error_count = ?7,
                prompt_tokens = ?8, completion_tokens = ?9, model_usage = ?10,
                last_used_at = ?11, updated_at = ?12
             WHERE id = ?1",
            params![
                key.id,
                key.name,
                serde_json::to_string(&key.tags).unwrap_or_else(|_| "[]".to_string()),
                key.enabled,
                key.stats.request_count as i64,
                key.stats.success_count as i64,
                key.stats.error_count as i64,
                key.stats.prompt_tokens as i64,
                key.stats.completion_tokens as i64,
                serde_json::to_string(&key.stats.model_usage)
                    .unwrap_or_else(|_| "{}".to_string()),
                key.stats.last_used_at.map(|ts| ts.timestamp()),
                key.updated_at.timestamp(),
            ],
        )
        .map(|_| ())
        .map_err(db_error)
    }

    fn delete_key(&self, id: &str) -> AppResult<()> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute("DELETE FROM keys WHERE id = ?1", params![id])
            .map_err(db_error)?;
        if deleted == 0 {
            return Err(AppError::not_found("Key"));
        }
        Ok(())
    }

    fn key_exists(&self, api_key: &str) -> AppResult<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM keys WHERE api_key = ?1",
                params![api_key],
                |row| row.get(0),
            )
            .map_err(db_error)?;
        Ok(count > 0)
    }
}
