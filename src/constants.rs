pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Base URL for the Google AI Studio (Gemini) API.
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8045;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_COOLDOWN_SECONDS: u64 = 60;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Retry-After value surfaced on 429 responses, in seconds.
pub const RATE_LIMIT_RETRY_AFTER_SECS: u64 = 60;

pub const DATA_DIR_ENV: &str = "KEYWHEEL_DATA_DIR";
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const CONFIG_FILE: &str = "config.json";
pub const DATABASE_FILE: &str = "keywheel.db";
