use crate::error::ConfigError;
use serde::{Deserialize, Deserializer, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const VALID_RATINGS: [&str; 4] = ["g", "s", "q", "e"];

pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Runtime configuration for the Danbooru client and subscriptions.
///
/// The host hands the plugin a JSON mapping; every section and key is optional
/// and falls back to the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub auth: AuthConfig,
    pub cache: CacheConfig,
    pub filter: FilterConfig,
    pub display: DisplayConfig,
    pub subscriptions: SubscriptionsConfig,
    pub debug: bool,
    pub log_api_calls: bool,
    /// Where the stdio shim persists subscription state.
    pub state_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub test_url: String,
    pub use_test_server: bool,
    /// Seconds.
    pub timeout: u64,
    pub max_retries: u32,
    /// Seconds; base of the exponential backoff.
    pub retry_delay: f64,
    pub rate_limit_per_second: f64,
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://danbooru.donmai.us".into(),
            test_url: "https://testbooru.donmai.us".into(),
            use_test_server: false,
            timeout: 30,
            max_retries: 3,
            retry_delay: 1.0,
            rate_limit_per_second: 10.0,
            user_agent: format!("danbooru-bridge/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ApiConfig {
    pub fn active_url(&self) -> &str {
        let url = if self.use_test_server {
            &self.test_url
        } else {
            &self.base_url
        };
        url.trim_end_matches('/')
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Clamped to [`MAX_RETRY_DELAY`]; negative or NaN values mean no delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_delay.max(0.0))
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub username: String,
    pub api_key: String,
}

impl AuthConfig {
    pub fn is_configured(&self) -> bool {
        !self.username.is_empty() && !self.api_key.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 300,
            max_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Accepts either `["g", "s"]` or `{"g": true, "s": true, ...}`.
    #[serde(deserialize_with = "deserialize_ratings")]
    pub allowed_ratings: Vec<String>,
    pub blocked_tags: Vec<String>,
    pub required_tags: Vec<String>,
    pub min_score: Option<i64>,
    pub max_results: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            allowed_ratings: vec!["g".into(), "s".into()],
            blocked_tags: Vec::new(),
            required_tags: Vec::new(),
            min_score: None,
            max_results: 20,
        }
    }
}

fn deserialize_ratings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    Ok(normalize_ratings(&raw))
}

/// Keep known ratings only; an empty result falls back to general + sensitive.
pub fn normalize_ratings(raw: &serde_json::Value) -> Vec<String> {
    let mut ratings: Vec<String> = match raw {
        serde_json::Value::Object(map) => VALID_RATINGS
            .iter()
            .filter(|r| map.get(**r).and_then(|v| v.as_bool()).unwrap_or(false))
            .map(|r| r.to_string())
            .collect(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_lowercase())
            .filter(|s| VALID_RATINGS.contains(&s.as_str()))
            .collect(),
        _ => Vec::new(),
    };
    ratings.dedup();
    if ratings.is_empty() {
        ratings = vec!["g".into(), "s".into()];
    }
    ratings
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreviewSize {
    #[default]
    Preview,
    Sample,
    Original,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub show_preview: bool,
    pub search_limit: u32,
    pub only_image: bool,
    pub preview_size: PreviewSize,
    pub show_tags: bool,
    /// Tags per line; 0 keeps the default of 12.
    pub max_tags_display: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            show_preview: true,
            search_limit: 1,
            only_image: false,
            preview_size: PreviewSize::Preview,
            show_tags: true,
            max_tags_display: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionsConfig {
    pub enabled: bool,
    pub send_interval_minutes: u64,
    /// How many dispatch rounds a sent post id stays in the dedup ledger; 0 disables dedup.
    pub dedupe_rounds: u64,
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            send_interval_minutes: 120,
            dedupe_rounds: 10,
        }
    }
}

impl SubscriptionsConfig {
    /// Dispatch interval, never shorter than one minute.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.send_interval_minutes.max(1).saturating_mul(60))
    }
}

impl Config {
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Load configuration: defaults, then the JSON file (explicit path or
    /// `DANBOORU_CONFIG`), then environment overrides.
    ///
    /// Env vars:
    /// - DANBOORU_CONFIG (path to a JSON config file)
    /// - DANBOORU_BASE_URL
    /// - DANBOORU_USERNAME / DANBOORU_API_KEY
    /// - DANBOORU_HTTP_TIMEOUT_SECS
    /// - DANBOORU_USER_AGENT
    /// - DANBOORU_STATE_PATH
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| env::var("DANBOORU_CONFIG").ok().map(PathBuf::from));
        let mut cfg = match file {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("DANBOORU_BASE_URL") {
            self.api.base_url = url;
            self.api.use_test_server = false;
        }
        if let Ok(user) = env::var("DANBOORU_USERNAME") {
            self.auth.username = user;
        }
        if let Ok(key) = env::var("DANBOORU_API_KEY") {
            self.auth.api_key = key;
        }
        if let Ok(raw) = env::var("DANBOORU_HTTP_TIMEOUT_SECS") {
            self.api.timeout = raw.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "DANBOORU_HTTP_TIMEOUT_SECS".into(),
                value: raw.clone(),
            })?;
        }
        if let Ok(ua) = env::var("DANBOORU_USER_AGENT") {
            self.api.user_agent = ua;
        }
        if let Ok(path) = env::var("DANBOORU_STATE_PATH") {
            self.state_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Problems that make the configuration unusable or suspicious.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Err(e) = url::Url::parse(self.api.active_url()) {
            errors.push(format!("api base url is invalid: {}", e));
        }
        if self.api.timeout == 0 {
            errors.push("api.timeout must be greater than 0".into());
        }
        if !(self.api.rate_limit_per_second > 0.0) {
            errors.push("api.rate_limit_per_second must be greater than 0".into());
        }
        if self.api.retry_delay < 0.0 {
            errors.push("api.retry_delay must not be negative".into());
        }
        for rating in &self.filter.allowed_ratings {
            if !VALID_RATINGS.contains(&rating.as_str()) {
                errors.push(format!("unknown rating: {}", rating));
            }
        }
        if self.filter.max_results == 0 || self.filter.max_results > 200 {
            errors.push("filter.max_results must be within 1..=200".into());
        }
        if self.display.search_limit == 0 || self.display.search_limit > 20 {
            errors.push("display.search_limit must be within 1..=20".into());
        }
        if self.cache.max_size == 0 {
            errors.push("cache.max_size must be greater than 0".into());
        }
        errors
    }

    /// Shared limit rule for batch operations: default when unset or zero,
    /// capped by `hard_cap` and by `display.search_limit`.
    pub fn resolve_batch_limit(&self, requested: Option<u32>, default: u32, hard_cap: u32) -> u32 {
        let mut limit = requested.unwrap_or(default);
        if limit == 0 {
            limit = default.max(1);
        }
        limit = limit.min(hard_cap);
        if self.display.search_limit > 0 {
            limit = limit.min(self.display.search_limit);
        }
        limit
    }
}
