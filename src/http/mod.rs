pub mod auth;
pub mod cache;
pub mod rate_limit;

pub use auth::{mask_api_key, AuthManager, AuthMethod, Credentials};
pub use cache::{ClearStats, ResponseCache};
pub use rate_limit::RateLimiter;

use crate::config::Config;
use crate::error::{error_for_status, ApiError, ErrorKind};
use crate::events::{ApiEvent, EventSink};
use log::warn;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Query parameters, kept sorted so cache keys are stable.
pub type Params = BTreeMap<String, String>;

/// Keys masked in every emitted event and log line, at any depth.
pub const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "old_password",
    "new_password",
    "password_confirmation",
    "api_key",
    "login",
    "token",
];

pub const MASK: &str = "***";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Json,
    Xml,
}

impl ResponseFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Xml => "xml",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Overrides the client-wide timeout for this call.
    pub timeout: Option<Duration>,
    /// Overrides `api.max_retries` for this call.
    pub retries: Option<u32>,
    pub use_auth: bool,
    pub auth_method: AuthMethod,
    pub response_format: ResponseFormat,
    /// GET only; ignored for other methods.
    pub use_cache: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retries: None,
            use_auth: true,
            auth_method: AuthMethod::Header,
            response_format: ResponseFormat::Json,
            use_cache: true,
        }
    }
}

impl RequestOptions {
    pub fn no_cache() -> Self {
        Self {
            use_cache: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Nested objects are sent as `outer[inner]=value` form fields.
    Form(Value),
    Json(Value),
}

impl RequestBody {
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Empty => None,
            Self::Form(v) | Self::Json(v) => Some(v),
        }
    }
}

/// Server-reported quota from the `x-rate-limit` header. Informational only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub remaining: i64,
    pub burst_pool: Option<i64>,
    pub recharge_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub rate_limit: Option<RateLimitInfo>,
    pub from_cache: bool,
}

impl ApiResponse {
    pub fn cached(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            status_code: 200,
            headers: BTreeMap::new(),
            rate_limit: None,
            from_cache: true,
        }
    }

    /// Elements of an array payload; empty for anything else.
    pub fn items(&self) -> &[Value] {
        self.data.as_array().map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub request_count: u64,
    pub is_authenticated: bool,
    pub base_url: String,
    pub rate_limit: Option<RateLimitInfo>,
}

pub fn extract_rate_limit(headers: &HeaderMap) -> Option<RateLimitInfo> {
    headers
        .get("x-rate-limit")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| serde_json::from_str::<RateLimitInfo>(s).ok())
}

/// Longest wait honored from a `Retry-After` header.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

fn extract_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|secs| *secs >= 0.0)
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .unwrap_or(MAX_RETRY_AFTER)
                .min(MAX_RETRY_AFTER)
        })
}

/// Replace the values of sensitive keys with a mask, recursing through
/// objects and arrays. Everything else is copied unchanged.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if SENSITIVE_KEYS.contains(&k.as_str()) {
                        (k.clone(), Value::String(MASK.into()))
                    } else {
                        (k.clone(), sanitize(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

fn params_to_value(params: &Params) -> Value {
    Value::Object(
        params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// `base/endpoint.ext`, unless the last path segment already has an extension.
pub fn build_url(base: &str, endpoint: &str, format: ResponseFormat) -> String {
    let endpoint = endpoint.trim_start_matches('/');
    let last_segment = endpoint.rsplit('/').next().unwrap_or_default();
    let path = if last_segment.contains('.') {
        endpoint.to_string()
    } else {
        format!("{}.{}", endpoint, format.extension())
    };
    format!("{}/{}", base.trim_end_matches('/'), path)
}

/// Flatten a JSON object into Rails-style form fields.
pub fn flatten_form(value: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    if let Value::Object(map) = value {
        for (k, v) in map {
            flatten_into(k.clone(), v, &mut out);
        }
    }
    out
}

fn flatten_into(prefix: String, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten_into(format!("{}[{}]", prefix, k), v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                flatten_into(format!("{}[]", prefix), v, out);
            }
        }
        Value::Null => {}
        Value::String(s) => out.push((prefix, s.clone())),
        other => out.push((prefix, other.to_string())),
    }
}

/// `retry_delay * 2^attempt`, saturating.
pub fn compute_backoff(retry_delay: Duration, attempt: u32) -> Duration {
    retry_delay.saturating_mul(1u32 << attempt.min(16))
}

/// How long to wait before the next attempt after a retryable failure.
pub fn retry_delay_for(err: &ApiError, retry_delay: Duration, attempt: u32) -> Duration {
    match err.kind {
        ErrorKind::RateLimited => err
            .retry_after
            .unwrap_or_else(|| compute_backoff(retry_delay, attempt)),
        ErrorKind::Network => retry_delay,
        _ => compute_backoff(retry_delay, attempt),
    }
}

/// Result of a single HTTP attempt, as seen by the retry loop.
#[derive(Debug)]
pub enum Attempt {
    Done(ApiResponse),
    Retry(ApiError),
    Fatal(ApiError),
}

impl From<Result<ApiResponse, ApiError>> for Attempt {
    fn from(result: Result<ApiResponse, ApiError>) -> Self {
        match result {
            Ok(response) => Attempt::Done(response),
            Err(e) if e.is_retryable() => Attempt::Retry(e),
            Err(e) => Attempt::Fatal(e),
        }
    }
}

fn error_message(data: &Value) -> String {
    match data {
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("reason"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| data.to_string()),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn build_client(cfg: &Config) -> Result<Client, ApiError> {
    let mut default_headers = HeaderMap::new();
    let user_agent = HeaderValue::from_str(&cfg.api.user_agent)
        .map_err(|e| ApiError::validation(format!("invalid user agent: {}", e)))?;
    default_headers.insert(USER_AGENT, user_agent);
    default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    // Authorization is applied per request so credentials can rotate.
    Client::builder()
        .default_headers(default_headers)
        .timeout(cfg.api.timeout())
        .use_rustls_tls()
        .build()
        .map_err(|e| ApiError::new(ErrorKind::Api, format!("failed to build HTTP client: {}", e)))
}

/// Danbooru REST client: auth, cache, pacing, retries and diagnostics for
/// every call made by the plugin.
pub struct DanbooruClient {
    http: Client,
    base_url: String,
    max_retries: u32,
    retry_delay: Duration,
    cache_enabled: bool,
    auth: AuthManager,
    rate_limiter: RateLimiter,
    cache: ResponseCache,
    events: Arc<dyn EventSink>,
    request_count: AtomicU64,
    last_rate_limit: Mutex<Option<RateLimitInfo>>,
}

impl DanbooruClient {
    pub fn new(cfg: &Config, events: Arc<dyn EventSink>) -> Result<Self, ApiError> {
        Ok(Self {
            http: build_client(cfg)?,
            base_url: cfg.api.active_url().to_string(),
            max_retries: cfg.api.max_retries,
            retry_delay: cfg.api.retry_delay(),
            cache_enabled: cfg.cache.enabled,
            auth: AuthManager::new(&cfg.auth.username, &cfg.auth.api_key),
            rate_limiter: RateLimiter::new(cfg.api.rate_limit_per_second),
            cache: ResponseCache::new(
                cfg.cache.max_size,
                Duration::from_secs(cfg.cache.ttl_seconds),
            ),
            events,
            request_count: AtomicU64::new(0),
            last_rate_limit: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// The underlying connection pool, for callers that need raw requests.
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Perform one logical API call.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: Params,
        body: RequestBody,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let started = Instant::now();
        let request_id = Uuid::new_v4();
        let method_name = method.as_str().to_string();
        let event_params = sanitize(&params_to_value(&params));

        self.events.emit(&ApiEvent::RequestStarted {
            request_id,
            method: method_name.clone(),
            endpoint: endpoint.to_string(),
            params: event_params.clone(),
            body: body.payload().map(sanitize),
        });

        let url = build_url(&self.base_url, endpoint, options.response_format);
        let mut params = params;
        let mut headers = HeaderMap::new();
        if options.use_auth {
            self.auth
                .apply_auth(&mut headers, &mut params, options.auth_method);
        }

        let cacheable = options.use_cache && method == Method::GET && self.cache_enabled;
        if cacheable {
            if let Some(data) = self.cache.get(method.as_str(), &url, &params).await {
                self.events.emit(&ApiEvent::Response {
                    request_id,
                    method: method_name,
                    endpoint: endpoint.to_string(),
                    status_code: 200,
                    duration: started.elapsed(),
                    from_cache: true,
                });
                return Ok(ApiResponse::cached(data));
            }
        }

        self.rate_limiter.acquire().await;

        let max_retries = options.retries.unwrap_or(self.max_retries);
        let mut last_error: Option<ApiError> = None;
        for attempt in 0..=max_retries {
            let outcome = Attempt::from(
                self.attempt(&method, &url, &params, &headers, &body, &options)
                    .await,
            );
            match outcome {
                Attempt::Done(response) => {
                    if cacheable {
                        self.cache
                            .set(method.as_str(), &url, &params, response.data.clone(), None)
                            .await;
                    }
                    self.events.emit(&ApiEvent::Response {
                        request_id,
                        method: method_name,
                        endpoint: endpoint.to_string(),
                        status_code: response.status_code,
                        duration: started.elapsed(),
                        from_cache: false,
                    });
                    return Ok(response);
                }
                Attempt::Fatal(err) => {
                    self.emit_error(request_id, &method_name, endpoint, &event_params, &err);
                    return Err(err);
                }
                Attempt::Retry(err) => {
                    if attempt < max_retries {
                        let delay = retry_delay_for(&err, self.retry_delay, attempt);
                        warn!(
                            "{} {} failed ({}), retry {}/{} in {:?}",
                            method_name,
                            endpoint,
                            err,
                            attempt + 1,
                            max_retries,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(err);
                }
            }
        }

        let err = last_error
            .unwrap_or_else(|| ApiError::new(ErrorKind::Api, "request failed without a response"));
        self.emit_error(request_id, &method_name, endpoint, &event_params, &err);
        Err(err)
    }

    async fn attempt(
        &self,
        method: &Method,
        url: &str,
        params: &Params,
        headers: &HeaderMap,
        body: &RequestBody,
        options: &RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let mut req = self.http.request(method.clone(), url).headers(headers.clone());
        if !params.is_empty() {
            req = req.query(params);
        }
        req = match body {
            RequestBody::Empty => req,
            RequestBody::Form(v) => req.form(&flatten_form(v)),
            RequestBody::Json(v) => req.json(v),
        };
        if let Some(timeout) = options.timeout {
            req = req.timeout(timeout);
        }

        let res = req.send().await?;
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let status = res.status().as_u16();
        let response_headers = res.headers().clone();
        let rate_limit = extract_rate_limit(&response_headers);
        if let Some(info) = &rate_limit {
            if let Ok(mut last) = self.last_rate_limit.lock() {
                *last = Some(info.clone());
            }
        }
        let retry_after = extract_retry_after(&response_headers);

        let text = res.text().await?;
        let data = match options.response_format {
            ResponseFormat::Json => {
                serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text))
            }
            ResponseFormat::Xml => Value::String(text),
        };

        if status >= 400 {
            let message = error_message(&data);
            let response_data = data.is_object().then(|| data.clone());
            error_for_status(status, &message, response_data, retry_after)?;
        }

        Ok(ApiResponse {
            success: true,
            data,
            error: None,
            status_code: status,
            headers: response_headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                .collect(),
            rate_limit,
            from_cache: false,
        })
    }

    fn emit_error(
        &self,
        request_id: Uuid,
        method: &str,
        endpoint: &str,
        params: &Value,
        err: &ApiError,
    ) {
        self.events.emit(&ApiEvent::Error {
            request_id,
            category: err.category(),
            message: err.message.clone(),
            status_code: err.status,
            method: method.to_string(),
            endpoint: endpoint.to_string(),
            params: params.clone(),
        });
    }

    pub async fn get(
        &self,
        endpoint: &str,
        params: Params,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.request(Method::GET, endpoint, params, RequestBody::Empty, options)
            .await
    }

    pub async fn post(
        &self,
        endpoint: &str,
        body: RequestBody,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.request(Method::POST, endpoint, Params::new(), body, options)
            .await
    }

    pub async fn put(
        &self,
        endpoint: &str,
        body: RequestBody,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.request(Method::PUT, endpoint, Params::new(), body, options)
            .await
    }

    pub async fn patch(
        &self,
        endpoint: &str,
        body: RequestBody,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.request(Method::PATCH, endpoint, Params::new(), body, options)
            .await
    }

    pub async fn delete(
        &self,
        endpoint: &str,
        params: Params,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.request(Method::DELETE, endpoint, params, RequestBody::Empty, options)
            .await
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    pub async fn clear_cache_with_stats(&self) -> ClearStats {
        self.cache.clear_with_stats().await
    }

    pub async fn invalidate_cache(&self, pattern: &str) -> usize {
        self.cache.invalidate(pattern).await
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            request_count: self.request_count.load(Ordering::Relaxed),
            is_authenticated: self.is_authenticated(),
            base_url: self.base_url.clone(),
            rate_limit: self.last_rate_limit.lock().ok().and_then(|l| l.clone()),
        }
    }

    pub async fn health_check(&self) -> bool {
        self.get("status", Params::new(), RequestOptions::no_cache())
            .await
            .map(|r| r.success)
            .unwrap_or(false)
    }

    pub async fn get_profile(&self) -> Result<ApiResponse, ApiError> {
        if !self.is_authenticated() {
            return Err(ApiError::new(
                ErrorKind::Authentication,
                "authentication required to fetch the profile",
            ));
        }
        self.get("profile", Params::new(), RequestOptions::no_cache())
            .await
    }
}
