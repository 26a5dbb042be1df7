//! Diagnostic events emitted by the HTTP client.
//!
//! One sink is built at startup and handed to the client; nothing looks it up
//! globally. The default [`LogSink`] turns every event into a `log` record.

use crate::error::ErrorCategory;
use log::{debug, info, trace, Level};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ApiEvent {
    RequestStarted {
        request_id: Uuid,
        method: String,
        endpoint: String,
        params: Value,
        body: Option<Value>,
    },
    Response {
        request_id: Uuid,
        method: String,
        endpoint: String,
        status_code: u16,
        duration: Duration,
        from_cache: bool,
    },
    Error {
        request_id: Uuid,
        category: ErrorCategory,
        message: String,
        status_code: Option<u16>,
        method: String,
        endpoint: String,
        params: Value,
    },
}

impl ApiEvent {
    pub fn request_id(&self) -> Uuid {
        match self {
            Self::RequestStarted { request_id, .. }
            | Self::Response { request_id, .. }
            | Self::Error { request_id, .. } => *request_id,
        }
    }
}

/// Receives client events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ApiEvent);
}

/// Writes events to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink {
    level: Option<Level>,
}

impl LogSink {
    /// `log_api_calls` logs at info, `debug` at debug, otherwise trace.
    pub fn new(log_api_calls: bool, debug: bool) -> Self {
        let level = if log_api_calls {
            Some(Level::Info)
        } else if debug {
            Some(Level::Debug)
        } else {
            None
        };
        Self { level }
    }

    fn write(&self, line: String) {
        match self.level {
            Some(Level::Info) => info!("{}", line),
            Some(_) => debug!("{}", line),
            None => trace!("{}", line),
        }
    }
}

impl EventSink for LogSink {
    fn emit(&self, event: &ApiEvent) {
        let line = match event {
            ApiEvent::RequestStarted {
                method,
                endpoint,
                params,
                body,
                ..
            } => match body {
                Some(b) => format!("[danbooru] {} {} params={} body={}", method, endpoint, params, b),
                None => format!("[danbooru] {} {} params={}", method, endpoint, params),
            },
            ApiEvent::Response {
                method,
                endpoint,
                status_code,
                duration,
                from_cache,
                ..
            } => format!(
                "[danbooru] {} {} -> {}{} ({:.1}ms)",
                method,
                endpoint,
                status_code,
                if *from_cache { " cache hit" } else { "" },
                duration.as_secs_f64() * 1000.0
            ),
            ApiEvent::Error {
                method,
                endpoint,
                category,
                message,
                ..
            } => format!(
                "[danbooru] {} {} -> error {}: {}",
                method,
                endpoint,
                category.as_str(),
                message
            ),
        };
        self.write(line);
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &ApiEvent) {}
}
