use async_trait::async_trait;
use danbooru_bridge::config::Config;
use danbooru_bridge::error::{ApiError, DispatchError, ErrorKind};
use danbooru_bridge::events::LogSink;
use danbooru_bridge::subscriptions::{
    FileKvStore, KvStore, MemoryKvStore, MessageSender, OutboundMessage, PopularScale,
};
use danbooru_bridge::Plugin;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

// Minimal JSON-RPC 2.0 types
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Id {
    Str(String),
    Num(i64),
    Null,
}

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
    id: Option<Id>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Response {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
    id: Option<Id>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;
const UPSTREAM_ERROR: i64 = -32000;
const SUBSCRIPTIONS_DISABLED: i64 = -32001;

fn rpc_error(id: Option<Id>, code: i64, message: &str, data: Option<Value>) -> Response {
    Response {
        jsonrpc: "2.0".into(),
        result: None,
        error: Some(RpcError {
            code,
            message: message.into(),
            data,
        }),
        id,
    }
}

fn rpc_ok(id: Option<Id>, result: Value) -> Response {
    Response {
        jsonrpc: "2.0".into(),
        result: Some(result),
        error: None,
        id,
    }
}

/// Structured error payload; callers render their own text from `kind` and `retry_after_secs`.
fn api_error_response(id: Option<Id>, err: &ApiError) -> Response {
    let code = if err.kind == ErrorKind::Validation && err.status.is_none() {
        INVALID_PARAMS
    } else {
        UPSTREAM_ERROR
    };
    let data = json!({
        "kind": err.kind,
        "category": err.category(),
        "status": err.status,
        "retry_after_secs": err.retry_after.map(|d| d.as_secs_f64()),
        "response": err.response_data,
    });
    rpc_error(id, code, &err.to_string(), Some(data))
}

fn dispatch_error_response(id: Option<Id>, err: &DispatchError) -> Response {
    match err {
        DispatchError::Api(e) => api_error_response(id, e),
        DispatchError::Disabled => rpc_error(id, SUBSCRIPTIONS_DISABLED, &err.to_string(), None),
        DispatchError::Store(e) => rpc_error(id, INTERNAL_ERROR, &format!("{}", e), None),
    }
}

/// Records deliveries so they can be returned in the response.
#[derive(Default)]
struct CollectingSender {
    sent: Mutex<Vec<Value>>,
}

impl CollectingSender {
    async fn drain(&self) -> Vec<Value> {
        std::mem::take(&mut *self.sent.lock().await)
    }
}

#[async_trait]
impl MessageSender for CollectingSender {
    async fn send(&self, session: &str, message: OutboundMessage) -> anyhow::Result<()> {
        self.sent
            .lock()
            .await
            .push(json!({ "session": session, "message": message }));
        Ok(())
    }
}

/// Prints each delivery as one JSON line on stdout.
struct StdoutSender;

#[async_trait]
impl MessageSender for StdoutSender {
    async fn send(&self, session: &str, message: OutboundMessage) -> anyhow::Result<()> {
        let line = serde_json::to_string(&json!({ "session": session, "message": message }))?;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}

async fn open_store(cfg: &Config) -> anyhow::Result<Arc<dyn KvStore>> {
    let kv: Arc<dyn KvStore> = match &cfg.state_path {
        Some(path) => Arc::new(FileKvStore::open(path.clone()).await?),
        None => {
            warn!("no state_path configured; subscription state lives in memory only");
            Arc::new(MemoryKvStore::new())
        }
    };
    Ok(kv)
}

/// Strip optional `Content-Length` framing headers.
fn request_body(input: &str) -> &str {
    let trimmed = input.trim_start();
    if trimmed
        .get(..15)
        .is_some_and(|h| h.eq_ignore_ascii_case("content-length:"))
    {
        if let Some(pos) = trimmed.find("\r\n\r\n") {
            return &trimmed[pos + 4..];
        }
        if let Some(pos) = trimmed.find("\n\n") {
            return &trimmed[pos + 2..];
        }
    }
    trimmed
}

pub async fn run_stdio_server(cfg: Config) -> anyhow::Result<()> {
    info!("Starting danbooru-bridge stdio server");
    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    let body = request_body(&input);
    // One request per process.
    if body.trim().is_empty() {
        return Ok(());
    }
    let req: Request = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            let resp = rpc_error(None, -32700, &format!("Parse error: {}", e), None);
            write_response(&resp).await?;
            return Ok(());
        }
    };
    debug!("Received method={}", req.method);

    let sender = Arc::new(CollectingSender::default());
    let kv = open_store(&cfg).await?;
    let events = Arc::new(LogSink::new(cfg.log_api_calls, cfg.debug));
    let mut plugin = Plugin::initialize(cfg, kv, sender.clone(), events)?;

    let resp = dispatch(&plugin, &sender, req).await;
    write_response(&resp).await?;
    plugin.terminate().await;
    Ok(())
}

/// Run the background dispatcher until Ctrl-C.
pub async fn run_watch(cfg: Config) -> anyhow::Result<()> {
    let kv = open_store(&cfg).await?;
    let events = Arc::new(LogSink::new(cfg.log_api_calls, cfg.debug));
    let mut plugin = Plugin::initialize(cfg, kv, Arc::new(StdoutSender), events)?;
    if !plugin.start_subscriptions() {
        warn!("dispatcher not started");
        plugin.terminate().await;
        return Ok(());
    }
    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    plugin.terminate().await;
    Ok(())
}

async fn write_response(resp: &Response) -> anyhow::Result<()> {
    let mut out = tokio::io::stdout();
    let mut payload = serde_json::to_vec(resp)?;
    payload.push(b'\n');
    out.write_all(&payload).await?;
    out.flush().await?;
    Ok(())
}

async fn dispatch(plugin: &Plugin, sender: &CollectingSender, req: Request) -> Response {
    match req.method.as_str() {
        "initialize" => handle_initialize(plugin, req.id),
        "ping" => handle_ping(req.id, req.params),
        "services/list" => handle_services_list(plugin, req.id),
        "services/call" => handle_services_call(plugin, req.id, req.params).await,
        "subscriptions/subscribe" => handle_subscribe(plugin, sender, req.id, req.params).await,
        "subscriptions/unsubscribe" => handle_unsubscribe(plugin, req.id, req.params).await,
        "subscriptions/list" => handle_list(plugin, req.id, req.params).await,
        "subscriptions/dispatch" => handle_dispatch(plugin, sender, req.id).await,
        "cache/clear" => handle_cache_clear(plugin, req.id, req.params).await,
        "client/stats" => handle_stats(plugin, req.id).await,
        other => rpc_error(req.id, -32601, &format!("Method not found: {}", other), None),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, String> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| format!("Invalid params: {}", e))
}

fn to_value<T: Serialize>(id: Option<Id>, value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(v) => rpc_ok(id, v),
        Err(e) => rpc_error(id, INTERNAL_ERROR, &e.to_string(), None),
    }
}

fn handle_initialize(plugin: &Plugin, id: Option<Id>) -> Response {
    rpc_ok(
        id,
        json!({
            "server": {
                "name": "danbooru-bridge",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "baseUrl": plugin.client().base_url(),
            "authenticated": plugin.client().is_authenticated(),
            "subscriptionsEnabled": plugin.config().subscriptions.enabled,
        }),
    )
}

#[derive(Deserialize)]
struct PingParams {
    message: Option<String>,
}

fn handle_ping(id: Option<Id>, params: Value) -> Response {
    let message = parse_params::<PingParams>(params)
        .ok()
        .and_then(|p| p.message)
        .unwrap_or_else(|| "pong".to_string());
    rpc_ok(id, json!({ "message": message }))
}

fn handle_services_list(plugin: &Plugin, id: Option<Id>) -> Response {
    to_value(id, &json!({ "operations": plugin.registry().descriptors() }))
}

#[derive(Deserialize)]
struct ServiceCallParams {
    service: String,
    method: String,
    #[serde(default)]
    arguments: Value,
}

async fn handle_services_call(plugin: &Plugin, id: Option<Id>, params: Value) -> Response {
    let call: ServiceCallParams = match parse_params(params) {
        Ok(c) => c,
        Err(e) => return rpc_error(id, INVALID_PARAMS, &e, None),
    };
    match plugin.call(&call.service, &call.method, call.arguments).await {
        Ok(resp) => rpc_ok(
            id,
            json!({
                "data": resp.data,
                "status_code": resp.status_code,
                "from_cache": resp.from_cache,
                "rate_limit": resp.rate_limit,
            }),
        ),
        Err(e) => api_error_response(id, &e),
    }
}

#[derive(Deserialize)]
struct SubscribeParams {
    group_id: String,
    platform: Option<String>,
    session_id: Option<String>,
    tag: Option<String>,
    #[serde(default)]
    popular: bool,
    scale: Option<String>,
}

async fn handle_subscribe(
    plugin: &Plugin,
    sender: &CollectingSender,
    id: Option<Id>,
    params: Value,
) -> Response {
    let p: SubscribeParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return rpc_error(id, INVALID_PARAMS, &e, None),
    };
    let dispatcher = plugin.dispatcher();
    if p.popular {
        let scale = match p.scale.as_deref() {
            None => PopularScale::Day,
            Some(raw) => match PopularScale::parse(raw) {
                Some(s) => s,
                None => {
                    return rpc_error(id, INVALID_PARAMS, "scale must be one of day, week, month", None)
                }
            },
        };
        return match dispatcher
            .subscribe_popular(&p.group_id, p.platform.as_deref(), p.session_id.as_deref(), scale)
            .await
        {
            Ok(outcome) => rpc_ok(
                id,
                json!({
                    "group": outcome.group,
                    "delivered": outcome.delivered,
                    "messages": sender.drain().await,
                }),
            ),
            Err(e) => dispatch_error_response(id, &e),
        };
    }
    let Some(tag) = p.tag.as_deref() else {
        return rpc_error(id, INVALID_PARAMS, "tag is required unless popular is set", None);
    };
    match dispatcher
        .subscribe_tag(&p.group_id, tag, p.platform.as_deref(), p.session_id.as_deref())
        .await
    {
        Ok(group) => rpc_ok(id, json!({ "group": group, "messages": sender.drain().await })),
        Err(e) => dispatch_error_response(id, &e),
    }
}

#[derive(Deserialize)]
struct UnsubscribeParams {
    group_id: String,
    tag: Option<String>,
    #[serde(default)]
    popular: bool,
}

async fn handle_unsubscribe(plugin: &Plugin, id: Option<Id>, params: Value) -> Response {
    let p: UnsubscribeParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return rpc_error(id, INVALID_PARAMS, &e, None),
    };
    let dispatcher = plugin.dispatcher();
    if p.popular {
        return match dispatcher.unsubscribe_popular(&p.group_id).await {
            Ok(group) => rpc_ok(id, json!({ "group": group })),
            Err(e) => dispatch_error_response(id, &e),
        };
    }
    let Some(tag) = p.tag.as_deref() else {
        return rpc_error(id, INVALID_PARAMS, "tag is required unless popular is set", None);
    };
    match dispatcher.unsubscribe_tag(&p.group_id, tag).await {
        Ok(removed) => rpc_ok(id, json!({ "removed": removed })),
        Err(e) => dispatch_error_response(id, &e),
    }
}

#[derive(Deserialize)]
struct ListParams {
    group_id: Option<String>,
}

async fn handle_list(plugin: &Plugin, id: Option<Id>, params: Value) -> Response {
    let p: ListParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return rpc_error(id, INVALID_PARAMS, &e, None),
    };
    let store = plugin.dispatcher().store();
    let result = match p.group_id {
        Some(group_id) => store
            .list_group(&group_id)
            .await
            .map(|g| json!({ "group": g })),
        None => store.list_groups().await.map(|g| json!({ "groups": g })),
    };
    match result {
        Ok(v) => rpc_ok(id, v),
        Err(e) => rpc_error(id, INTERNAL_ERROR, &e.to_string(), None),
    }
}

async fn handle_dispatch(plugin: &Plugin, sender: &CollectingSender, id: Option<Id>) -> Response {
    match plugin.dispatcher().run_cycle().await {
        Ok(report) => rpc_ok(
            id,
            json!({ "report": report, "messages": sender.drain().await }),
        ),
        Err(e) => dispatch_error_response(id, &e),
    }
}

#[derive(Deserialize)]
struct CacheClearParams {
    pattern: Option<String>,
}

async fn handle_cache_clear(plugin: &Plugin, id: Option<Id>, params: Value) -> Response {
    let p: CacheClearParams = match parse_params(params) {
        Ok(p) => p,
        Err(e) => return rpc_error(id, INVALID_PARAMS, &e, None),
    };
    match p.pattern {
        Some(pattern) => {
            let removed = plugin.client().invalidate_cache(&pattern).await;
            rpc_ok(id, json!({ "count": removed }))
        }
        None => to_value(id, &plugin.client().clear_cache_with_stats().await),
    }
}

async fn handle_stats(plugin: &Plugin, id: Option<Id>) -> Response {
    let healthy = plugin.client().health_check().await;
    to_value(
        id,
        &json!({ "stats": plugin.client().stats(), "healthy": healthy }),
    )
}
