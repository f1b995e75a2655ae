//! Web admin surface - JSON endpoints over the store, pools, governor,
//! and log buffer
//!
//! Every endpoint answers structured JSON with a `status` field; mutating
//! endpoints add a human-readable `message`. Invalid configuration updates
//! are rejected without any state change.

use crate::catalog::canonicalize_url;
use crate::config::{Config, VERSION};
use crate::governor::RestartGovernor;
use crate::logging::{LogBuffer, LogLevel};
use crate::proxy_pool::ProxyPool;
use crate::store::Store;
use crate::token_pool::TokenPool;
use crate::worker::FleetStats;
use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Parameters whose values never leave the process unmasked; the proxy list
/// link is a provider download URL with an embedded auth token
const SENSITIVE_PARAMETERS: &[&str] = &[
    "telegram_token",
    "telegram_chat_id",
    "proxy_list",
    "proxy_list_link",
];

/// Parameters that must parse as non-negative integers on update
const INTEGER_PARAMETERS: &[&str] = &[
    "query_refresh_delay",
    "items_per_query",
    "redeploy_threshold_minutes",
    "max_http_errors",
    "proxy_rotation_interval",
];

/// Shared state behind every handler
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub config: Config,
    pub log_buffer: LogBuffer,
    pub governor: Arc<RestartGovernor>,
    pub proxy_pool: Arc<ProxyPool>,
    pub token_pool: Arc<TokenPool>,
    pub fleet_stats: FleetStats,
    pub telegram_enabled: Arc<AtomicBool>,
    pub started_at: chrono::DateTime<Utc>,
}

fn ok(message: impl Into<String>) -> Json<Value> {
    Json(json!({"status": "ok", "message": message.into()}))
}

fn error(message: impl Into<String>) -> Json<Value> {
    Json(json!({"status": "error", "message": message.into()}))
}

fn store_error(e: anyhow::Error) -> Json<Value> {
    tracing::error!("Admin store operation failed: {}", e);
    error(format!("store error: {}", e))
}

/// Build the admin router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/queries", get(list_queries))
        .route("/add_query", post(add_query))
        .route("/remove_query/all", post(remove_all_queries))
        .route("/remove_query/:id", post(remove_query))
        .route("/edit_query/:id", post(edit_query))
        .route("/update_thread_id", post(update_thread_id))
        .route("/clear_all_items", post(clear_all_items))
        .route("/items", get(list_items))
        .route("/config", get(get_config))
        .route("/update_config", post(update_config))
        .route("/control/telegram/:action", post(control_telegram))
        .route("/control/status", get(control_status))
        .route("/allowlist", get(get_allowlist).post(add_country))
        .route("/add_country", post(add_country))
        .route("/remove_country/:country", post(remove_country))
        .route("/clear_allowlist", post(clear_allowlist))
        .route("/logs", get(recent_logs))
        .route("/api/logs", get(api_logs))
        .route("/redeploy_status", get(redeploy_status))
        .route("/proxy_status", get(proxy_status))
        .route("/force_redeploy", post(force_redeploy))
        .with_state(state)
}

/// Serve until the shutdown signal flips
pub async fn run_web(state: AppState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = state.config.bind_addr;
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Admin surface listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Dashboard & queries
// ─────────────────────────────────────────────────────────────────────────────

async fn dashboard(State(state): State<AppState>) -> Json<Value> {
    let now = Utc::now();
    let today_start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0);

    Json(json!({
        "status": "ok",
        "version": VERSION,
        "uptime_secs": (now - state.started_at).num_seconds(),
        "queries": state.store.get_queries().map(|q| q.len()).unwrap_or(0),
        "items": state.store.items_count().unwrap_or(0),
        "items_found_today": state.store.items_found_since(today_start).unwrap_or(0),
        "api_requests": state.store.get_api_requests().unwrap_or(0),
        "telegram_enabled": state.telegram_enabled.load(Ordering::Relaxed),
    }))
}

async fn list_queries(State(state): State<AppState>) -> Json<Value> {
    match state.store.get_queries() {
        Ok(queries) => {
            let rows: Vec<Value> = queries
                .iter()
                .map(|q| {
                    json!({
                        "id": q.id,
                        "url": q.url,
                        "label": q.label(),
                        "last_item_ts": q.last_item_ts,
                        "thread_id": q.thread_id,
                        "priority": q.priority,
                    })
                })
                .collect();
            Json(json!({"status": "ok", "queries": rows}))
        }
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct AddQueryForm {
    query: String,
    query_name: Option<String>,
    thread_id: Option<i64>,
}

async fn add_query(
    State(state): State<AppState>,
    Form(form): Form<AddQueryForm>,
) -> Json<Value> {
    let canonical = match canonicalize_url(form.query.trim()) {
        Ok(url) => url,
        Err(_) => return error("Invalid query URL."),
    };
    let name = form
        .query_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());
    match state.store.add_query(&canonical, name, form.thread_id) {
        Ok(true) => ok("Query added."),
        Ok(false) => error("Query already exists."),
        Err(e) => store_error(e),
    }
}

async fn remove_query(State(state): State<AppState>, Path(id): Path<i64>) -> Json<Value> {
    match state.store.remove_query(id) {
        Ok(true) => ok("Query removed."),
        Ok(false) => error("No such query."),
        Err(e) => store_error(e),
    }
}

async fn remove_all_queries(State(state): State<AppState>) -> Json<Value> {
    match state.store.remove_all_queries() {
        Ok(removed) => ok(format!("{} queries removed.", removed)),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct EditQueryForm {
    query_name: Option<String>,
    thread_id: Option<i64>,
    #[serde(default)]
    priority: bool,
}

async fn edit_query(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Form(form): Form<EditQueryForm>,
) -> Json<Value> {
    let name = form
        .query_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());
    match state.store.edit_query(id, name, form.thread_id, form.priority) {
        Ok(true) => ok("Query updated. Worker fleet changes apply after restart."),
        Ok(false) => error("No such query."),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateThreadForm {
    query_id: i64,
    thread_id: Option<i64>,
}

async fn update_thread_id(
    State(state): State<AppState>,
    Form(form): Form<UpdateThreadForm>,
) -> Json<Value> {
    match state.store.update_query_thread_id(form.query_id, form.thread_id) {
        Ok(true) => ok("Thread id updated."),
        Ok(false) => error("No such query."),
        Err(e) => store_error(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Items
// ─────────────────────────────────────────────────────────────────────────────

/// Both fields arrive as strings so `?query=&limit=` (empty filters) works
#[derive(Debug, Deserialize)]
struct ItemsParams {
    query: Option<String>,
    limit: Option<String>,
}

async fn list_items(
    State(state): State<AppState>,
    Query(params): Query<ItemsParams>,
) -> Json<Value> {
    let query_id = match params.query.as_deref().filter(|q| !q.is_empty()) {
        Some(raw) => match raw.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => return error("query filter must be a numeric query id"),
        },
        None => None,
    };
    let limit = params
        .limit
        .as_deref()
        .and_then(|l| l.parse::<u32>().ok())
        .unwrap_or(50)
        .min(500);
    match state.store.get_items(limit, query_id) {
        Ok(items) => Json(json!({"status": "ok", "items": items})),
        Err(e) => store_error(e),
    }
}

async fn clear_all_items(State(state): State<AppState>) -> Json<Value> {
    match state.store.clear_all_items() {
        Ok(removed) => ok(format!("{} items removed.", removed)),
        Err(e) => store_error(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

async fn get_config(State(state): State<AppState>) -> Json<Value> {
    match state.store.get_all_parameters() {
        Ok(parameters) => {
            let masked: Vec<Value> = parameters
                .iter()
                .map(|(key, value)| {
                    let display = if SENSITIVE_PARAMETERS.contains(&key.as_str())
                        && !value.is_empty()
                    {
                        "***".to_string()
                    } else {
                        value.clone()
                    };
                    json!({"key": key, "value": display})
                })
                .collect();
            Json(json!({"status": "ok", "parameters": masked}))
        }
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateConfigForm {
    key: String,
    value: String,
}

async fn update_config(
    State(state): State<AppState>,
    Form(form): Form<UpdateConfigForm>,
) -> Json<Value> {
    let key = form.key.trim();
    let value = form.value.trim();
    if key.is_empty() {
        return error("Parameter key must not be empty.");
    }
    if INTEGER_PARAMETERS.contains(&key) && value.parse::<u64>().is_err() {
        return error(format!("Parameter '{}' must be a non-negative integer.", key));
    }
    if key == "check_proxies" && !matches!(value, "True" | "False" | "true" | "false") {
        return error("check_proxies must be True or False.");
    }

    match state.store.set_parameter(key, value) {
        Ok(()) => {
            // Proxy source changes take effect on the next selection
            if key.starts_with("proxy_") || key == "check_proxies" {
                state.proxy_pool.invalidate();
            }
            ok(format!("Parameter '{}' updated.", key))
        }
        Err(e) => store_error(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process control & status
// ─────────────────────────────────────────────────────────────────────────────

async fn control_telegram(
    State(state): State<AppState>,
    Path(action): Path<String>,
) -> Json<Value> {
    match action.as_str() {
        "start" => {
            state.telegram_enabled.store(true, Ordering::Relaxed);
            ok("Telegram notifier started.")
        }
        "stop" => {
            state.telegram_enabled.store(false, Ordering::Relaxed);
            ok("Telegram notifier stopped.")
        }
        _ => error("Unknown action; use start or stop."),
    }
}

async fn control_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "telegram_enabled": state.telegram_enabled.load(Ordering::Relaxed),
        "token_pool": state.token_pool.stats(),
        "workers": state.fleet_stats.snapshot(),
    }))
}

async fn redeploy_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"status": "ok", "redeploy": state.governor.status()}))
}

async fn proxy_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"status": "ok", "proxies": state.proxy_pool.status()}))
}

async fn force_redeploy(State(state): State<AppState>) -> Json<Value> {
    if state.governor.force_restart() {
        ok("Restart requested.")
    } else {
        error("A restart is already in progress.")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Allowlist
// ─────────────────────────────────────────────────────────────────────────────

async fn get_allowlist(State(state): State<AppState>) -> Json<Value> {
    match state.store.get_allowlist() {
        Ok(countries) => Json(json!({
            "status": "ok",
            "countries": countries,
            "all_allowed": state.store.get_allowlist().map(|c| c.is_empty()).unwrap_or(true),
        })),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct CountryForm {
    country: String,
}

async fn add_country(
    State(state): State<AppState>,
    Form(form): Form<CountryForm>,
) -> Json<Value> {
    let country = form.country.replace(' ', "").to_uppercase();
    if country.len() != 2 {
        return error("Invalid country code");
    }
    match state.store.add_to_allowlist(&country) {
        Ok(true) => ok("Country added."),
        Ok(false) => error(format!("Country \"{}\" already in allowlist.", country)),
        Err(e) => store_error(e),
    }
}

async fn remove_country(
    State(state): State<AppState>,
    Path(country): Path<String>,
) -> Json<Value> {
    let country = country.replace(' ', "").to_uppercase();
    if country.len() != 2 {
        return error("Invalid country code");
    }
    match state.store.remove_from_allowlist(&country) {
        Ok(true) => ok("Country removed."),
        Ok(false) => error("Country not in allowlist."),
        Err(e) => store_error(e),
    }
}

async fn clear_allowlist(State(state): State<AppState>) -> Json<Value> {
    match state.store.clear_allowlist() {
        Ok(_) => ok("Allowlist cleared."),
        Err(e) => store_error(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logs
// ─────────────────────────────────────────────────────────────────────────────

async fn recent_logs(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "entries": state.log_buffer.page(0, 100, None),
    }))
}

/// String fields tolerate bare `?offset&limit&level` query keys
#[derive(Debug, Deserialize)]
struct LogsParams {
    offset: Option<String>,
    limit: Option<String>,
    level: Option<String>,
}

async fn api_logs(
    State(state): State<AppState>,
    Query(params): Query<LogsParams>,
) -> Json<Value> {
    let level = match params.level.as_deref().filter(|l| !l.is_empty()) {
        Some(raw) => match LogLevel::parse(raw) {
            Some(level) => Some(level),
            None => return error(format!("Unknown log level '{}'.", raw)),
        },
        None => None,
    };
    let offset = params
        .offset
        .as_deref()
        .and_then(|o| o.parse::<usize>().ok())
        .unwrap_or(0);
    let limit = params
        .limit
        .as_deref()
        .and_then(|l| l.parse::<usize>().ok())
        .unwrap_or(100)
        .min(1000);
    let entries = state.log_buffer.page(offset, limit, level);
    Json(json!({
        "status": "ok",
        "total_buffered": state.log_buffer.len(),
        "entries": entries,
    }))
}
