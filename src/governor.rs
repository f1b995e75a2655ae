//! Restart governor - decides when the fleet cannot reach upstream anymore
//!
//! Workers report every catalog outcome here. Three counters (401, 403, 429)
//! accumulate independently; a counter silent for five minutes restarts from
//! one. A success streak long enough wipes all counters. Two conditions
//! request an external restart:
//!
//! - critical: the combined total reaches 100, triggering immediately and
//!   bypassing the cooldown
//! - normal: the oldest error is past `redeploy_threshold_minutes`, the total
//!   reached `max_http_errors`, and the cooldown since the last restart has
//!   elapsed
//!
//! The decision is made under the reporter's lock; the restart itself runs on
//! a dedicated task that walks the action chain (control-plane API, CLI,
//! webhook, self-exit) and stops at the first success.

use crate::config::{Config, Tunables};
use crate::store::Store;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Store key for the persisted restart timestamp
const LAST_REDEPLOY_KEY: &str = "last_redeploy_time";

/// Upstream rejection kinds tracked by the governor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamError {
    Auth401,
    Forbidden403,
    RateLimited429,
}

/// Why a restart was requested
#[derive(Debug, Clone)]
pub enum TriggerReason {
    /// Total errors crossed the critical bound; cooldown bypassed
    Critical { total_errors: u32 },
    /// Normal threshold: enough errors for long enough, cooldown elapsed
    Threshold { total_errors: u32, elapsed_secs: i64 },
    /// Operator asked via the admin surface
    Forced,
}

#[derive(Debug, Default, Clone)]
struct ErrorCounter {
    count: u32,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
}

impl ErrorCounter {
    /// Count one error; a counter silent for longer than `window` starts over
    fn record(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        let stale = self
            .last_seen
            .map(|last| now - last > window)
            .unwrap_or(true);
        if stale {
            self.count = 1;
            self.first_seen = Some(now);
        } else {
            self.count += 1;
        }
        self.last_seen = Some(now);
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Default)]
struct GovernorState {
    e401: ErrorCounter,
    e403: ErrorCounter,
    e429: ErrorCounter,
    success_streak: u32,
    last_redeploy: Option<DateTime<Utc>>,
    /// A restart is queued or running; suppresses duplicate triggers
    restart_pending: bool,
}

impl GovernorState {
    fn total_errors(&self) -> u32 {
        self.e401.count + self.e403.count + self.e429.count
    }

    fn earliest_first_seen(&self) -> Option<DateTime<Utc>> {
        [&self.e401, &self.e403, &self.e429]
            .iter()
            .filter_map(|c| c.first_seen)
            .min()
    }

    fn reset_errors(&mut self) {
        self.e401.reset();
        self.e403.reset();
        self.e429.reset();
        self.success_streak = 0;
    }
}

/// Snapshot for `GET /redeploy_status`
#[derive(Debug, Serialize)]
pub struct GovernorStatus {
    pub error_401_count: u32,
    pub error_403_count: u32,
    pub error_429_count: u32,
    pub total_errors: u32,
    pub first_error_time: Option<String>,
    pub success_streak: u32,
    pub success_threshold: u32,
    pub last_redeploy_time: Option<String>,
    pub redeploy_threshold_minutes: i64,
    pub max_http_errors: u32,
    pub time_since_first_error_seconds: Option<i64>,
    pub redeploy_needed: bool,
    pub restart_pending: bool,
}

pub struct RestartGovernor {
    state: Mutex<GovernorState>,
    store: Store,
    tunables: Tunables,
    restart_tx: mpsc::UnboundedSender<TriggerReason>,
}

impl RestartGovernor {
    /// Build the governor and the receiver its restart task will drain
    pub fn new(
        store: Store,
        tunables: Tunables,
    ) -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<TriggerReason>) {
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();

        // Last restart time survives the restart itself
        let last_redeploy = store
            .get_parameter(LAST_REDEPLOY_KEY)
            .ok()
            .flatten()
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let governor = std::sync::Arc::new(Self {
            state: Mutex::new(GovernorState {
                last_redeploy,
                ..Default::default()
            }),
            store,
            tunables,
            restart_tx,
        });
        (governor, restart_rx)
    }

    /// Report an upstream rejection (401/403/429)
    pub fn report_error(&self, kind: UpstreamError) {
        self.report_error_at(kind, Utc::now());
    }

    /// Report a transport-level failure. It breaks the success streak but
    /// carries no counter of its own.
    pub fn report_generic_error(&self) {
        let mut state = self.state.lock().unwrap();
        state.success_streak = 0;
    }

    /// Report a successful catalog call
    pub fn report_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.success_streak += 1;
        if state.total_errors() > 0 && state.success_streak >= self.tunables.success_threshold {
            tracing::info!(
                "{} successful requests in a row - resetting error counters \
                 (403:{}, 401:{}, 429:{})",
                state.success_streak,
                state.e403.count,
                state.e401.count,
                state.e429.count
            );
            state.reset_errors();
        }
    }

    /// Queue a restart regardless of counters (admin `POST /force_redeploy`)
    pub fn force_restart(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.restart_pending {
            return false;
        }
        state.restart_pending = true;
        let _ = self.restart_tx.send(TriggerReason::Forced);
        true
    }

    /// Called by the restart task once an action succeeded
    pub fn complete_restart(&self, at: DateTime<Utc>) {
        if let Err(e) = self.store.set_parameter(LAST_REDEPLOY_KEY, &at.to_rfc3339()) {
            tracing::error!("Failed to persist {}: {}", LAST_REDEPLOY_KEY, e);
        }
        let mut state = self.state.lock().unwrap();
        state.last_redeploy = Some(at);
        state.restart_pending = false;
        state.reset_errors();
        tracing::info!("Restart recorded at {}, counters reset", at);
    }

    /// Called by the restart task when the whole chain failed
    pub fn abort_restart(&self) {
        let mut state = self.state.lock().unwrap();
        state.restart_pending = false;
    }

    fn report_error_at(&self, kind: UpstreamError, now: DateTime<Utc>) {
        let window = chrono::Duration::seconds(self.tunables.error_window.as_secs() as i64);
        let mut state = self.state.lock().unwrap();
        state.success_streak = 0;
        let counter = match kind {
            UpstreamError::Auth401 => &mut state.e401,
            UpstreamError::Forbidden403 => &mut state.e403,
            UpstreamError::RateLimited429 => &mut state.e429,
        };
        counter.record(now, window);

        let total = state.total_errors();
        if total % 10 == 0 {
            tracing::warn!(
                "Upstream errors at {} (403:{}, 401:{}, 429:{})",
                total,
                state.e403.count,
                state.e401.count,
                state.e429.count
            );
        }

        if let Some(reason) = self.evaluate(&state, now) {
            if !state.restart_pending {
                state.restart_pending = true;
                tracing::error!("Restart trigger: {:?}", reason);
                let _ = self.restart_tx.send(reason);
            }
        }
    }

    /// Trigger decision, taken while the reporter still holds the lock
    fn evaluate(&self, state: &GovernorState, now: DateTime<Utc>) -> Option<TriggerReason> {
        let total = state.total_errors();
        if total == 0 {
            return None;
        }

        if total >= self.tunables.critical_total_errors {
            return Some(TriggerReason::Critical { total_errors: total });
        }

        let first = state.earliest_first_seen()?;
        let elapsed = now - first;
        let threshold_minutes = self
            .store
            .get_int_parameter("redeploy_threshold_minutes", 4)
            .unwrap_or(4);
        let max_errors = self.store.get_int_parameter("max_http_errors", 5).unwrap_or(5) as u32;

        if elapsed.num_seconds() < threshold_minutes * 60 || total < max_errors {
            return None;
        }

        let cooldown =
            chrono::Duration::seconds(self.tunables.min_redeploy_interval.as_secs() as i64);
        let cooled = state
            .last_redeploy
            .map(|last| now - last >= cooldown)
            .unwrap_or(true);
        if !cooled {
            tracing::warn!(
                "Restart needed ({} errors, {}s since first) but blocked by cooldown",
                total,
                elapsed.num_seconds()
            );
            return None;
        }

        Some(TriggerReason::Threshold {
            total_errors: total,
            elapsed_secs: elapsed.num_seconds(),
        })
    }

    /// Snapshot for the admin surface
    pub fn status(&self) -> GovernorStatus {
        let state = self.state.lock().unwrap();
        let now = Utc::now();
        let first = state.earliest_first_seen();
        let threshold_minutes = self
            .store
            .get_int_parameter("redeploy_threshold_minutes", 4)
            .unwrap_or(4);
        let max_errors = self.store.get_int_parameter("max_http_errors", 5).unwrap_or(5) as u32;
        let elapsed = first.map(|f| (now - f).num_seconds());

        GovernorStatus {
            error_401_count: state.e401.count,
            error_403_count: state.e403.count,
            error_429_count: state.e429.count,
            total_errors: state.total_errors(),
            first_error_time: first.map(|t| t.to_rfc3339()),
            success_streak: state.success_streak,
            success_threshold: self.tunables.success_threshold,
            last_redeploy_time: state.last_redeploy.map(|t| t.to_rfc3339()),
            redeploy_threshold_minutes: threshold_minutes,
            max_http_errors: max_errors,
            time_since_first_error_seconds: elapsed,
            redeploy_needed: elapsed
                .map(|e| e >= threshold_minutes * 60 && state.total_errors() >= max_errors)
                .unwrap_or(false),
            restart_pending: state.restart_pending,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Restart actions
// ─────────────────────────────────────────────────────────────────────────────

/// One way of restarting the process from outside
#[async_trait]
pub trait RestartAction: Send + Sync {
    fn name(&self) -> &'static str;
    async fn trigger(&self) -> Result<()>;
}

/// Drain trigger requests and walk the action chain, stopping at the first
/// action that succeeds
pub async fn run_restart_task(
    governor: std::sync::Arc<RestartGovernor>,
    mut restart_rx: mpsc::UnboundedReceiver<TriggerReason>,
    actions: Vec<Box<dyn RestartAction>>,
) {
    while let Some(reason) = restart_rx.recv().await {
        tracing::error!("Executing external restart ({:?})", reason);
        let mut succeeded = false;
        for action in &actions {
            match action.trigger().await {
                Ok(()) => {
                    tracing::info!("Restart action '{}' succeeded", action.name());
                    governor.complete_restart(Utc::now());
                    succeeded = true;
                    break;
                }
                Err(e) => {
                    tracing::error!("Restart action '{}' failed: {}", action.name(), e);
                }
            }
        }
        if !succeeded {
            tracing::error!("All restart actions failed; counters kept for the next trigger");
            governor.abort_restart();
        }
    }
}

/// Build the production action chain from the environment
pub fn default_restart_actions(config: &Config, store: &Store) -> Vec<Box<dyn RestartAction>> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .expect("Failed to build restart client");

    let mut actions: Vec<Box<dyn RestartAction>> = Vec::new();
    actions.push(Box::new(ControlPlaneRedeploy {
        client: client.clone(),
        token: config.railway_token.clone(),
        project_id: config.railway_project_id.clone(),
        service_id: Mutex::new(config.railway_service_id.clone()),
    }));
    actions.push(Box::new(CliRedeploy));
    actions.push(Box::new(WebhookRedeploy {
        client,
        url: config.railway_redeploy_webhook.clone(),
    }));
    actions.push(Box::new(EmergencyExit {
        allowed: config.allow_emergency_exit,
        store: store.clone(),
    }));
    actions
}

/// GraphQL mutation against the hosting provider's control plane
struct ControlPlaneRedeploy {
    client: reqwest::Client,
    token: Option<String>,
    project_id: Option<String>,
    /// Discovered lazily from the project when not provided
    service_id: Mutex<Option<String>>,
}

const CONTROL_PLANE_URL: &str = "https://backboard.railway.com/graphql/v2";

impl ControlPlaneRedeploy {
    async fn discover_service_id(&self, token: &str) -> Result<String> {
        let project_id = self
            .project_id
            .as_deref()
            .context("No project id for service discovery")?;
        let payload = serde_json::json!({
            "query": "query project($projectId: String!) { project(id: $projectId) { \
                      services { edges { node { id name } } } } }",
            "variables": {"projectId": project_id},
        });
        let response: serde_json::Value = self
            .client
            .post(CONTROL_PLANE_URL)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let edges = response["data"]["project"]["services"]["edges"]
            .as_array()
            .context("Malformed service list")?;

        // Prefer a service whose name looks like the main deployment
        let main = edges.iter().find(|e| {
            e["node"]["name"]
                .as_str()
                .map(|n| {
                    let n = n.to_lowercase();
                    ["app", "web", "main", "watcher"].iter().any(|k| n.contains(k))
                })
                .unwrap_or(false)
        });
        let node = main.or_else(|| edges.first()).context("Project has no services")?;
        let id = node["node"]["id"].as_str().context("Service without id")?;
        Ok(id.to_string())
    }
}

#[async_trait]
impl RestartAction for ControlPlaneRedeploy {
    fn name(&self) -> &'static str {
        "control-plane-api"
    }

    async fn trigger(&self) -> Result<()> {
        let token = self.token.as_deref().context("No control-plane token")?;

        let service_id = {
            let cached = self.service_id.lock().unwrap().clone();
            match cached {
                Some(id) => id,
                None => {
                    let id = self.discover_service_id(token).await?;
                    *self.service_id.lock().unwrap() = Some(id.clone());
                    id
                }
            }
        };

        let payload = serde_json::json!({
            "query": "mutation serviceRedeploy($serviceId: String!) { \
                      serviceRedeploy(serviceId: $serviceId) { id } }",
            "variables": {"serviceId": service_id},
        });
        let response: serde_json::Value = self
            .client
            .post(CONTROL_PLANE_URL)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.get("errors").is_some() {
            bail!("Control plane returned errors: {}", response["errors"]);
        }
        Ok(())
    }
}

/// `railway redeploy -y` through the provider CLI
struct CliRedeploy;

#[async_trait]
impl RestartAction for CliRedeploy {
    fn name(&self) -> &'static str {
        "provider-cli"
    }

    async fn trigger(&self) -> Result<()> {
        let output = tokio::time::timeout(
            std::time::Duration::from_secs(60),
            tokio::process::Command::new("railway")
                .args(["redeploy", "-y"])
                .output(),
        )
        .await
        .context("CLI redeploy timed out")?
        .context("CLI not available")?;

        if !output.status.success() {
            bail!(
                "CLI redeploy exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }
}

/// POST to an operator-provided webhook
struct WebhookRedeploy {
    client: reqwest::Client,
    url: Option<String>,
}

#[async_trait]
impl RestartAction for WebhookRedeploy {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn trigger(&self) -> Result<()> {
        let url = self.url.as_deref().context("No redeploy webhook configured")?;
        let response = self
            .client
            .post(url)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;
        if !matches!(response.status().as_u16(), 200 | 201 | 202) {
            bail!("Webhook returned HTTP {}", response.status());
        }
        Ok(())
    }
}

/// Last resort: flush state and exit non-zero so the host supervisor
/// relaunches the process. Gated by ALLOW_EMERGENCY_EXIT.
struct EmergencyExit {
    allowed: bool,
    store: Store,
}

#[async_trait]
impl RestartAction for EmergencyExit {
    fn name(&self) -> &'static str {
        "emergency-exit"
    }

    async fn trigger(&self) -> Result<()> {
        if !self.allowed {
            bail!("Emergency exit disabled by ALLOW_EMERGENCY_EXIT");
        }
        tracing::error!("EMERGENCY RESTART: exiting with status 1 for the supervisor to relaunch");

        // Persist the restart time ourselves - the process will not live to
        // see complete_restart
        let _ = self
            .store
            .set_parameter(LAST_REDEPLOY_KEY, &Utc::now().to_rfc3339());

        tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            std::process::exit(1);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_governor() -> (
        std::sync::Arc<RestartGovernor>,
        mpsc::UnboundedReceiver<TriggerReason>,
    ) {
        let store = Store::in_memory().unwrap();
        RestartGovernor::new(store, Tunables::default())
    }

    #[test]
    fn test_counters_are_independent() {
        let (governor, _rx) = test_governor();
        let now = Utc::now();
        governor.report_error_at(UpstreamError::Forbidden403, now);
        governor.report_error_at(UpstreamError::Forbidden403, now);
        governor.report_error_at(UpstreamError::RateLimited429, now);

        let status = governor.status();
        assert_eq!(status.error_403_count, 2);
        assert_eq!(status.error_429_count, 1);
        assert_eq!(status.error_401_count, 0);
        assert_eq!(status.total_errors, 3);
    }

    #[test]
    fn test_silent_counter_restarts_from_one() {
        let (governor, _rx) = test_governor();
        let start = Utc::now();
        governor.report_error_at(UpstreamError::Forbidden403, start);
        governor.report_error_at(UpstreamError::Forbidden403, start + chrono::Duration::seconds(10));
        // More than five minutes of silence resets the counter first
        governor.report_error_at(
            UpstreamError::Forbidden403,
            start + chrono::Duration::seconds(700),
        );
        assert_eq!(governor.status().error_403_count, 1);
    }

    #[test]
    fn test_single_success_does_not_reset_counters() {
        let (governor, _rx) = test_governor();
        let now = Utc::now();
        for _ in 0..99 {
            governor.report_error_at(UpstreamError::Forbidden403, now);
        }
        governor.report_success();
        assert_eq!(governor.status().error_403_count, 99);
        assert_eq!(governor.status().success_streak, 1);
    }

    #[test]
    fn test_streak_at_threshold_resets_counters() {
        let (governor, _rx) = test_governor();
        let now = Utc::now();
        governor.report_error_at(UpstreamError::Auth401, now);
        for _ in 0..10 {
            governor.report_success();
        }
        let status = governor.status();
        assert_eq!(status.total_errors, 0);
        assert_eq!(status.success_streak, 0);
    }

    #[test]
    fn test_error_resets_streak() {
        let (governor, _rx) = test_governor();
        for _ in 0..5 {
            governor.report_success();
        }
        governor.report_error_at(UpstreamError::RateLimited429, Utc::now());
        assert_eq!(governor.status().success_streak, 0);
    }

    #[test]
    fn test_generic_error_resets_streak_without_counting() {
        let (governor, _rx) = test_governor();
        for _ in 0..5 {
            governor.report_success();
        }
        governor.report_generic_error();
        let status = governor.status();
        assert_eq!(status.success_streak, 0);
        assert_eq!(status.total_errors, 0);
    }

    #[test]
    fn test_hundredth_error_triggers_exactly_once_bypassing_cooldown() {
        let (governor, mut rx) = test_governor();
        let now = Utc::now();

        // A very recent restart would normally block the trigger
        {
            let mut state = governor.state.lock().unwrap();
            state.last_redeploy = Some(now - chrono::Duration::seconds(10));
        }

        for _ in 0..100 {
            governor.report_error_at(UpstreamError::Forbidden403, now);
        }
        // Errors keep arriving while the restart is pending
        for _ in 0..5 {
            governor.report_error_at(UpstreamError::Forbidden403, now);
        }

        let reason = rx.try_recv().expect("one trigger expected");
        assert!(matches!(reason, TriggerReason::Critical { total_errors: 100 }));
        assert!(rx.try_recv().is_err(), "restart must be requested exactly once");
    }

    #[test]
    fn test_normal_trigger_needs_elapsed_time_and_count() {
        let (governor, mut rx) = test_governor();
        let start = Utc::now();

        // Five errors but not enough elapsed time: no trigger. Spread inside
        // the five-minute window so the counter keeps accumulating.
        for i in 0..5 {
            governor.report_error_at(
                UpstreamError::Forbidden403,
                start + chrono::Duration::seconds(i * 30),
            );
        }
        assert!(rx.try_recv().is_err());

        // Another error past the four-minute threshold trips the trigger
        governor.report_error_at(
            UpstreamError::Forbidden403,
            start + chrono::Duration::seconds(4 * 60 + 1),
        );
        assert!(matches!(
            rx.try_recv().expect("trigger"),
            TriggerReason::Threshold { .. }
        ));
    }

    #[test]
    fn test_cooldown_blocks_normal_trigger() {
        let (governor, mut rx) = test_governor();
        let start = Utc::now();
        {
            let mut state = governor.state.lock().unwrap();
            state.last_redeploy = Some(start + chrono::Duration::seconds(4 * 60));
        }
        for i in 0..6 {
            governor.report_error_at(
                UpstreamError::Forbidden403,
                start + chrono::Duration::seconds(i * 60),
            );
        }
        assert!(rx.try_recv().is_err(), "cooldown must hold the trigger back");
    }

    #[test]
    fn test_complete_restart_persists_and_resets() {
        let (governor, mut rx) = test_governor();
        let now = Utc::now();
        for _ in 0..100 {
            governor.report_error_at(UpstreamError::Auth401, now);
        }
        assert!(rx.try_recv().is_ok());

        let restart_time = now + chrono::Duration::seconds(5);
        governor.complete_restart(restart_time);

        let status = governor.status();
        assert_eq!(status.total_errors, 0);
        assert!(!status.restart_pending);
        assert_eq!(
            status.last_redeploy_time.as_deref(),
            Some(restart_time.to_rfc3339().as_str())
        );
        // Persisted for the relaunched process
        let stored = governor.store.get_parameter(LAST_REDEPLOY_KEY).unwrap().unwrap();
        assert_eq!(stored, restart_time.to_rfc3339());
    }

    #[tokio::test]
    async fn test_restart_task_stops_at_first_success() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct Scripted {
            calls: std::sync::Arc<AtomicU32>,
            succeed: bool,
        }

        #[async_trait]
        impl RestartAction for Scripted {
            fn name(&self) -> &'static str {
                "scripted"
            }
            async fn trigger(&self) -> Result<()> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.succeed {
                    Ok(())
                } else {
                    bail!("scripted failure")
                }
            }
        }

        let (governor, restart_rx) = test_governor();
        let first = std::sync::Arc::new(AtomicU32::new(0));
        let second = std::sync::Arc::new(AtomicU32::new(0));
        let third = std::sync::Arc::new(AtomicU32::new(0));
        let actions: Vec<Box<dyn RestartAction>> = vec![
            Box::new(Scripted { calls: first.clone(), succeed: false }),
            Box::new(Scripted { calls: second.clone(), succeed: true }),
            Box::new(Scripted { calls: third.clone(), succeed: true }),
        ];

        let task = tokio::spawn(run_restart_task(governor.clone(), restart_rx, actions));
        assert!(governor.force_restart());

        // Wait for the pending flag to clear
        for _ in 0..50 {
            if !governor.status().restart_pending {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 0, "chain stops at first success");
        assert!(governor.status().last_redeploy_time.is_some());
        task.abort();
    }
}
