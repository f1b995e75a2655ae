//! Token pool - a fixed-size pool of independent upstream identities
//!
//! Each session bundles an isolated HTTP client (own cookie jar), an
//! exclusive proxy drawn from the proxy pool, a realistic browser User-Agent,
//! and a bearer token extracted from the `access_token_web` cookie set by the
//! marketplace landing page. Token and proxy live and die together: rotation
//! always replaces the whole pair, never one half.
//!
//! Worker `w` is bound to slot `w` for its lifetime. An invalid session is
//! replaced in place at the same index so the worker -> slot mapping never
//! shifts, and a worker never inherits another worker's session.

use crate::config::Tunables;
use crate::proxy_pool::{mask_credentials, ProxyPool};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rand::seq::SliceRandom;
use reqwest::cookie::CookieStore;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Marketplace landing page that sets the `access_token_web` cookie
const LANDING_URL: &str = "https://www.vinted.de/";

/// Pool of realistic User-Agents (Chrome, Firefox, Edge - latest versions)
pub const USER_AGENTS: &[&str] = &[
    // Chrome variants
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Firefox variants
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    // Edge variants
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36 Edg/130.0.0.0",
];

/// One upstream identity: client, bearer, User-Agent, and proxy bound together
struct TokenSession {
    session_id: u64,
    client: reqwest::Client,
    bearer_token: String,
    user_agent: &'static str,
    proxy: Option<String>,
    request_count: u32,
    error_count: u32,
    scan_count: u32,
    valid: bool,
}

/// Cloneable snapshot handed to a worker for one scan.
///
/// The client is internally reference-counted, so cloning is cheap and the
/// pool keeps sole ownership of the mutable counters.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: u64,
    pub client: reqwest::Client,
    pub bearer_token: String,
    pub user_agent: &'static str,
    pub proxy: Option<String>,
}

/// The slice of pool behavior workers depend on, as a seam so the worker
/// loop can run against a stub in tests
#[async_trait]
pub trait SessionSource: Send + Sync {
    fn session_for_worker(&self, worker_index: usize) -> Option<SessionHandle>;
    fn needs_rotation(&self, worker_index: usize) -> bool;
    fn reset_scan_count(&self, worker_index: usize);
    fn report_success(&self, worker_index: usize);
    fn report_error(&self, worker_index: usize);
    async fn create_fresh_pair(&self, worker_index: usize) -> Option<SessionHandle>;
}

#[async_trait]
impl SessionSource for TokenPool {
    fn session_for_worker(&self, worker_index: usize) -> Option<SessionHandle> {
        TokenPool::session_for_worker(self, worker_index)
    }
    fn needs_rotation(&self, worker_index: usize) -> bool {
        TokenPool::needs_rotation(self, worker_index)
    }
    fn reset_scan_count(&self, worker_index: usize) {
        TokenPool::reset_scan_count(self, worker_index)
    }
    fn report_success(&self, worker_index: usize) {
        TokenPool::report_success(self, worker_index)
    }
    fn report_error(&self, worker_index: usize) {
        TokenPool::report_error(self, worker_index)
    }
    async fn create_fresh_pair(&self, worker_index: usize) -> Option<SessionHandle> {
        TokenPool::create_fresh_pair(self, worker_index).await
    }
}

/// Pool statistics for the admin surface
#[derive(Debug, Serialize)]
pub struct TokenPoolStats {
    pub total_sessions: usize,
    pub valid_sessions: usize,
    pub target_size: usize,
    pub total_requests: u64,
    pub total_errors: u64,
}

pub struct TokenPool {
    proxy_pool: Arc<ProxyPool>,
    tunables: Tunables,
    target_size: usize,
    max_size: usize,
    sessions: Mutex<Vec<Option<TokenSession>>>,
    next_session_id: AtomicU64,
}

impl TokenPool {
    pub fn new(
        proxy_pool: Arc<ProxyPool>,
        tunables: Tunables,
        target_size: usize,
        max_size: usize,
    ) -> Self {
        let target_size = target_size.min(max_size);
        Self {
            proxy_pool,
            tunables,
            target_size,
            max_size,
            sessions: Mutex::new(Vec::new()),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Create all sessions up front so the fleet starts with warm identities.
    ///
    /// Sessions are built on a bounded concurrent stream with a small start
    /// jitter per slot; failures leave the slot empty and the owning worker
    /// fills it on its first cycle.
    pub async fn prewarm(&self) {
        tracing::info!("Pre-warming token pool: {} sessions", self.target_size);

        // Load the proxy cache and give previously failed proxies a chance
        // before binding pairs
        self.proxy_pool.get_random_proxy().await;
        let recovered = self.proxy_pool.recheck_bad_proxies().await;
        if recovered > 0 {
            tracing::info!("{} proxies recovered before pre-warm", recovered);
        }

        let started = std::time::Instant::now();
        let results: Vec<(usize, Option<TokenSession>)> = stream::iter(0..self.target_size)
            .map(|index| async move {
                tokio::time::sleep(std::time::Duration::from_millis(index as u64 * 100)).await;
                let proxy = self.proxy_pool.get_random_proxy().await;
                match self.create_session(proxy).await {
                    Ok(session) => (index, Some(session)),
                    Err(e) => {
                        tracing::warn!("Session for slot {} failed: {}", index, e);
                        (index, None)
                    }
                }
            })
            .buffer_unordered(self.tunables.prewarm_concurrency)
            .collect()
            .await;

        let mut created = 0;
        let mut sessions = self.sessions.lock().unwrap();
        sessions.resize_with(self.target_size, || None);
        for (index, session) in results {
            if session.is_some() {
                created += 1;
            }
            sessions[index] = session;
        }
        tracing::info!(
            "Pre-warm complete: {}/{} sessions in {:.1}s",
            created,
            self.target_size,
            started.elapsed().as_secs_f64()
        );
    }

    /// Snapshot of the session bound to `worker_index`, if it exists and is
    /// still valid
    pub fn session_for_worker(&self, worker_index: usize) -> Option<SessionHandle> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(worker_index)
            .and_then(|slot| slot.as_ref())
            .filter(|s| s.valid)
            .map(Self::handle_of)
    }

    /// Whether the slot needs the proactive every-K-scans rotation
    pub fn needs_rotation(&self, worker_index: usize) -> bool {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(worker_index)
            .and_then(|slot| slot.as_ref())
            .map(|s| s.scan_count >= self.tunables.rotation_scans)
            .unwrap_or(false)
    }

    /// Delay the next rotation after a failed pair creation
    pub fn reset_scan_count(&self, worker_index: usize) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(Some(session)) = sessions.get_mut(worker_index) {
            session.scan_count = 0;
        }
    }

    /// Record a successful scan for the slot
    pub fn report_success(&self, worker_index: usize) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(Some(session)) = sessions.get_mut(worker_index) {
            session.request_count += 1;
            session.scan_count += 1;
        }
    }

    /// Record an error for the slot; the session is invalidated once the
    /// error budget is exhausted
    pub fn report_error(&self, worker_index: usize) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(Some(session)) = sessions.get_mut(worker_index) {
            session.error_count += 1;
            if session.error_count >= self.tunables.max_session_errors && session.valid {
                session.valid = false;
                tracing::warn!(
                    "Session #{} marked invalid ({} errors)",
                    session.session_id,
                    session.error_count
                );
            }
        }
    }

    /// Build a new (proxy, token) pair and install it at `worker_index`.
    ///
    /// Construction happens outside the lock; the swap is atomic. On failure
    /// the old session (possibly invalid) stays in place and the caller
    /// retries on its next cycle.
    pub async fn create_fresh_pair(&self, worker_index: usize) -> Option<SessionHandle> {
        // Periodically fold recovered proxies back in during normal operation
        if worker_index % 15 == 0 {
            self.proxy_pool.recheck_bad_proxies().await;
        }

        let proxy = self.proxy_pool.get_random_proxy().await;
        match self.create_session(proxy).await {
            Ok(session) => {
                let handle = Self::handle_of(&session);
                let mut sessions = self.sessions.lock().unwrap();
                if worker_index >= sessions.len() {
                    if worker_index >= self.max_size {
                        tracing::error!("Worker index {} exceeds pool max size", worker_index);
                        return None;
                    }
                    sessions.resize_with(worker_index + 1, || None);
                }
                let old_id = sessions[worker_index].as_ref().map(|s| s.session_id);
                sessions[worker_index] = Some(session);
                match old_id {
                    Some(old) => tracing::info!(
                        "Worker #{}: replaced session #{} with #{}",
                        worker_index,
                        old,
                        handle.session_id
                    ),
                    None => tracing::info!(
                        "Worker #{}: installed session #{}",
                        worker_index,
                        handle.session_id
                    ),
                }
                Some(handle)
            }
            Err(e) => {
                tracing::error!("Fresh pair for worker #{} failed: {}", worker_index, e);
                None
            }
        }
    }

    /// Pool statistics for `GET /control/status`
    pub fn stats(&self) -> TokenPoolStats {
        let sessions = self.sessions.lock().unwrap();
        let live: Vec<&TokenSession> = sessions.iter().flatten().collect();
        TokenPoolStats {
            total_sessions: live.len(),
            valid_sessions: live.iter().filter(|s| s.valid).count(),
            target_size: self.target_size,
            total_requests: live.iter().map(|s| s.request_count as u64).sum(),
            total_errors: live.iter().map(|s| s.error_count as u64).sum(),
        }
    }

    fn handle_of(session: &TokenSession) -> SessionHandle {
        SessionHandle {
            session_id: session.session_id,
            client: session.client.clone(),
            bearer_token: session.bearer_token.clone(),
            user_agent: session.user_agent,
            proxy: session.proxy.clone(),
        }
    }

    /// Construct one session: isolated client, browser headers, landing-page
    /// visit, bearer extraction
    async fn create_session(&self, proxy: Option<String>) -> Result<TokenSession> {
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);

        if proxy.is_none() {
            tracing::warn!("Session #{}: no proxy available, connecting directly", session_id);
        }

        let jar = Arc::new(reqwest::cookie::Jar::default());
        let mut builder = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .default_headers(browser_headers(user_agent))
            .timeout(self.tunables.token_timeout)
            .gzip(true);
        if let Some(proxy_url) = &proxy {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy_url)
                    .with_context(|| format!("Bad proxy {}", mask_credentials(proxy_url)))?,
            );
        }
        let client = builder.build().context("Failed to build session client")?;

        let response = client
            .get(LANDING_URL)
            .send()
            .await
            .context("Landing page request failed")?;
        if response.status() != reqwest::StatusCode::OK {
            bail!("Landing page returned HTTP {}", response.status());
        }

        let landing = url::Url::parse(LANDING_URL).expect("static URL");
        let bearer_token = jar
            .cookies(&landing)
            .and_then(|header| extract_cookie(header.to_str().ok()?, "access_token_web"))
            .context("No access_token_web cookie in landing response")?;

        tracing::info!(
            "Session #{} ready | proxy: {} | UA: {:.60}",
            session_id,
            proxy.as_deref().map(mask_credentials).unwrap_or_else(|| "direct".into()),
            user_agent
        );

        Ok(TokenSession {
            session_id,
            client,
            bearer_token,
            user_agent,
            proxy,
            request_count: 0,
            error_count: 0,
            scan_count: 0,
            valid: true,
        })
    }
}

/// Document-style headers a real browser sends to the landing page.
///
/// Chrome-family agents (but not Edge) additionally advertise client hints;
/// Firefox and Edge must not, or the header set contradicts the UA.
pub fn browser_headers(user_agent: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("Accept", HeaderValue::from_static("application/json, text/plain, */*"));
    headers.insert(
        "Accept-Language",
        HeaderValue::from_static("de-DE,de;q=0.9,en-US;q=0.8,en;q=0.7"),
    );
    headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("empty"));
    headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("cors"));
    headers.insert("Sec-Fetch-Site", HeaderValue::from_static("same-origin"));
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Pragma", HeaderValue::from_static("no-cache"));
    headers.insert("Referer", HeaderValue::from_static("https://www.vinted.de/"));
    headers.insert("Origin", HeaderValue::from_static("https://www.vinted.de"));
    headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
    if let Ok(ua) = HeaderValue::from_str(user_agent) {
        headers.insert("User-Agent", ua);
    }

    if user_agent.contains("Chrome") && !user_agent.contains("Edg") {
        headers.insert(
            "Sec-Ch-Ua",
            HeaderValue::from_static(
                "\"Google Chrome\";v=\"131\", \"Chromium\";v=\"131\", \"Not_A Brand\";v=\"24\"",
            ),
        );
        headers.insert("Sec-Ch-Ua-Mobile", HeaderValue::from_static("?0"));
        headers.insert("Sec-Ch-Ua-Platform", HeaderValue::from_static("\"Windows\""));
    }

    headers
}

/// Pull one cookie value out of a `a=b; c=d` cookie header string
fn extract_cookie(cookie_header: &str, name: &str) -> Option<String> {
    cookie_header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Build the Authorization header value for a session's bearer token
pub fn bearer_header(token: &str) -> Option<(reqwest::header::HeaderName, HeaderValue)> {
    HeaderValue::from_str(&format!("Bearer {}", token))
        .ok()
        .map(|v| (AUTHORIZATION, v))
}
