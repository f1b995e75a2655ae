//! Telegram boundary adapter - outbound notifications and bot commands
//!
//! The sender drains the notifier channel single-flight: photo messages go
//! out as `sendPhoto` with the text as caption, the rest as `sendMessage`,
//! always HTML with one inline "Open Vinted" button and the query's topic id
//! when it has one. Flood control (429) waits `retry_after + 2` seconds and
//! retries the same message; a failed threaded send retries once without the
//! thread id so the message still lands in the main chat.
//!
//! The command poller long-polls `getUpdates` and answers the admin commands
//! from the configured chat.

use crate::catalog::canonicalize_url;
use crate::config::Config;
use crate::events::Notification;
use crate::store::Store;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const API_BASE: &str = "https://api.telegram.org";

/// Messages still delivered after the shutdown signal before the sender exits
const SHUTDOWN_DRAIN_LIMIT: usize = 50;

/// Resolved credentials plus the HTTP client
#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    token: String,
    chat_id: String,
}

impl TelegramClient {
    /// Build from env-first credentials with the parameters table as
    /// fallback. None when either credential is missing.
    pub fn from_config(config: &Config, store: &Store) -> Option<Self> {
        let token = config
            .telegram_bot_token
            .clone()
            .or_else(|| store.get_parameter("telegram_token").ok().flatten())
            .filter(|t| !t.is_empty())?;
        let chat_id = config
            .telegram_chat_id
            .clone()
            .or_else(|| store.get_parameter("telegram_chat_id").ok().flatten())
            .filter(|c| !c.is_empty())?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(35))
            .build()
            .ok()?;
        Some(Self {
            http,
            token,
            chat_id,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", API_BASE, self.token, method)
    }

    /// Deliver one notification, honoring flood control and the thread
    /// fallback
    pub async fn deliver(&self, message: &Notification) {
        let mut thread_id = message.thread_id;
        let mut thread_fallback_used = false;

        loop {
            let (method, payload) = build_payload(&self.chat_id, message, thread_id);
            let response = self
                .http
                .post(self.method_url(method))
                .json(&payload)
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => return,
                Ok(response) if response.status().as_u16() == 429 => {
                    let body: Value = response.json().await.unwrap_or_default();
                    let retry_after = body["parameters"]["retry_after"].as_u64().unwrap_or(5);
                    tracing::warn!(
                        "Notifier flood control, retrying in {} seconds",
                        retry_after + 2
                    );
                    tokio::time::sleep(Duration::from_secs(retry_after + 2)).await;
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    if thread_id.is_some() && !thread_fallback_used {
                        // Bad topic id: fall back to the main chat once
                        tracing::warn!(
                            "Threaded send failed (HTTP {}), retrying without thread: {}",
                            status,
                            body
                        );
                        thread_id = None;
                        thread_fallback_used = true;
                    } else {
                        tracing::error!("Notifier send failed (HTTP {}): {}", status, body);
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!("Notifier send failed: {}", e);
                    return;
                }
            }
        }
    }

    /// Send a short HTML reply (bot command responses)
    async fn reply(&self, text: &str, thread_id: Option<i64>) {
        let mut payload = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        if let Some(thread) = thread_id {
            payload["message_thread_id"] = json!(thread);
        }
        if let Err(e) = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&payload)
            .send()
            .await
        {
            tracing::error!("Command reply failed: {}", e);
        }
    }

    async fn get_updates(&self, offset: i64) -> Option<Vec<Value>> {
        let response = self
            .http
            .get(self.method_url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("limit", "20".to_string()),
                ("timeout", "25".to_string()),
            ])
            .send()
            .await
            .ok()?;
        let body: Value = response.json().await.ok()?;
        Some(body["result"].as_array()?.clone())
    }
}

/// Build the API call for one notification: method name plus JSON body
pub fn build_payload(
    chat_id: &str,
    message: &Notification,
    thread_id: Option<i64>,
) -> (&'static str, Value) {
    let reply_markup = json!({
        "inline_keyboard": [[{"text": message.button_text, "url": message.link_url}]]
    });

    let has_photo = message
        .photo_url
        .as_deref()
        .map(|p| !p.is_empty())
        .unwrap_or(false);

    let mut payload = if has_photo {
        json!({
            "chat_id": chat_id,
            "photo": message.photo_url,
            "caption": message.text,
            "parse_mode": "HTML",
            "reply_markup": reply_markup,
        })
    } else {
        json!({
            "chat_id": chat_id,
            "text": message.text,
            "parse_mode": "HTML",
            "reply_markup": reply_markup,
        })
    };
    if let Some(thread) = thread_id {
        payload["message_thread_id"] = json!(thread);
    }

    (if has_photo { "sendPhoto" } else { "sendMessage" }, payload)
}

/// Drain the notifier channel until shutdown, then deliver a bounded tail
pub async fn run_sender(
    client: TelegramClient,
    mut notify_rx: mpsc::Receiver<Notification>,
    enabled: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("Telegram sender started");
    loop {
        tokio::select! {
            message = notify_rx.recv() => {
                let Some(message) = message else { break };
                // Paused via the admin surface: hold the message until resumed
                while !enabled.load(Ordering::Relaxed) {
                    if *shutdown.borrow() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                client.deliver(&message).await;
            }
            _ = shutdown.changed() => {
                let mut drained = 0;
                while drained < SHUTDOWN_DRAIN_LIMIT {
                    match notify_rx.try_recv() {
                        Ok(message) => {
                            client.deliver(&message).await;
                            drained += 1;
                        }
                        Err(_) => break,
                    }
                }
                break;
            }
        }
    }
    tracing::info!("Telegram sender stopped");
}

/// Long-poll `getUpdates` and answer bot commands from the configured chat
pub async fn run_command_poller(
    client: TelegramClient,
    handler: CommandHandler,
    enabled: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("Telegram command poller started");
    let mut offset = 0i64;
    loop {
        if *shutdown.borrow() {
            break;
        }
        if !enabled.load(Ordering::Relaxed) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                _ = shutdown.changed() => break,
            }
        }

        let updates = tokio::select! {
            updates = client.get_updates(offset) => updates,
            _ = shutdown.changed() => break,
        };

        for update in updates.unwrap_or_default() {
            if let Some(update_id) = update["update_id"].as_i64() {
                offset = offset.max(update_id + 1);
            }
            let message = &update["message"];
            let chat_id = message["chat"]["id"]
                .as_i64()
                .map(|id| id.to_string())
                .unwrap_or_default();
            if chat_id != client.chat_id {
                continue;
            }
            let Some(text) = message["text"].as_str() else {
                continue;
            };
            if !text.starts_with('/') {
                continue;
            }
            let thread_id = message["message_thread_id"].as_i64();
            let reply = handler.handle(text, thread_id);
            client.reply(&reply, thread_id).await;
        }
    }
    tracing::info!("Telegram command poller stopped");
}

/// Pure command dispatch, shared by the poller and its tests
pub struct CommandHandler {
    store: Store,
    web_url: String,
}

impl CommandHandler {
    pub fn new(store: Store, web_url: String) -> Self {
        Self { store, web_url }
    }

    pub fn handle(&self, text: &str, message_thread_id: Option<i64>) -> String {
        let mut parts = text.split_whitespace();
        let command = parts
            .next()
            .unwrap_or("")
            .split('@')
            .next()
            .unwrap_or("");
        let argument = parts.collect::<Vec<_>>().join(" ");

        match command {
            "/hello" => "Hello! The watcher is running.".to_string(),
            "/app" => format!("Web UI: {}", self.web_url),
            "/queries" | "/queries_list" => self.list_queries(),
            "/add_query" => self.add_query(&argument),
            "/remove_query" => self.remove_query(&argument),
            "/allowlist" => self.list_allowlist(),
            "/add_country" => self.add_country(&argument),
            "/remove_country" => self.remove_country(&argument),
            "/clear_allowlist" => match self.store.clear_allowlist() {
                Ok(_) => "Allowlist cleared.".to_string(),
                Err(e) => format!("Failed to clear allowlist: {}", e),
            },
            "/thread_id" => match message_thread_id {
                Some(thread) => format!("Thread id: <code>{}</code>", thread),
                None => "This message has no thread id (main chat).".to_string(),
            },
            _ => "Unknown command.".to_string(),
        }
    }

    fn list_queries(&self) -> String {
        match self.store.get_queries() {
            Ok(queries) if queries.is_empty() => "No queries configured.".to_string(),
            Ok(queries) => queries
                .iter()
                .enumerate()
                .map(|(i, q)| format!("{}. {}", i + 1, q.label()))
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("Failed to list queries: {}", e),
        }
    }

    fn add_query(&self, argument: &str) -> String {
        if argument.is_empty() {
            return "Usage: /add_query &lt;catalog URL&gt;".to_string();
        }
        let canonical = match canonicalize_url(argument) {
            Ok(url) => url,
            Err(_) => return "Invalid query URL.".to_string(),
        };
        match self.store.add_query(&canonical, None, None) {
            Ok(true) => "Query added.".to_string(),
            Ok(false) => "Query already exists.".to_string(),
            Err(e) => format!("Failed to add query: {}", e),
        }
    }

    fn remove_query(&self, argument: &str) -> String {
        if argument == "all" {
            return match self.store.remove_all_queries() {
                Ok(_) => "All queries removed.".to_string(),
                Err(e) => format!("Failed to remove queries: {}", e),
            };
        }
        let Ok(id) = argument.parse::<i64>() else {
            return "Invalid query ID.".to_string();
        };
        match self.store.remove_query(id) {
            Ok(true) => "Query removed.".to_string(),
            Ok(false) => "No such query.".to_string(),
            Err(e) => format!("Failed to remove query: {}", e),
        }
    }

    fn list_allowlist(&self) -> String {
        match self.store.get_allowlist() {
            Ok(countries) if countries.is_empty() => {
                "Allowlist is empty - all countries allowed.".to_string()
            }
            Ok(countries) => format!("Allowed countries: {}", countries.join(", ")),
            Err(e) => format!("Failed to read allowlist: {}", e),
        }
    }

    fn add_country(&self, argument: &str) -> String {
        let country = argument.replace(' ', "").to_uppercase();
        if country.len() != 2 {
            return "Invalid country code".to_string();
        }
        match self.store.add_to_allowlist(&country) {
            Ok(true) => "Country added.".to_string(),
            Ok(false) => format!("Country \"{}\" already in allowlist.", country),
            Err(e) => format!("Failed to add country: {}", e),
        }
    }

    fn remove_country(&self, argument: &str) -> String {
        let country = argument.replace(' ', "").to_uppercase();
        if country.len() != 2 {
            return "Invalid country code".to_string();
        }
        match self.store.remove_from_allowlist(&country) {
            Ok(true) => "Country removed.".to_string(),
            Ok(false) => "Country not in allowlist.".to_string(),
            Err(e) => format!("Failed to remove country: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_notification(photo: Option<&str>, thread_id: Option<i64>) -> Notification {
        Notification {
            text: "<b>Boot</b>".to_string(),
            link_url: "https://www.vinted.de/items/A".to_string(),
            button_text: "Open Vinted".to_string(),
            thread_id,
            photo_url: photo.map(String::from),
        }
    }

    #[test]
    fn test_photo_message_uses_send_photo_with_caption() {
        let (method, payload) = build_payload("42", &sample_notification(Some("pic"), None), None);
        assert_eq!(method, "sendPhoto");
        assert_eq!(payload["photo"], "pic");
        assert_eq!(payload["caption"], "<b>Boot</b>");
        assert_eq!(payload["parse_mode"], "HTML");
        assert!(payload.get("text").is_none());
    }

    #[test]
    fn test_plain_message_uses_send_message() {
        let (method, payload) = build_payload("42", &sample_notification(None, None), None);
        assert_eq!(method, "sendMessage");
        assert_eq!(payload["text"], "<b>Boot</b>");
        assert_eq!(
            payload["reply_markup"]["inline_keyboard"][0][0]["text"],
            "Open Vinted"
        );
        assert_eq!(
            payload["reply_markup"]["inline_keyboard"][0][0]["url"],
            "https://www.vinted.de/items/A"
        );
    }

    #[test]
    fn test_empty_photo_url_falls_back_to_text() {
        let (method, _) = build_payload("42", &sample_notification(Some(""), None), None);
        assert_eq!(method, "sendMessage");
    }

    #[test]
    fn test_thread_id_included_only_when_routed() {
        let message = sample_notification(None, Some(7));
        let (_, with_thread) = build_payload("42", &message, Some(7));
        assert_eq!(with_thread["message_thread_id"], 7);

        // The fallback retry passes None even though the message carries one
        let (_, without) = build_payload("42", &message, None);
        assert!(without.get("message_thread_id").is_none());
    }

    fn handler() -> CommandHandler {
        let store = Store::in_memory().unwrap();
        CommandHandler::new(store, "http://localhost:8000".to_string())
    }

    #[test]
    fn test_hello_and_app() {
        let h = handler();
        assert!(h.handle("/hello", None).contains("running"));
        assert!(h.handle("/app", None).contains("http://localhost:8000"));
    }

    #[test]
    fn test_add_query_canonicalizes_and_dedupes() {
        let h = handler();
        let reply = h.handle(
            "/add_query https://www.vinted.de/catalog?search_text=shoes&time=99&order=relevance",
            None,
        );
        assert_eq!(reply, "Query added.");

        // Same search with different volatile params is the same query
        let reply = h.handle(
            "/add_query https://www.vinted.de/catalog?search_text=shoes&time=11",
            None,
        );
        assert_eq!(reply, "Query already exists.");

        let listed = h.handle("/queries", None);
        assert_eq!(listed, "1. shoes");
    }

    #[test]
    fn test_remove_query_validates_id() {
        let h = handler();
        h.handle("/add_query https://www.vinted.de/catalog?search_text=x", None);
        assert_eq!(h.handle("/remove_query nope", None), "Invalid query ID.");
        assert_eq!(h.handle("/remove_query all", None), "All queries removed.");
        assert_eq!(h.handle("/queries", None), "No queries configured.");
    }

    #[test]
    fn test_country_commands_validate_and_normalize() {
        let h = handler();
        assert_eq!(h.handle("/add_country de", None), "Country added.");
        assert_eq!(
            h.handle("/add_country d e", None),
            "Country \"DE\" already in allowlist."
        );
        assert_eq!(h.handle("/add_country DEU", None), "Invalid country code");
        assert!(h.handle("/allowlist", None).contains("DE"));
        assert_eq!(h.handle("/remove_country de", None), "Country removed.");
        assert!(h.handle("/allowlist", None).contains("all countries allowed"));
    }

    #[test]
    fn test_thread_id_echo() {
        let h = handler();
        assert!(h.handle("/thread_id", Some(55)).contains("55"));
        assert!(h.handle("/thread_id", None).contains("main chat"));
    }

    #[test]
    fn test_command_with_bot_suffix() {
        let h = handler();
        assert!(h.handle("/hello@my_watcher_bot", None).contains("running"));
    }
}
