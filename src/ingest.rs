//! Ingestion pipeline - candidate items in, persisted records and
//! notifications out, exactly once
//!
//! A single consumer drains the items channel on a fast tick. Per invocation
//! it processes a bounded number of batches and loads the query list once.
//! Items inside a batch are handled in reverse so the oldest listing notifies
//! first, approximating publication order.
//!
//! The ordering guarantee per item: dedupe check, then persist and watermark
//! in one transaction, then notify. A failed persist never notifies; a failed
//! notify never rolls back the persisted row. Together with the store's
//! unique constraint this keeps notifications at-most-once even across
//! restarts.

use crate::config::Tunables;
use crate::events::{ItemBatch, Notification};
use crate::item::Item;
use crate::store::{Query, Store};
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};

pub struct IngestPipeline {
    store: Store,
    items_rx: mpsc::Receiver<ItemBatch>,
    notify_tx: mpsc::Sender<Notification>,
    tunables: Tunables,
    shutdown: watch::Receiver<bool>,
}

impl IngestPipeline {
    pub fn new(
        store: Store,
        items_rx: mpsc::Receiver<ItemBatch>,
        notify_tx: mpsc::Sender<Notification>,
        tunables: Tunables,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            items_rx,
            notify_tx,
            tunables,
            shutdown,
        }
    }

    /// Consumer loop; returns on shutdown
    pub async fn run(mut self) {
        tracing::info!("Ingestion pipeline started");
        let mut tick = tokio::time::interval(self.tunables.ingest_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => self.drain_once().await,
                _ = self.shutdown.changed() => break,
            }
        }
        tracing::info!("Ingestion pipeline stopped");
    }

    /// Process up to `max_batches_per_tick` pending batches. The query list
    /// is cached for the invocation so items do not pay a per-row lookup.
    pub(crate) async fn drain_once(&mut self) {
        let mut queries: Option<HashMap<i64, Query>> = None;

        for _ in 0..self.tunables.max_batches_per_tick {
            let batch = match self.items_rx.try_recv() {
                Ok(batch) => batch,
                Err(_) => break,
            };

            if queries.is_none() {
                queries = match self.store.get_queries() {
                    Ok(list) => Some(list.into_iter().map(|q| (q.id, q)).collect()),
                    Err(e) => {
                        // Without the query list there is no thread routing;
                        // skip the tick and let the channel retry
                        tracing::error!("Query list unavailable, deferring batch: {}", e);
                        return;
                    }
                };
            }

            let thread_id = queries
                .as_ref()
                .and_then(|map| map.get(&batch.query_id))
                .and_then(|q| q.thread_id);

            // Reverse: upstream returns newest first, notifications go out
            // oldest first
            for item in batch.items.iter().rev() {
                self.process_item(item, batch.query_id, thread_id).await;
            }
        }
    }

    async fn process_item(&self, item: &Item, query_id: i64, thread_id: Option<i64>) {
        match self.store.is_item_in_store(&item.id) {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                // Unknown dedupe state: skipping is the safe default
                tracing::error!("Dedupe check failed for {}: {}", item.id, e);
                return;
            }
        }

        if let Err(e) = self.enforce_item_cap() {
            tracing::error!("Item cap enforcement failed: {}", e);
        }

        // One transaction persists the item and advances the watermark; an
        // error rolls both back and suppresses the notification
        let found_ts = Utc::now().timestamp();
        match self.store.add_item(item, query_id, found_ts) {
            Ok(true) => {}
            Ok(false) => return, // lost a race; the winner notified
            Err(e) => {
                tracing::error!("Persist failed for {}, not notifying: {}", item.id, e);
                return;
            }
        }

        let notification = Notification {
            text: format_notification(item, found_ts),
            link_url: item.url.clone(),
            button_text: "Open Vinted".to_string(),
            thread_id,
            photo_url: item.photo_url.clone(),
        };
        if self.notify_tx.send(notification).await.is_err() {
            tracing::warn!("Notifier channel closed, dropping message for {}", item.id);
        }
    }

    /// Soft bound on stored items; prune the oldest back to the floor
    fn enforce_item_cap(&self) -> anyhow::Result<()> {
        let count = self.store.items_count()?;
        if count >= self.tunables.soft_item_cap {
            let deleted = self.store.prune_items_to(self.tunables.item_prune_floor)?;
            tracing::warn!(
                "Item cap reached ({}), pruned {} oldest items",
                count,
                deleted
            );
        }
        Ok(())
    }
}

/// Build the HTML notification body.
///
/// Shape: bold title, bold price line (annotated with the discovery latency
/// when fresh), optional size line, brand line, and an invisible link that
/// makes Telegram render the photo preview.
pub fn format_notification(item: &Item, found_ts: i64) -> String {
    let mut price_line = format!("<b>💶{} {}</b>", item.price, item.currency);
    if let Some(suffix) = latency_suffix(item.published_ts, found_ts) {
        price_line.push_str(&format!(" ⚡{}", suffix));
    }

    let mut text = match &item.size_title {
        Some(size) => format!(
            "<b>{}</b>\n{}\n⛓️ {}\n{}",
            item.title, price_line, size, item.brand_title
        ),
        None => format!("<b>{}</b>\n{}\n{}", item.title, price_line, item.brand_title),
    };

    if let Some(photo) = &item.photo_url {
        if !photo.is_empty() {
            text.push_str(&format!("\n<a href='{}'>&#8205;</a>", photo));
        }
    }
    text
}

/// Discovery-latency annotation: present only when the publication time is
/// known, not in the future, and less than one hour old at discovery.
fn latency_suffix(published_ts: Option<i64>, found_ts: i64) -> Option<String> {
    let published = published_ts?;
    let delta = found_ts - published;
    if delta < 0 || delta >= 3600 {
        return None;
    }
    if delta < 60 {
        Some(format!("+{}s", delta))
    } else {
        Some(format!("+{}m", delta / 60))
    }
}
