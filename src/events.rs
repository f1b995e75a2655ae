// Messages that flow between the scraping fleet, the ingestion pipeline,
// and the notifier.
//
// Workers publish raw item batches; the ingestion consumer turns unseen items
// into notifications. Using owned structs on the channels keeps the tasks
// shared-nothing.

use crate::item::Item;
use serde::{Deserialize, Serialize};

/// One worker scan's worth of items, tagged with the owning query
#[derive(Debug, Clone)]
pub struct ItemBatch {
    pub items: Vec<Item>,
    pub query_id: i64,
}

/// A formatted message waiting for the Telegram sender
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// HTML message body (or photo caption)
    pub text: String,
    /// Link behind the inline button
    pub link_url: String,
    /// Inline button label
    pub button_text: String,
    /// Telegram topic to route to, when the query has one
    pub thread_id: Option<i64>,
    /// When present, sent as a photo with `text` as caption
    pub photo_url: Option<String>,
}
