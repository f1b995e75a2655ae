//! Embedded SQLite store
//!
//! One store abstraction with an explicit type map, shared by every component
//! through a cloned connection pool:
//!
//! | logical          | SQLite                       |
//! |------------------|------------------------------|
//! | DECIMAL(10,2)    | TEXT, always two fractionals |
//! | NUMERIC (time)   | INTEGER, unix seconds        |
//! | BOOL             | INTEGER 0/1                  |
//!
//! Connections come from an r2d2 pool in WAL mode, so short-lived reads from
//! worker tasks run concurrently with the ingestion writer. Schema creation
//! and migrations are idempotent and run once at boot.

use crate::config::VERSION;
use crate::item::Item;
use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;

/// A saved search
#[derive(Debug, Clone, Serialize)]
pub struct Query {
    pub id: i64,
    pub url: String,
    pub name: Option<String>,
    /// Watermark: latest upstream publication timestamp observed
    pub last_item_ts: Option<i64>,
    /// Opaque routing key for the notifier (Telegram topic)
    pub thread_id: Option<i64>,
    pub priority: bool,
}

impl Query {
    /// Display label: explicit name, else the search text, else the raw URL
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            if !name.trim().is_empty() {
                return name.clone();
            }
        }
        if let Ok(url) = url::Url::parse(&self.url) {
            if let Some((_, text)) = url.query_pairs().find(|(k, _)| k == "search_text") {
                if !text.is_empty() {
                    return text.into_owned();
                }
            }
        }
        self.url.clone()
    }
}

/// A persisted listing, as served to the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct StoredItem {
    pub id: String,
    pub title: String,
    pub price: String,
    pub currency: String,
    pub published_ts: Option<i64>,
    pub photo_url: Option<String>,
    pub brand_title: String,
    pub size_title: Option<String>,
    pub found_ts: Option<i64>,
    pub query_id: i64,
}

/// Handle to the embedded store; cheap to clone, safe to share across tasks
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Open (or create) the store at `path` and bring the schema up to date
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.busy_timeout(std::time::Duration::from_secs(5))
        });
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .context("Failed to build connection pool")?;

        let store = Self { pool };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store for tests. Pool size 1: each :memory: connection is
    /// its own database, so all access must share the single connection.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.pragma_update(None, "foreign_keys", "ON"));
        let pool = Pool::builder().max_size(1).build(manager)?;
        let store = Self { pool };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().context("Failed to get store connection")
    }

    // ─────────────────────────────────────────────────────────────────────
    // Schema & migrations
    // ─────────────────────────────────────────────────────────────────────

    /// Create the schema and apply idempotent migrations
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queries (
                 id         INTEGER PRIMARY KEY AUTOINCREMENT,
                 url        TEXT NOT NULL UNIQUE,
                 query_name TEXT,
                 last_item  INTEGER,
                 thread_id  INTEGER,
                 priority   INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE IF NOT EXISTS items (
                 item        TEXT PRIMARY KEY,
                 title       TEXT NOT NULL,
                 price       TEXT NOT NULL,
                 currency    TEXT NOT NULL,
                 timestamp   INTEGER,
                 photo_url   TEXT,
                 brand_title TEXT NOT NULL DEFAULT '',
                 size_title  TEXT,
                 found_at    INTEGER,
                 query_id    INTEGER REFERENCES queries(id) ON DELETE CASCADE
             );
             CREATE TABLE IF NOT EXISTS parameters (
                 key   TEXT PRIMARY KEY,
                 value TEXT
             );
             CREATE TABLE IF NOT EXISTS allowlist (
                 country TEXT PRIMARY KEY CHECK (length(country) = 2)
             );",
        )?;

        // Legacy databases predate some columns; add what is missing
        Self::add_column_if_missing(&conn, "queries", "query_name", "TEXT")?;
        Self::add_column_if_missing(&conn, "queries", "thread_id", "INTEGER")?;
        Self::add_column_if_missing(&conn, "queries", "priority", "INTEGER NOT NULL DEFAULT 0")?;
        Self::add_column_if_missing(&conn, "items", "brand_title", "TEXT NOT NULL DEFAULT ''")?;
        Self::add_column_if_missing(&conn, "items", "size_title", "TEXT")?;
        Self::add_column_if_missing(&conn, "items", "found_at", "INTEGER")?;

        // Promote whole-unit integer prices from the oldest schema revision
        // to two-fractional-digit strings. Values already in x.yy form are
        // left untouched, so re-running is a no-op.
        conn.execute(
            "UPDATE items SET price = printf('%d.00', CAST(price AS INTEGER))
             WHERE price NOT LIKE '%.%'",
            [],
        )?;

        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_items_timestamp ON items(timestamp);
             CREATE INDEX IF NOT EXISTS idx_items_query_id  ON items(query_id);
             CREATE INDEX IF NOT EXISTS idx_items_found_at  ON items(found_at);",
        )?;

        // Seed defaults for the runtime-tunable parameters
        for (key, value) in [
            ("query_refresh_delay", "60"),
            ("items_per_query", "20"),
            ("check_proxies", "False"),
            ("proxy_rotation_interval", "5"),
            ("redeploy_threshold_minutes", "4"),
            ("max_http_errors", "5"),
        ] {
            conn.execute(
                "INSERT OR IGNORE INTO parameters (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }
        conn.execute(
            "INSERT OR REPLACE INTO parameters (key, value) VALUES ('version', ?1)",
            params![VERSION],
        )?;

        Ok(())
    }

    fn add_column_if_missing(
        conn: &Connection,
        table: &str,
        column: &str,
        decl: &str,
    ) -> Result<()> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let existing: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<_, _>>()?;
        if !existing.iter().any(|c| c == column) {
            conn.execute(
                &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl),
                [],
            )?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Add a canonicalized query URL. Returns false when it already exists.
    pub fn add_query(
        &self,
        url: &str,
        name: Option<&str>,
        thread_id: Option<i64>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO queries (url, query_name, thread_id) VALUES (?1, ?2, ?3)",
            params![url, name, thread_id],
        )?;
        Ok(changed > 0)
    }

    pub fn is_query_in_store(&self, url: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queries WHERE url = ?1",
            params![url],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_queries(&self) -> Result<Vec<Query>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, url, query_name, last_item, thread_id, priority
             FROM queries ORDER BY id",
        )?;
        let queries = stmt
            .query_map([], Self::row_to_query)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(queries)
    }

    pub fn get_query(&self, id: i64) -> Result<Option<Query>> {
        let conn = self.conn()?;
        let query = conn
            .query_row(
                "SELECT id, url, query_name, last_item, thread_id, priority
                 FROM queries WHERE id = ?1",
                params![id],
                Self::row_to_query,
            )
            .optional()?;
        Ok(query)
    }

    fn row_to_query(row: &rusqlite::Row<'_>) -> rusqlite::Result<Query> {
        Ok(Query {
            id: row.get(0)?,
            url: row.get(1)?,
            name: row.get(2)?,
            last_item_ts: row.get(3)?,
            thread_id: row.get(4)?,
            priority: row.get::<_, i64>(5)? != 0,
        })
    }

    /// Delete a query; its items cascade
    pub fn remove_query(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM queries WHERE id = ?1", params![id])? > 0)
    }

    pub fn remove_all_queries(&self) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM queries", [])?)
    }

    pub fn update_query_thread_id(&self, id: i64, thread_id: Option<i64>) -> Result<bool> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "UPDATE queries SET thread_id = ?2 WHERE id = ?1",
            params![id, thread_id],
        )? > 0)
    }

    /// Admin edit of the mutable query fields
    pub fn edit_query(
        &self,
        id: i64,
        name: Option<&str>,
        thread_id: Option<i64>,
        priority: bool,
    ) -> Result<bool> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "UPDATE queries SET query_name = ?2, thread_id = ?3, priority = ?4 WHERE id = ?1",
            params![id, name, thread_id, priority as i64],
        )? > 0)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Items
    // ─────────────────────────────────────────────────────────────────────

    pub fn is_item_in_store(&self, item_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM items WHERE item = ?1",
            params![item_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Persist an item under the query it was first observed for and advance
    /// the query's watermark, in a single transaction. An error rolls both
    /// writes back; the guard on the UPDATE keeps the watermark monotonically
    /// non-decreasing even when batches arrive out of order.
    ///
    /// Returns false when the unique constraint swallowed a duplicate, which
    /// callers must treat as "do not notify".
    pub fn add_item(&self, item: &Item, query_id: i64, found_ts: i64) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "INSERT OR IGNORE INTO items
             (item, title, price, currency, timestamp, photo_url, brand_title, size_title, found_at, query_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                item.id,
                item.title,
                item.price.to_string(),
                item.currency,
                item.published_ts,
                item.photo_url,
                item.brand_title,
                item.size_title,
                found_ts,
                query_id,
            ],
        )?;
        if changed == 0 {
            // Duplicate: nothing written, leave the watermark alone
            return Ok(false);
        }
        if let Some(published) = item.published_ts {
            tx.execute(
                "UPDATE queries SET last_item = ?2
                 WHERE id = ?1 AND (last_item IS NULL OR last_item < ?2)",
                params![query_id, published],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn items_count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Delete the oldest items until only `floor` remain
    pub fn prune_items_to(&self, floor: u64) -> Result<usize> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        let excess = total - floor as i64;
        if excess <= 0 {
            return Ok(0);
        }
        let deleted = conn.execute(
            "DELETE FROM items WHERE item IN
             (SELECT item FROM items ORDER BY timestamp ASC LIMIT ?1)",
            params![excess],
        )?;
        Ok(deleted)
    }

    pub fn clear_all_items(&self) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM items", [])?)
    }

    /// Recent items for the admin surface, newest discovery first
    pub fn get_items(&self, limit: u32, query_id: Option<i64>) -> Result<Vec<StoredItem>> {
        let conn = self.conn()?;
        let sql = "SELECT item, title, price, currency, timestamp, photo_url, brand_title,
                          size_title, found_at, query_id
                   FROM items
                   WHERE (?1 IS NULL OR query_id = ?1)
                   ORDER BY found_at DESC, timestamp DESC LIMIT ?2";
        let mut stmt = conn.prepare(sql)?;
        let items = stmt
            .query_map(params![query_id, limit], |row| {
                Ok(StoredItem {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    price: row.get(2)?,
                    currency: row.get(3)?,
                    published_ts: row.get(4)?,
                    photo_url: row.get(5)?,
                    brand_title: row.get(6)?,
                    size_title: row.get(7)?,
                    found_ts: row.get(8)?,
                    query_id: row.get(9)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(items)
    }

    /// Items first observed at or after `since_ts`
    pub fn items_found_since(&self, since_ts: i64) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM items WHERE found_at >= ?1",
            params![since_ts],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Allowlist
    // ─────────────────────────────────────────────────────────────────────

    pub fn add_to_allowlist(&self, country: &str) -> Result<bool> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "INSERT OR IGNORE INTO allowlist (country) VALUES (?1)",
            params![country],
        )? > 0)
    }

    pub fn remove_from_allowlist(&self, country: &str) -> Result<bool> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM allowlist WHERE country = ?1", params![country])? > 0)
    }

    /// Allowed seller countries; empty means all are allowed
    pub fn get_allowlist(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT country FROM allowlist ORDER BY country")?;
        let countries = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(countries)
    }

    pub fn clear_allowlist(&self) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM allowlist", [])?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Parameters & counters
    // ─────────────────────────────────────────────────────────────────────

    pub fn get_parameter(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM parameters WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Convenience: parameter parsed as an integer, with a default
    pub fn get_int_parameter(&self, key: &str, default: i64) -> Result<i64> {
        Ok(self
            .get_parameter(key)?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default))
    }

    pub fn set_parameter(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO parameters (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_all_parameters(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT key, COALESCE(value, '') FROM parameters ORDER BY key")?;
        let parameters = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(parameters)
    }

    /// Increment the process-wide catalog request counter
    pub fn increment_api_requests(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO parameters (key, value) VALUES ('vinted_api_requests', '1')
             ON CONFLICT(key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)",
            [],
        )?;
        Ok(())
    }

    pub fn get_api_requests(&self) -> Result<u64> {
        Ok(self.get_int_parameter("vinted_api_requests", 0)? as u64)
    }

    pub fn reset_api_requests(&self) -> Result<()> {
        self.set_parameter("vinted_api_requests", "0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Price;

    fn sample_item(id: &str) -> Item {
        Item {
            id: id.to_string(),
            title: "Boot".to_string(),
            price: Price::from_cents(1250),
            currency: "EUR".to_string(),
            published_ts: Some(1_700_000_000),
            photo_url: Some("p".to_string()),
            brand_title: "Acme".to_string(),
            size_title: None,
            url: format!("https://www.vinted.de/items/{}", id),
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let store = Store::in_memory().unwrap();
        store.migrate().unwrap();
        store.migrate().unwrap();
        assert_eq!(store.get_queries().unwrap().len(), 0);
    }

    #[test]
    fn test_add_query_unique_on_url() {
        let store = Store::in_memory().unwrap();
        let url = "https://www.vinted.de/catalog?search_text=shoes&order=newest_first";
        assert!(store.add_query(url, None, None).unwrap());
        assert!(!store.add_query(url, Some("dup"), None).unwrap());
        assert_eq!(store.get_queries().unwrap().len(), 1);
    }

    #[test]
    fn test_query_label_fallbacks() {
        let store = Store::in_memory().unwrap();
        store
            .add_query(
                "https://www.vinted.de/catalog?search_text=red+shoes&order=newest_first",
                None,
                None,
            )
            .unwrap();
        store
            .add_query(
                "https://www.vinted.de/catalog?brand_ids[]=1&order=newest_first",
                Some("nike stuff"),
                None,
            )
            .unwrap();
        let queries = store.get_queries().unwrap();
        assert_eq!(queries[0].label(), "red shoes");
        assert_eq!(queries[1].label(), "nike stuff");
    }

    #[test]
    fn test_item_dedupe_via_unique_constraint() {
        let store = Store::in_memory().unwrap();
        store.add_query("https://x.test/catalog?order=newest_first", None, None).unwrap();
        let query_id = store.get_queries().unwrap()[0].id;

        assert!(store.add_item(&sample_item("A"), query_id, 1_700_000_100).unwrap());
        assert!(store.is_item_in_store("A").unwrap());
        // Second insert is swallowed by the constraint
        assert!(!store.add_item(&sample_item("A"), query_id, 1_700_000_200).unwrap());
        assert_eq!(store.items_count().unwrap(), 1);
    }

    #[test]
    fn test_add_item_advances_watermark_monotonically() {
        let store = Store::in_memory().unwrap();
        store.add_query("https://x.test/catalog?order=newest_first", None, None).unwrap();
        let id = store.get_queries().unwrap()[0].id;

        let mut item = sample_item("A");
        item.published_ts = Some(100);
        store.add_item(&item, id, 1).unwrap();
        assert_eq!(store.get_query(id).unwrap().unwrap().last_item_ts, Some(100));

        // An older item persists but cannot move the watermark backwards
        let mut older = sample_item("B");
        older.published_ts = Some(50);
        store.add_item(&older, id, 2).unwrap();
        assert_eq!(store.get_query(id).unwrap().unwrap().last_item_ts, Some(100));

        let mut newer = sample_item("C");
        newer.published_ts = Some(200);
        store.add_item(&newer, id, 3).unwrap();
        assert_eq!(store.get_query(id).unwrap().unwrap().last_item_ts, Some(200));
    }

    #[test]
    fn test_duplicate_insert_leaves_watermark_alone() {
        let store = Store::in_memory().unwrap();
        store.add_query("https://x.test/catalog?order=newest_first", None, None).unwrap();
        let id = store.get_queries().unwrap()[0].id;

        let mut item = sample_item("A");
        item.published_ts = Some(100);
        assert!(store.add_item(&item, id, 1).unwrap());

        // Re-observing the same item with a newer publication timestamp is a
        // no-op end to end
        item.published_ts = Some(500);
        assert!(!store.add_item(&item, id, 2).unwrap());
        assert_eq!(store.get_query(id).unwrap().unwrap().last_item_ts, Some(100));
    }

    #[test]
    fn test_remove_query_cascades_to_items() {
        let store = Store::in_memory().unwrap();
        store.add_query("https://x.test/catalog?order=newest_first", None, None).unwrap();
        let id = store.get_queries().unwrap()[0].id;
        store.add_item(&sample_item("A"), id, 1).unwrap();

        assert!(store.remove_query(id).unwrap());
        assert_eq!(store.items_count().unwrap(), 0);
    }

    #[test]
    fn test_prune_items_removes_oldest() {
        let store = Store::in_memory().unwrap();
        store.add_query("https://x.test/catalog?order=newest_first", None, None).unwrap();
        let id = store.get_queries().unwrap()[0].id;

        for i in 0..10 {
            let mut item = sample_item(&format!("I{}", i));
            item.published_ts = Some(1000 + i);
            store.add_item(&item, id, 2000 + i).unwrap();
        }
        let deleted = store.prune_items_to(4).unwrap();
        assert_eq!(deleted, 6);
        assert_eq!(store.items_count().unwrap(), 4);
        // Oldest by publication timestamp are gone
        assert!(!store.is_item_in_store("I0").unwrap());
        assert!(store.is_item_in_store("I9").unwrap());
    }

    #[test]
    fn test_parameters_roundtrip_and_counter() {
        let store = Store::in_memory().unwrap();
        assert_eq!(store.get_int_parameter("query_refresh_delay", 0).unwrap(), 60);

        store.set_parameter("query_refresh_delay", "15").unwrap();
        assert_eq!(store.get_int_parameter("query_refresh_delay", 0).unwrap(), 15);

        store.reset_api_requests().unwrap();
        store.increment_api_requests().unwrap();
        store.increment_api_requests().unwrap();
        assert_eq!(store.get_api_requests().unwrap(), 2);
    }

    #[test]
    fn test_allowlist_crud() {
        let store = Store::in_memory().unwrap();
        assert!(store.add_to_allowlist("DE").unwrap());
        assert!(!store.add_to_allowlist("DE").unwrap());
        assert!(store.add_to_allowlist("FR").unwrap());
        assert_eq!(store.get_allowlist().unwrap(), vec!["DE", "FR"]);
        assert!(store.remove_from_allowlist("DE").unwrap());
        store.clear_allowlist().unwrap();
        assert!(store.get_allowlist().unwrap().is_empty());
    }

    #[test]
    fn test_legacy_integer_prices_are_promoted() {
        let store = Store::in_memory().unwrap();
        store.add_query("https://x.test/catalog?order=newest_first", None, None).unwrap();
        let id = store.get_queries().unwrap()[0].id;
        {
            let conn = store.conn().unwrap();
            conn.execute(
                "INSERT INTO items (item, title, price, currency, query_id)
                 VALUES ('L', 'Legacy', '12', 'EUR', ?1)",
                params![id],
            )
            .unwrap();
        }
        store.migrate().unwrap();
        let items = store.get_items(10, None).unwrap();
        assert_eq!(items[0].price, "12.00");
    }
}
