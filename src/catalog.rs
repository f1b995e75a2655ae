//! Catalog client - saved-search URLs in, classified outcomes out
//!
//! A saved search is stored as the canonical form of the URL the user pasted
//! from the marketplace. Scanning translates that URL into a catalog API call
//! executed over the worker's session (whose client already carries the
//! proxy; the bearer and locale headers are attached here) and classifies the
//! result into one sum type so callers never inspect raw responses.

use crate::config::Tunables;
use crate::item::Item;
use crate::store::Store;
use crate::token_pool::{bearer_header, SessionHandle};
use anyhow::{Context, Result};
use async_trait::async_trait;
use url::Url;

/// Catalog API path, appended to the locale host from the query URL
const CATALOG_ENDPOINT: &str = "/api/v2/catalog/items";

/// Query-string keys stripped during canonicalization
const DROPPED_KEYS: &[&str] = &["time", "search_id", "disabled_personalization", "page"];

/// Array-valued search filters: URL key -> API field
const ARRAY_FILTERS: &[(&str, &str)] = &[
    ("catalog[]", "catalog_ids"),
    ("color_ids[]", "color_ids"),
    ("brand_ids[]", "brand_ids"),
    ("size_ids[]", "size_ids"),
    ("material_ids[]", "material_ids"),
    ("status_ids[]", "status_ids"),
    ("country_ids[]", "country_ids"),
    ("city_ids[]", "city_ids"),
    ("video_game_platform_ids[]", "video_game_platform_ids"),
];

/// Classified result of one catalog call
#[derive(Debug)]
pub enum Outcome {
    /// HTTP 200 with a parseable `items` array
    Items(Vec<Item>),
    /// Any non-2xx status; 401/403/429 drive rotation and the governor
    HttpError { status: u16, body: String },
    /// Timeout, DNS, TLS, or an unparseable success body
    Transport(String),
}

/// Seam between workers and the real HTTP client, so the worker loop can be
/// exercised against scripted outcomes
#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn search(&self, session: &SessionHandle, query_url: &str, per_page: u32) -> Outcome;
}

/// Production catalog client
pub struct CatalogClient {
    store: Store,
    tunables: Tunables,
}

impl CatalogClient {
    pub fn new(store: Store, tunables: Tunables) -> Self {
        Self { store, tunables }
    }
}

#[async_trait]
impl CatalogApi for CatalogClient {
    async fn search(&self, session: &SessionHandle, query_url: &str, per_page: u32) -> Outcome {
        let locale = match Url::parse(query_url).ok().and_then(|u| u.host_str().map(String::from)) {
            Some(host) => host,
            None => return Outcome::Transport(format!("unparseable query URL: {}", query_url)),
        };

        let params = match build_api_params(query_url, per_page, 1) {
            Ok(params) => params,
            Err(e) => return Outcome::Transport(e.to_string()),
        };

        let api_url = format!("https://{}{}", locale, CATALOG_ENDPOINT);
        let mut request = session
            .client
            .get(&api_url)
            .query(&params)
            .timeout(self.tunables.catalog_timeout)
            .header("Host", locale.as_str())
            .header("Referer", format!("https://{}/", locale))
            .header("Origin", format!("https://{}", locale));
        if let Some((name, value)) = bearer_header(&session.bearer_token) {
            request = request.header(name, value);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Outcome::Transport(e.to_string()),
        };

        // Process-wide dispatch counter, reset by the orchestrator at boot
        if let Err(e) = self.store.increment_api_requests() {
            tracing::debug!("API counter increment failed: {}", e);
        }

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Outcome::HttpError { status, body };
        }

        match response.json::<serde_json::Value>().await {
            Ok(payload) => match parse_items_payload(&payload) {
                Some(items) => Outcome::Items(items),
                None => Outcome::Transport("success body without items array".to_string()),
            },
            Err(e) => Outcome::Transport(format!("invalid JSON body: {}", e)),
        }
    }
}

/// Extract the `items` array from a catalog response body.
///
/// Objects missing their identity or price are skipped with a warning;
/// everything else becomes an [`Item`].
pub fn parse_items_payload(payload: &serde_json::Value) -> Option<Vec<Item>> {
    let raw = payload.get("items")?.as_array()?;
    let items = raw
        .iter()
        .filter_map(|obj| {
            let item = Item::from_json(obj);
            if item.is_none() {
                tracing::warn!("Skipping malformed catalog item: {}", obj);
            }
            item
        })
        .collect();
    Some(items)
}

/// Canonicalize a saved-search URL: force `order=newest_first`, strip the
/// volatile keys, rebuild the query string.
///
/// Canonicalization is idempotent, which makes the canonical form usable as
/// the query's unique identity in the store.
pub fn canonicalize_url(url: &str) -> Result<String> {
    let mut parsed = Url::parse(url).with_context(|| format!("Invalid query URL: {}", url))?;

    let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
    let mut kept: Vec<(String, String)> = Vec::with_capacity(pairs.len() + 1);
    let mut saw_order = false;
    for (key, value) in pairs {
        if DROPPED_KEYS.contains(&key.as_str()) {
            continue;
        }
        if key == "order" {
            // Replace in place; duplicates collapse to the first occurrence
            if !saw_order {
                kept.push(("order".to_string(), "newest_first".to_string()));
                saw_order = true;
            }
            continue;
        }
        kept.push((key, value));
    }
    if !saw_order {
        kept.push(("order".to_string(), "newest_first".to_string()));
    }

    parsed
        .query_pairs_mut()
        .clear()
        .extend_pairs(kept.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    Ok(parsed.to_string())
}

/// Map a search URL's query string onto the catalog API's field names.
///
/// Every field is emitted, empty or not, matching the upstream wire format.
pub fn build_api_params(url: &str, per_page: u32, page: u32) -> Result<Vec<(String, String)>> {
    let parsed = Url::parse(url).with_context(|| format!("Invalid query URL: {}", url))?;
    let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();

    let collect = |key: &str, sep: &str| -> String {
        pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join(sep)
    };

    let mut params: Vec<(String, String)> = Vec::new();
    params.push(("search_text".to_string(), collect("search_text", "+")));
    for (url_key, api_field) in ARRAY_FILTERS {
        params.push((api_field.to_string(), collect(url_key, ",")));
    }
    let is_for_swap = if pairs.iter().any(|(k, _)| k == "disposal[]") {
        "1"
    } else {
        ""
    };
    params.push(("is_for_swap".to_string(), is_for_swap.to_string()));
    params.push(("currency".to_string(), collect("currency", ",")));
    params.push(("price_to".to_string(), collect("price_to", ",")));
    params.push(("price_from".to_string(), collect("price_from", ",")));
    params.push(("page".to_string(), page.to_string()));
    params.push(("per_page".to_string(), per_page.to_string()));
    params.push(("order".to_string(), collect("order", ",")));

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn param<'a>(params: &'a [(String, String)], key: &str) -> &'a str {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .unwrap()
    }

    #[test]
    fn test_canonicalize_forces_newest_first() {
        let url = "https://www.vinted.de/catalog?search_text=shoes&order=relevance";
        let canonical = canonicalize_url(url).unwrap();
        assert!(canonical.contains("order=newest_first"));
        assert!(!canonical.contains("relevance"));
    }

    #[test]
    fn test_canonicalize_strips_volatile_keys() {
        let url = "https://www.vinted.de/catalog?search_text=shoes&time=123&search_id=9\
                   &disabled_personalization=true&page=4";
        let canonical = canonicalize_url(url).unwrap();
        assert!(!canonical.contains("time="));
        assert!(!canonical.contains("search_id="));
        assert!(!canonical.contains("disabled_personalization="));
        assert!(!canonical.contains("page="));
        assert!(canonical.contains("search_text=shoes"));
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        let urls = [
            "https://www.vinted.de/catalog?search_text=red+shoes&time=1&order=relevance",
            "https://www.vinted.fr/catalog?catalog[]=5&catalog[]=6&page=2",
            "https://www.vinted.de/catalog",
        ];
        for url in urls {
            let once = canonicalize_url(url).unwrap();
            let twice = canonicalize_url(&once).unwrap();
            assert_eq!(once, twice, "not idempotent for {}", url);
        }
    }

    #[test]
    fn test_api_params_array_mapping() {
        let url = "https://www.vinted.de/catalog?catalog[]=5&catalog[]=6&brand_ids[]=10\
                   &color_ids[]=1&order=newest_first";
        let params = build_api_params(url, 20, 1).unwrap();
        assert_eq!(param(&params, "catalog_ids"), "5,6");
        assert_eq!(param(&params, "brand_ids"), "10");
        assert_eq!(param(&params, "color_ids"), "1");
        assert_eq!(param(&params, "size_ids"), "");
        assert_eq!(param(&params, "order"), "newest_first");
        assert_eq!(param(&params, "page"), "1");
        assert_eq!(param(&params, "per_page"), "20");
    }

    #[test]
    fn test_api_params_search_text_joined_with_plus() {
        let url = "https://www.vinted.de/catalog?search_text=red%20shoes&search_text=leather";
        let params = build_api_params(url, 20, 1).unwrap();
        assert_eq!(param(&params, "search_text"), "red shoes+leather");
    }

    #[test]
    fn test_api_params_disposal_becomes_swap_flag() {
        let url = "https://www.vinted.de/catalog?disposal[]=1";
        let params = build_api_params(url, 20, 1).unwrap();
        assert_eq!(param(&params, "is_for_swap"), "1");

        let none = build_api_params("https://www.vinted.de/catalog", 20, 1).unwrap();
        assert_eq!(param(&none, "is_for_swap"), "");
    }

    #[test]
    fn test_api_params_scalars() {
        let url = "https://www.vinted.de/catalog?price_from=5&price_to=50&currency=EUR";
        let params = build_api_params(url, 10, 3).unwrap();
        assert_eq!(param(&params, "price_from"), "5");
        assert_eq!(param(&params, "price_to"), "50");
        assert_eq!(param(&params, "currency"), "EUR");
        assert_eq!(param(&params, "page"), "3");
    }

    #[test]
    fn test_parse_items_payload() {
        let payload = json!({
            "items": [
                {
                    "id": "A",
                    "title": "Boot",
                    "price": {"amount": "12.50", "currency_code": "EUR"},
                    "created_at_ts": 1_700_000_000,
                    "photo": {"url": "p"},
                    "brand_title": "Acme"
                },
                {"id": "broken"}
            ]
        });
        let items = parse_items_payload(&payload).unwrap();
        // The malformed entry is skipped, not fatal
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "A");
        assert_eq!(items[0].url, "https://www.vinted.de/items/A");
    }

    #[test]
    fn test_parse_items_payload_requires_items_array() {
        assert!(parse_items_payload(&json!({"error": "x"})).is_none());
        assert!(parse_items_payload(&json!({"items": {}})).is_none());
    }

    #[test]
    fn test_parse_is_deterministic() {
        let payload = json!({"items": [{
            "id": "A", "title": "Boot",
            "price": {"amount": "12.50", "currency_code": "EUR"}
        }]});
        let a = parse_items_payload(&payload).unwrap();
        let b = parse_items_payload(&payload).unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!(a[0].id, b[0].id);
        assert_eq!(a[0].price, b[0].price);
    }
}
