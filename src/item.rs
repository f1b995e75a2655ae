// Marketplace item model
//
// Items arrive as JSON objects inside the catalog API's `items` array. Only
// the fields the pipeline needs are extracted; everything else is dropped at
// the parse boundary so the rest of the system works with a small, owned type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Base host used to build an item link when the API object carries none
const ITEM_LINK_HOST: &str = "www.vinted.de";

/// A price with two fractional digits, stored as cents.
///
/// The catalog API serves amounts as decimal strings ("12.50"); storing cents
/// keeps comparisons exact and formatting trivial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Price(i64);

impl Price {
    pub fn from_cents(cents: i64) -> Self {
        Price(cents)
    }

    /// Parse a decimal string ("12.50", "12.5", "12") into a price.
    ///
    /// Fractional digits beyond the second are truncated, matching the
    /// store's DECIMAL(10,2) column.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        let negative = int_part.starts_with('-');
        let int: i64 = int_part.parse().ok()?;
        let frac_digits: String = frac_part.chars().take(2).collect();
        if !frac_digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let mut frac: i64 = if frac_digits.is_empty() {
            0
        } else {
            frac_digits.parse().ok()?
        };
        if frac_digits.len() == 1 {
            frac *= 10;
        }
        let cents = int.abs() * 100 + frac;
        Some(Price(if negative { -cents } else { cents }))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

/// A discovered marketplace listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Upstream-assigned id, globally unique across the marketplace
    pub id: String,
    pub title: String,
    pub price: Price,
    /// ISO 4217 code ("EUR")
    pub currency: String,
    /// Upstream publication time (unix seconds), when the API provides one
    pub published_ts: Option<i64>,
    pub photo_url: Option<String>,
    pub brand_title: String,
    pub size_title: Option<String>,
    /// Link to the listing page
    pub url: String,
}

impl Item {
    /// Extract an item from a catalog API JSON object.
    ///
    /// Returns None when the object is missing its identity or price; such
    /// entries are logged and skipped rather than failing the whole batch.
    pub fn from_json(obj: &serde_json::Value) -> Option<Self> {
        let id = match obj.get("id") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return None,
        };

        let title = obj.get("title").and_then(|v| v.as_str()).unwrap_or("").to_string();

        let price_obj = obj.get("price")?;
        let amount = price_obj.get("amount").and_then(|v| v.as_str())?;
        let price = Price::parse(amount)?;
        let currency = price_obj
            .get("currency_code")
            .and_then(|v| v.as_str())
            .unwrap_or("EUR")
            .to_string();

        // Publication time: `created_at_ts` on newer payloads, `raw_timestamp`
        // on older ones, photo timestamp as the final fallback
        let published_ts = obj
            .get("created_at_ts")
            .and_then(|v| v.as_i64())
            .or_else(|| obj.get("raw_timestamp").and_then(|v| v.as_i64()))
            .or_else(|| {
                obj.get("photo")?
                    .get("high_resolution")?
                    .get("timestamp")
                    .and_then(|v| v.as_i64())
            });

        let photo_url = obj
            .get("photo")
            .and_then(|p| p.get("url"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let brand_title = obj
            .get("brand_title")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let size_title = obj
            .get("size_title")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.to_string());

        let url = obj
            .get("url")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("https://{}/items/{}", ITEM_LINK_HOST, id));

        Some(Self {
            id,
            title,
            price,
            currency,
            published_ts,
            photo_url,
            brand_title,
            size_title,
            url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_price_parse_two_digits() {
        assert_eq!(Price::parse("12.50"), Some(Price::from_cents(1250)));
        assert_eq!(Price::parse("0.99"), Some(Price::from_cents(99)));
    }

    #[test]
    fn test_price_parse_short_forms() {
        assert_eq!(Price::parse("12"), Some(Price::from_cents(1200)));
        assert_eq!(Price::parse("12.5"), Some(Price::from_cents(1250)));
    }

    #[test]
    fn test_price_parse_truncates_extra_digits() {
        assert_eq!(Price::parse("12.509"), Some(Price::from_cents(1250)));
    }

    #[test]
    fn test_price_parse_rejects_garbage() {
        assert_eq!(Price::parse("free"), None);
        assert_eq!(Price::parse("12.x"), None);
    }

    #[test]
    fn test_price_display() {
        assert_eq!(Price::from_cents(1250).to_string(), "12.50");
        assert_eq!(Price::from_cents(5).to_string(), "0.05");
        assert_eq!(Price::from_cents(100000).to_string(), "1000.00");
    }

    #[test]
    fn test_item_from_full_json() {
        let obj = json!({
            "id": "A",
            "title": "Boot",
            "price": {"amount": "12.50", "currency_code": "EUR"},
            "created_at_ts": 1_700_000_000,
            "photo": {"url": "p"},
            "brand_title": "Acme",
            "size_title": "42"
        });
        let item = Item::from_json(&obj).unwrap();
        assert_eq!(item.id, "A");
        assert_eq!(item.title, "Boot");
        assert_eq!(item.price.to_string(), "12.50");
        assert_eq!(item.currency, "EUR");
        assert_eq!(item.published_ts, Some(1_700_000_000));
        assert_eq!(item.photo_url.as_deref(), Some("p"));
        assert_eq!(item.brand_title, "Acme");
        assert_eq!(item.size_title.as_deref(), Some("42"));
        assert_eq!(item.url, "https://www.vinted.de/items/A");
    }

    #[test]
    fn test_item_numeric_id_and_photo_timestamp_fallback() {
        let obj = json!({
            "id": 123456,
            "title": "Jacket",
            "price": {"amount": "30.00", "currency_code": "PLN"},
            "photo": {"url": "p", "high_resolution": {"timestamp": 1_700_000_123}}
        });
        let item = Item::from_json(&obj).unwrap();
        assert_eq!(item.id, "123456");
        assert_eq!(item.published_ts, Some(1_700_000_123));
        assert_eq!(item.url, "https://www.vinted.de/items/123456");
    }

    #[test]
    fn test_item_blank_size_becomes_none() {
        let obj = json!({
            "id": "B",
            "title": "Shirt",
            "price": {"amount": "5.00", "currency_code": "EUR"},
            "size_title": "  "
        });
        let item = Item::from_json(&obj).unwrap();
        assert!(item.size_title.is_none());
        assert!(item.photo_url.is_none());
        assert!(item.published_ts.is_none());
    }

    #[test]
    fn test_item_missing_price_is_skipped() {
        let obj = json!({"id": "C", "title": "No price"});
        assert!(Item::from_json(&obj).is_none());
    }

    #[test]
    fn test_repeated_parse_is_identical() {
        let obj = json!({
            "id": "A",
            "title": "Boot",
            "price": {"amount": "12.50", "currency_code": "EUR"},
            "created_at_ts": 1_700_000_000
        });
        let a = Item::from_json(&obj).unwrap();
        let b = Item::from_json(&obj).unwrap();
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
    }
}
