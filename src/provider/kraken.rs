// =============================================================================
// Kraken REST API Client — public market-data endpoints
// =============================================================================
//
// The scan core only reads public data (Depth, OHLC); there are no
// signed endpoints. Every call reports its outcome as a `FetchError` variant
// so the provider guard can apply its retry and breaker policies uniformly.
//
// Kraken wraps every response as {"error": [...], "result": {...}} and keys
// the result by an internal pair name (e.g. "XXBTZUSD" for BTCUSD), so the
// parsers take the first entry of the result object.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::data::{BookTop, Ohlc};
use crate::provider::guard::FetchError;

/// Map a canonical `XXXUSD` symbol to Kraken's pair naming (BTC is XBT).
pub fn to_kraken_pair(symbol: &str) -> String {
    match symbol.strip_suffix("USD") {
        Some("BTC") => "XBTUSD".to_string(),
        _ => symbol.to_string(),
    }
}

/// Kraken public REST client.
#[derive(Clone)]
pub struct KrakenClient {
    base_url: String,
    client: reqwest::Client,
}

impl KrakenClient {
    /// Create a client with the given per-request timeout.
    pub fn new(timeout_seconds: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .expect("failed to build reqwest client");

        debug!("KrakenClient initialised (base_url=https://api.kraken.com)");

        Self {
            base_url: "https://api.kraken.com".to_string(),
            client,
        }
    }

    /// Override the base URL (tests point this at a local stub).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    // -------------------------------------------------------------------------
    // Raw fetches (guard-compatible error surface)
    // -------------------------------------------------------------------------

    /// GET a public endpoint and unwrap Kraken's error/result envelope.
    async fn get_public(&self, path: &str, query: &str) -> Result<serde_json::Value, FetchError> {
        let url = format!("{}/0/public/{path}?{query}", self.base_url);

        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Network(format!("body read failed: {e}")))?;

        if !status.is_success() {
            return Err(FetchError::Status {
                code: status.as_u16(),
                body: truncate(&body.to_string(), 200),
            });
        }

        // Kraken reports application errors with HTTP 200.
        if let Some(errors) = body["error"].as_array() {
            if !errors.is_empty() {
                let joined = errors
                    .iter()
                    .filter_map(|e| e.as_str())
                    .collect::<Vec<_>>()
                    .join("; ");
                let code = if joined.contains("Rate limit") { 429 } else { 502 };
                return Err(FetchError::Status {
                    code,
                    body: truncate(&joined, 200),
                });
            }
        }

        Ok(body["result"].clone())
    }

    /// GET /0/public/Depth (order book, top `count` levels per side).
    pub async fn depth(&self, symbol: &str, count: u32) -> Result<serde_json::Value, FetchError> {
        let pair = to_kraken_pair(symbol);
        self.get_public("Depth", &format!("pair={pair}&count={count}"))
            .await
    }

    /// GET /0/public/OHLC with the interval in minutes.
    pub async fn ohlc(
        &self,
        symbol: &str,
        interval_minutes: u32,
    ) -> Result<serde_json::Value, FetchError> {
        let pair = to_kraken_pair(symbol);
        self.get_public("OHLC", &format!("pair={pair}&interval={interval_minutes}"))
            .await
    }
}

impl std::fmt::Debug for KrakenClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KrakenClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}…", &s[..max])
    }
}

// =============================================================================
// Response parsers
// =============================================================================

/// First entry of a Kraken result object (results are keyed by the internal
/// pair name, which differs from the requested one).
fn first_pair_entry(result: &serde_json::Value) -> Result<&serde_json::Value> {
    result
        .as_object()
        .and_then(|obj| obj.iter().find(|(k, _)| *k != "last"))
        .map(|(_, v)| v)
        .context("result object has no pair entry")
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

/// Parse a Depth result into a `BookTop`, aggregating USD depth within 2%
/// of mid on each side.
pub fn parse_book_top(result: &serde_json::Value, retrieved_at: DateTime<Utc>) -> Result<BookTop> {
    let entry = first_pair_entry(result)?;

    let bids = entry["bids"].as_array().context("missing field bids")?;
    let asks = entry["asks"].as_array().context("missing field asks")?;

    let level = |l: &serde_json::Value| -> Result<(f64, f64)> {
        let arr = l.as_array().context("depth level is not an array")?;
        let price = parse_str_f64(arr.first().context("depth level missing price")?)?;
        let volume = parse_str_f64(arr.get(1).context("depth level missing volume")?)?;
        Ok((price, volume))
    };

    let (best_bid, _) = bids.first().map(&level).transpose()?.unwrap_or((0.0, 0.0));
    let (best_ask, _) = asks.first().map(&level).transpose()?.unwrap_or((0.0, 0.0));

    let mid = (best_bid + best_ask) / 2.0;
    let bid_floor = mid * 0.98;
    let ask_ceiling = mid * 1.02;

    let mut bid_depth_usd = 0.0;
    for l in bids {
        let (price, volume) = level(l)?;
        if price >= bid_floor {
            bid_depth_usd += price * volume;
        }
    }

    let mut ask_depth_usd = 0.0;
    for l in asks {
        let (price, volume) = level(l)?;
        if price <= ask_ceiling {
            ask_depth_usd += price * volume;
        }
    }

    Ok(BookTop {
        best_bid,
        best_ask,
        bid_depth_usd,
        ask_depth_usd,
        last_update: retrieved_at,
    })
}

/// Parse an OHLC result into bars, oldest first.
///
/// Array indices: [0] time (unix s), [1] open, [2] high, [3] low, [4] close,
/// [5] vwap, [6] volume, [7] count.
pub fn parse_ohlc_bars(result: &serde_json::Value) -> Result<Vec<Ohlc>> {
    let entry = first_pair_entry(result)?;
    let rows = entry.as_array().context("OHLC entry is not an array")?;

    let mut bars = Vec::with_capacity(rows.len());
    for row in rows {
        let arr = row.as_array().context("OHLC row is not an array")?;
        if arr.len() < 7 {
            continue;
        }
        let ts = arr[0].as_i64().context("OHLC row missing timestamp")?;
        let timestamp = Utc
            .timestamp_opt(ts, 0)
            .single()
            .context("OHLC timestamp out of range")?;

        bars.push(Ohlc {
            timestamp,
            open: parse_str_f64(&arr[1])?,
            high: parse_str_f64(&arr[2])?,
            low: parse_str_f64(&arr[3])?,
            close: parse_str_f64(&arr[4])?,
            volume: parse_str_f64(&arr[6])?,
        });
    }

    bars.sort_by_key(|b| b.timestamp);
    Ok(bars)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kraken_pair_mapping() {
        assert_eq!(to_kraken_pair("BTCUSD"), "XBTUSD");
        assert_eq!(to_kraken_pair("ETHUSD"), "ETHUSD");
        assert_eq!(to_kraken_pair("SOLUSD"), "SOLUSD");
    }

    #[test]
    fn parse_depth_aggregates_within_two_percent() {
        let result = serde_json::json!({
            "XXBTZUSD": {
                "bids": [
                    ["100.0", "1.0", 1700000000],
                    ["99.0", "2.0", 1700000000],
                    ["90.0", "50.0", 1700000000]   // outside 2% of mid
                ],
                "asks": [
                    ["101.0", "1.0", 1700000000],
                    ["102.0", "2.0", 1700000000],
                    ["120.0", "50.0", 1700000000]  // outside 2% of mid
                ]
            }
        });

        let book = parse_book_top(&result, Utc::now()).unwrap();
        assert!((book.best_bid - 100.0).abs() < f64::EPSILON);
        assert!((book.best_ask - 101.0).abs() < f64::EPSILON);
        // mid = 100.5; floor 98.49, ceiling 102.51.
        assert!((book.bid_depth_usd - (100.0 + 198.0)).abs() < 1e-9);
        assert!((book.ask_depth_usd - (101.0 + 204.0)).abs() < 1e-9);
    }

    #[test]
    fn parse_ohlc_sorts_oldest_first() {
        let result = serde_json::json!({
            "XXBTZUSD": [
                [1700003600, "101.0", "102.0", "100.0", "101.5", "101.2", "10.0", 42],
                [1700000000, "100.0", "101.0", "99.0", "100.5", "100.2", "12.0", 40]
            ],
            "last": 1700003600
        });

        let bars = parse_ohlc_bars(&result).unwrap();
        assert_eq!(bars.len(), 2);
        assert!(bars[0].timestamp < bars[1].timestamp);
        assert!((bars[0].close - 100.5).abs() < f64::EPSILON);
        assert!((bars[1].volume - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_ohlc_skips_last_marker() {
        let result = serde_json::json!({
            "last": 1700003600,
            "XETHZUSD": [
                [1700000000, "100.0", "101.0", "99.0", "100.5", "100.2", "12.0", 40]
            ]
        });
        let bars = parse_ohlc_bars(&result).unwrap();
        assert_eq!(bars.len(), 1);
    }

}
