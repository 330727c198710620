// =============================================================================
// Hot Tier — live WebSocket tick cache per venue
// =============================================================================
//
// One hot tier instance per venue. A background task owns the WebSocket
// connection (Kraken v2 ticker channel) and feeds the tick cache; readers
// never touch the socket. `is_available` requires a live connection AND at
// least one tick for the requested symbol inside the stale threshold —
// anything older fails `STALE_WS` so the facade can fall through to warm.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::data::{BookTop, Envelope, Ohlc, Payload, Tier};
use crate::error::{ErrorKind, ScanError};

/// Canonical `BTCUSD` -> WS channel symbol `BTC/USD`.
pub fn ws_symbol(symbol: &str) -> String {
    match symbol.strip_suffix("USD") {
        Some(base) if !base.is_empty() => format!("{base}/USD"),
        _ => symbol.to_string(),
    }
}

/// WS channel symbol `BTC/USD` -> canonical `BTCUSD`.
pub fn from_ws_symbol(symbol: &str) -> String {
    symbol.replace('/', "")
}

/// One cached ticker update.
#[derive(Debug, Clone)]
pub struct HotTick {
    pub last: f64,
    pub open_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub volume_24h_usd: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_qty: f64,
    pub ask_qty: f64,
    pub timestamp: DateTime<Utc>,
}

/// Live tick cache for one venue.
pub struct HotTier {
    venue: String,
    stale_threshold_ms: i64,
    connected: AtomicBool,
    ticks: RwLock<HashMap<String, HotTick>>,
}

impl HotTier {
    pub fn new(venue: impl Into<String>, stale_threshold_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            venue: venue.into(),
            stale_threshold_ms,
            connected: AtomicBool::new(false),
            ticks: RwLock::new(HashMap::new()),
        })
    }

    /// Connected AND at least one tick for `symbol` inside the stale window.
    pub fn is_available(&self, symbol: &str) -> bool {
        if !self.connected.load(Ordering::Relaxed) {
            return false;
        }
        let ticks = self.ticks.read();
        match ticks.get(symbol) {
            Some(tick) => self.tick_fresh(tick),
            None => false,
        }
    }

    fn tick_fresh(&self, tick: &HotTick) -> bool {
        (Utc::now() - tick.timestamp) <= Duration::milliseconds(self.stale_threshold_ms)
    }

    /// Most recent cached order-book top for `symbol`. Fails `STALE_WS`
    /// past the stale threshold.
    pub fn get_order_book(&self, symbol: &str) -> Result<Envelope, ScanError> {
        let tick = self.lookup_fresh(symbol)?;

        let book = BookTop {
            best_bid: tick.best_bid,
            best_ask: tick.best_ask,
            bid_depth_usd: tick.best_bid * tick.bid_qty,
            ask_depth_usd: tick.best_ask * tick.ask_qty,
            last_update: tick.timestamp,
        };

        Ok(Envelope::new(
            symbol,
            &self.venue,
            tick.timestamp,
            Tier::Hot,
            Payload::OrderBook(book),
            format!("{}_ws", self.venue.to_lowercase()),
            false,
        ))
    }

    /// Most recent cached price tick for `symbol`, shaped as a 24h bar.
    pub fn get_price(&self, symbol: &str) -> Result<Envelope, ScanError> {
        let tick = self.lookup_fresh(symbol)?;

        let bar = Ohlc {
            timestamp: tick.timestamp,
            open: tick.open_24h,
            high: tick.high_24h,
            low: tick.low_24h,
            close: tick.last,
            volume: if tick.last > 0.0 {
                tick.volume_24h_usd / tick.last
            } else {
                0.0
            },
        };

        Ok(Envelope::new(
            symbol,
            &self.venue,
            tick.timestamp,
            Tier::Hot,
            Payload::Price {
                bar,
                volume_24h_usd: tick.volume_24h_usd,
            },
            format!("{}_ws", self.venue.to_lowercase()),
            false,
        ))
    }

    fn lookup_fresh(&self, symbol: &str) -> Result<HotTick, ScanError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(ScanError::new(
                ErrorKind::Transient,
                format!("hot tier for {} is not connected", self.venue),
            )
            .with_offender(symbol.to_string()));
        }

        let ticks = self.ticks.read();
        let tick = ticks.get(symbol).ok_or_else(|| {
            ScanError::new(
                ErrorKind::Transient,
                format!("no hot tick cached for {symbol}"),
            )
            .with_offender(symbol.to_string())
        })?;

        if !self.tick_fresh(tick) {
            return Err(ScanError::new(
                ErrorKind::DataQuality,
                format!(
                    "STALE_WS: tick for {symbol} is {}ms old (threshold {}ms)",
                    (Utc::now() - tick.timestamp).num_milliseconds(),
                    self.stale_threshold_ms
                ),
            )
            .with_offender(symbol.to_string()));
        }

        Ok(tick.clone())
    }

    /// Insert or replace the cached tick for `symbol`. Called by the stream
    /// task and by tests.
    pub fn record_tick(&self, symbol: impl Into<String>, tick: HotTick) {
        self.ticks.write().insert(symbol.into(), tick);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Symbols with a cached tick, fresh or not.
    pub fn cached_symbols(&self) -> Vec<String> {
        self.ticks.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for HotTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotTier")
            .field("venue", &self.venue)
            .field("connected", &self.is_connected())
            .field("cached", &self.ticks.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Ticker WebSocket stream
// ---------------------------------------------------------------------------

const KRAKEN_WS_URL: &str = "wss://ws.kraken.com/v2";

/// Connect to the Kraken v2 ticker stream for `symbols` and feed ticks into
/// `tier`. Runs until the stream disconnects or errors, then returns so the
/// caller can handle reconnection.
pub async fn run_ticker_stream(symbols: &[String], tier: &Arc<HotTier>) -> Result<()> {
    let url = std::env::var("CRYPTORUN_WS_URL").unwrap_or_else(|_| KRAKEN_WS_URL.to_string());
    info!(url = %url, count = symbols.len(), "connecting to ticker WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to ticker WebSocket")?;

    let (mut write, mut read) = ws_stream.split();

    let subscribe = serde_json::json!({
        "method": "subscribe",
        "params": {
            "channel": "ticker",
            "symbol": symbols.iter().map(|s| ws_symbol(s)).collect::<Vec<_>>(),
        }
    });
    write
        .send(tokio_tungstenite::tungstenite::Message::Text(
            subscribe.to_string(),
        ))
        .await
        .context("failed to send ticker subscription")?;

    tier.set_connected(true);
    info!(count = symbols.len(), "ticker WebSocket connected and subscribed");

    let result = loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_ticker_message(&text) {
                        Ok(Some((symbol, tick))) => {
                            debug!(symbol = %symbol, last = tick.last, "hot tick");
                            tier.record_tick(symbol, tick);
                        }
                        Ok(None) => {} // heartbeat / subscription ack
                        Err(e) => {
                            warn!(error = %e, "failed to parse ticker message");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(error = %e, "ticker WebSocket read error");
                break Err(e.into());
            }
            None => {
                warn!("ticker WebSocket stream ended");
                break Ok(());
            }
        }
    };

    tier.set_connected(false);
    result
}

/// Parse a Kraken v2 ticker update. Returns `Ok(None)` for heartbeats,
/// acks, and other non-ticker frames.
///
/// Expected shape:
/// ```json
/// { "channel": "ticker", "type": "update",
///   "data": [{ "symbol": "BTC/USD", "last": 37000.5, "bid": 37000.0, ... }] }
/// ```
fn parse_ticker_message(text: &str) -> Result<Option<(String, HotTick)>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse ticker JSON")?;

    if root["channel"].as_str() != Some("ticker") {
        return Ok(None);
    }

    let data = root["data"]
        .as_array()
        .and_then(|arr| arr.first())
        .context("ticker frame missing data[0]")?;

    let ws_sym = data["symbol"].as_str().context("missing field symbol")?;
    let symbol = from_ws_symbol(ws_sym);

    let f = |name: &str| data[name].as_f64().unwrap_or(0.0);

    let last = f("last");
    let vwap = if f("vwap") > 0.0 { f("vwap") } else { last };

    let tick = HotTick {
        last,
        open_24h: last - f("change"),
        high_24h: f("high"),
        low_24h: f("low"),
        volume_24h_usd: f("volume") * vwap,
        best_bid: f("bid"),
        best_ask: f("ask"),
        bid_qty: f("bid_qty"),
        ask_qty: f("ask_qty"),
        timestamp: Utc::now(),
    };

    Ok(Some((symbol, tick)))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tick(age_ms: i64) -> HotTick {
        HotTick {
            last: 100.0,
            open_24h: 98.0,
            high_24h: 103.0,
            low_24h: 97.0,
            volume_24h_usd: 5_000_000.0,
            best_bid: 99.9,
            best_ask: 100.1,
            bid_qty: 2.0,
            ask_qty: 3.0,
            timestamp: Utc::now() - Duration::milliseconds(age_ms),
        }
    }

    #[test]
    fn ws_symbol_roundtrip() {
        assert_eq!(ws_symbol("BTCUSD"), "BTC/USD");
        assert_eq!(from_ws_symbol("BTC/USD"), "BTCUSD");
        assert_eq!(from_ws_symbol(&ws_symbol("SOLUSD")), "SOLUSD");
    }

    #[test]
    fn unavailable_when_disconnected() {
        let tier = HotTier::new("KRAKEN", 5_000);
        tier.record_tick("BTCUSD", sample_tick(0));
        assert!(!tier.is_available("BTCUSD"));
    }

    #[test]
    fn available_with_fresh_tick() {
        let tier = HotTier::new("KRAKEN", 5_000);
        tier.set_connected(true);
        tier.record_tick("BTCUSD", sample_tick(100));
        assert!(tier.is_available("BTCUSD"));
        assert!(!tier.is_available("ETHUSD"));
    }

    #[test]
    fn stale_tick_fails_stale_ws() {
        let tier = HotTier::new("KRAKEN", 5_000);
        tier.set_connected(true);
        tier.record_tick("BTCUSD", sample_tick(10_000));

        assert!(!tier.is_available("BTCUSD"));
        let err = tier.get_order_book("BTCUSD").unwrap_err();
        assert_eq!(err.kind, ErrorKind::DataQuality);
        assert!(err.message.contains("STALE_WS"));
    }

    #[test]
    fn order_book_envelope_from_tick() {
        let tier = HotTier::new("KRAKEN", 5_000);
        tier.set_connected(true);
        tier.record_tick("BTCUSD", sample_tick(100));

        let env = tier.get_order_book("BTCUSD").unwrap();
        assert_eq!(env.source_tier, Tier::Hot);
        assert_eq!(env.venue, "KRAKEN");
        match &env.payload {
            Payload::OrderBook(book) => {
                assert!((book.best_bid - 99.9).abs() < f64::EPSILON);
                assert!((book.bid_depth_usd - 99.9 * 2.0).abs() < 1e-9);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!((env.provenance.confidence_score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn price_envelope_carries_24h_volume() {
        let tier = HotTier::new("KRAKEN", 5_000);
        tier.set_connected(true);
        tier.record_tick("ETHUSD", sample_tick(100));

        let env = tier.get_price("ETHUSD").unwrap();
        match &env.payload {
            Payload::Price { bar, volume_24h_usd } => {
                assert!((bar.close - 100.0).abs() < f64::EPSILON);
                assert!((volume_24h_usd - 5_000_000.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn parse_ticker_update_frame() {
        let text = r#"{
            "channel": "ticker",
            "type": "update",
            "data": [{
                "symbol": "BTC/USD",
                "last": 37000.5,
                "bid": 37000.0,
                "bid_qty": 1.5,
                "ask": 37001.0,
                "ask_qty": 2.0,
                "volume": 1200.0,
                "vwap": 36900.0,
                "high": 37500.0,
                "low": 36500.0,
                "change": 250.5
            }]
        }"#;

        let (symbol, tick) = parse_ticker_message(text).unwrap().unwrap();
        assert_eq!(symbol, "BTCUSD");
        assert!((tick.last - 37000.5).abs() < f64::EPSILON);
        assert!((tick.volume_24h_usd - 1200.0 * 36900.0).abs() < 1e-6);
        assert!((tick.open_24h - (37000.5 - 250.5)).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_heartbeat_returns_none() {
        let text = r#"{"channel": "heartbeat"}"#;
        assert!(parse_ticker_message(text).unwrap().is_none());
    }
}
