use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Deserializer};
use tokio::sync::watch;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::batch::BatchWriter;
use crate::config::{Config, KEEPALIVE_INTERVAL_SECS};
use crate::error::Result;
use crate::ingest::{backoff_delay, normalize, sampled};
use crate::micro::MicroCache;
use crate::types::{Platform, Price, Side};

/// Numeric field that arrives as either a JSON number or a string.
#[derive(Debug, Clone, Copy)]
pub struct Num(pub f64);

impl<'de> Deserialize<'de> for Num {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct NumVisitor;

        impl serde::de::Visitor<'_> for NumVisitor {
            type Value = Num;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a number or a numeric string")
            }

            fn visit_f64<E: serde::de::Error>(self, v: f64) -> std::result::Result<Num, E> {
                Ok(Num(v))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<Num, E> {
                Ok(Num(v as f64))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<Num, E> {
                Ok(Num(v as f64))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<Num, E> {
                v.parse::<f64>().map(Num).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_any(NumVisitor)
    }
}

/// One ladder level, accepted as `{price, size}` or `[price, size]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Level {
    Obj { price: Num, size: Num },
    Pair(Num, Num),
}

impl Level {
    pub fn pair(&self) -> (f64, f64) {
        match self {
            Level::Obj { price, size } => (price.0, size.0),
            Level::Pair(price, size) => (price.0, size.0),
        }
    }
}

/// Market-channel message families. Unhandled event types fall into
/// `Unknown` so adding a variant is a compile-visible change, not a parse
/// failure.
#[derive(Debug, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum PolyMessage {
    Trade {
        asset_id: String,
        price: Num,
        #[serde(default)]
        size: Option<Num>,
        #[serde(default)]
        side: Option<String>,
    },
    LastTradePrice {
        asset_id: String,
        price: Num,
    },
    PriceChange {
        asset_id: String,
        #[serde(default)]
        best_bid: Option<Num>,
        #[serde(default)]
        best_ask: Option<Num>,
    },
    Book {
        asset_id: String,
        #[serde(default)]
        bids: Vec<Level>,
        #[serde(default)]
        asks: Vec<Level>,
    },
    BookSnapshot {
        asset_id: String,
        #[serde(default)]
        bids: Vec<Level>,
        #[serde(default)]
        asks: Vec<Level>,
    },
    #[serde(other)]
    Unknown,
}

/// Parse a raw frame into zero or more messages. Frames arrive as either a
/// single object or an array of objects.
pub fn decode_frame(raw: &str) -> Vec<PolyMessage> {
    if raw.trim_start().starts_with('[') {
        serde_json::from_str(raw).unwrap_or_default()
    } else {
        serde_json::from_str::<PolyMessage>(raw).map(|m| vec![m]).unwrap_or_default()
    }
}

/// Persistent session against the Polymarket CLOB market channel.
pub struct PolymarketSession {
    cfg: Config,
    cache: Arc<MicroCache>,
    writer: Arc<BatchWriter>,
    health: Arc<HealthState>,
    /// asset_id → display name, from the catalog at startup.
    names: Arc<HashMap<String, String>>,
    shutdown: watch::Receiver<bool>,
    frames_received: AtomicU64,
    parse_failures: AtomicU64,
    quotes_dropped: AtomicU64,
}

impl PolymarketSession {
    pub fn new(
        cfg: Config,
        cache: Arc<MicroCache>,
        writer: Arc<BatchWriter>,
        health: Arc<HealthState>,
        names: Arc<HashMap<String, String>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cfg,
            cache,
            writer,
            health,
            names,
            shutdown,
            frames_received: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            quotes_dropped: AtomicU64::new(0),
        }
    }

    /// Recovery loop. Failures here never touch the Kalshi session.
    pub async fn run(mut self) {
        if self.cfg.polymarket_asset_ids.is_empty() {
            warn!("POLYMARKET_ASSET_IDS not set — session will connect but receive no data");
        }

        let mut attempt = 0u32;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            info!(url = %self.cfg.polymarket_ws_url, "polymarket session connecting");
            match self.connect_once(&mut attempt).await {
                Ok(()) => info!("polymarket session closed"),
                Err(e) => error!("polymarket session error: {e}"),
            }
            self.health.set_connected(Platform::Polymarket, false);
            if *self.shutdown.borrow() {
                break;
            }

            let delay = backoff_delay(
                attempt,
                self.cfg.reconnect_base_delay_ms,
                self.cfg.reconnect_max_delay_ms,
            );
            attempt = attempt.saturating_add(1);
            warn!(attempt, "polymarket session reconnecting in {}ms", delay.as_millis());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }
        info!("polymarket session stopped");
    }

    async fn connect_once(&mut self, attempt: &mut u32) -> Result<()> {
        let (ws_stream, _) = connect_async(&self.cfg.polymarket_ws_url).await?;
        *attempt = 0;
        self.health.set_connected(Platform::Polymarket, true);

        let (mut write, mut read) = ws_stream.split();

        if !self.cfg.polymarket_asset_ids.is_empty() {
            let mut sub = serde_json::json!({
                "assets_ids": self.cfg.polymarket_asset_ids,
                "type": "market",
            });
            if let Some(key) = &self.cfg.polymarket_api_key {
                sub["auth"] = serde_json::json!({ "apiKey": key });
            }
            write.send(Message::Text(sub.to_string().into())).await?;
            info!(assets = self.cfg.polymarket_asset_ids.len(), "polymarket subscribed");
        }

        let mut keepalive = interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
        keepalive.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                        Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }
                _ = keepalive.tick() => {
                    // application-level liveness probe for this venue
                    write.send(Message::Text("ping".to_string().into())).await?;
                }
                _ = self.shutdown.changed() => {
                    return Ok(());
                }
            }
        }
    }

    fn handle_frame(&self, raw: &str) {
        if raw.trim().eq_ignore_ascii_case("pong") {
            return; // reply to our application-level ping
        }
        let total = self.frames_received.fetch_add(1, Ordering::Relaxed) + 1;
        if total % 500 == 0 {
            debug!(frames = total, cached_assets = self.cache.len(), "polymarket frame counter");
        }

        let messages = decode_frame(raw);
        if messages.is_empty() {
            let failures = self.parse_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if sampled(failures) {
                let sample = &raw[..raw.len().min(300)];
                warn!(failures, "polymarket unrecognized frame: {sample}");
            }
            return;
        }

        for message in messages {
            self.handle_message(message, raw);
        }
    }

    fn handle_message(&self, message: PolyMessage, raw: &str) {
        match message {
            PolyMessage::Book { asset_id, bids, asks }
            | PolyMessage::BookSnapshot { asset_id, bids, asks } => {
                let bids: Vec<(f64, f64)> = bids.iter().map(Level::pair).collect();
                let asks: Vec<(f64, f64)> = asks.iter().map(Level::pair).collect();
                self.cache.apply_book(&asset_id, &bids, &asks);
            }
            PolyMessage::PriceChange { asset_id, best_bid, best_ask } => {
                self.cache.apply_ticker(
                    &asset_id,
                    best_bid.map(|n| n.0),
                    best_ask.map(|n| n.0),
                    None,
                );
                // top-of-book moves also refresh the persisted stream
                self.emit(&asset_id, 0.0, Side::Buy, 0.0, raw);
            }
            PolyMessage::Trade { asset_id, price, size, side } => {
                let side = match side.as_deref() {
                    Some(s) if s.eq_ignore_ascii_case("sell") => Side::Sell,
                    _ => Side::Buy,
                };
                let size = size.map(|n| n.0).unwrap_or(0.0);
                self.emit(&asset_id, price.0, side, size, raw);
            }
            PolyMessage::LastTradePrice { asset_id, price } => {
                // no side or size on this family
                self.emit(&asset_id, price.0, Side::Buy, 0.0, raw);
            }
            PolyMessage::Unknown => {}
        }
    }

    /// Normalize and hand off one quote. Price preference: cached mid over
    /// the trade print.
    fn emit(&self, asset_id: &str, trade_price: f64, side: Side, size: f64, raw: &str) {
        let micro = self.cache.get(asset_id);
        let price = match micro.as_ref().and_then(|m| m.mid()) {
            Some(mid) => Price::from_raw(mid),
            None if trade_price > 0.0 => Price::from_raw(trade_price),
            None => return, // nothing usable to price this quote
        };

        let name = self
            .names
            .get(asset_id)
            .map(String::as_str)
            .unwrap_or(asset_id);

        let quote = normalize::build_quote(
            Platform::Polymarket,
            asset_id,
            name,
            price,
            side,
            size,
            micro.as_ref(),
            raw.to_string(),
        );

        let at_ms = quote.timestamp.timestamp_millis();
        if self.writer.enqueue(quote) {
            self.health.mark_quote_emitted(at_ms);
        } else {
            let dropped = self.quotes_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if sampled(dropped) {
                warn!(asset_id, dropped, "batch queue at high-water mark, dropping polymarket quote");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_trade_with_string_numbers() {
        let raw = r#"{"event_type":"trade","asset_id":"tok1","price":"0.64","size":"120","side":"SELL"}"#;
        let msgs = decode_frame(raw);
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            PolyMessage::Trade { asset_id, price, size, side } => {
                assert_eq!(asset_id, "tok1");
                assert!((price.0 - 0.64).abs() < 1e-12);
                assert!((size.as_ref().unwrap().0 - 120.0).abs() < 1e-12);
                assert_eq!(side.as_deref(), Some("SELL"));
            }
            other => panic!("expected Trade, got {other:?}"),
        }
    }

    #[test]
    fn decodes_book_with_object_and_tuple_levels() {
        let raw = r#"{"event_type":"book","asset_id":"tok1","bids":[{"price":"0.63","size":"100"}],"asks":[[0.65,100]]}"#;
        let msgs = decode_frame(raw);
        match &msgs[0] {
            PolyMessage::Book { bids, asks, .. } => {
                assert_eq!(bids[0].pair(), (0.63, 100.0));
                assert_eq!(asks[0].pair(), (0.65, 100.0));
            }
            other => panic!("expected Book, got {other:?}"),
        }
    }

    #[test]
    fn decodes_array_frame() {
        let raw = r#"[{"event_type":"last_trade_price","asset_id":"tok1","price":"0.57"},{"event_type":"price_change","asset_id":"tok2","best_bid":"0.41","best_ask":"0.43"}]"#;
        let msgs = decode_frame(raw);
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0], PolyMessage::LastTradePrice { .. }));
        assert!(matches!(msgs[1], PolyMessage::PriceChange { .. }));
    }

    #[test]
    fn unknown_event_type_is_not_a_parse_failure() {
        let raw = r#"{"event_type":"tick_size_change","asset_id":"tok1"}"#;
        let msgs = decode_frame(raw);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0], PolyMessage::Unknown));
    }

    #[test]
    fn garbage_decodes_to_nothing() {
        assert!(decode_frame("not json").is_empty());
        assert!(decode_frame(r#"{"no_event_type":true}"#).is_empty());
    }
}
