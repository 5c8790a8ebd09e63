use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::RsaPrivateKey;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::watch;
use tokio::time::interval;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message},
};
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::batch::BatchWriter;
use crate::config::{Config, KALSHI_WS_SIGN_PATH, KEEPALIVE_INTERVAL_SECS};
use crate::error::{AppError, Result};
use crate::ingest::{backoff_delay, normalize, sampled};
use crate::micro::MicroCache;
use crate::types::{Platform, Price, Side};

// ---------------------------------------------------------------------------
// Connection signing
// ---------------------------------------------------------------------------

/// Decode the base64-wrapped PEM private key. Kalshi issues PKCS#1 keys but
/// exported keys are sometimes re-wrapped as PKCS#8, so both are accepted.
pub fn decode_private_key(b64: &str) -> Result<RsaPrivateKey> {
    let pem_bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| AppError::Signing(format!("private key is not valid base64: {e}")))?;
    let pem = String::from_utf8(pem_bytes)
        .map_err(|e| AppError::Signing(format!("private key is not valid UTF-8 PEM: {e}")))?;
    RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|e| AppError::Signing(format!("could not parse RSA private key: {e}")))
}

/// RSA-PSS over SHA-256 (MGF1-SHA256, salt length = digest size) of
/// `timestamp || "GET" || path`, base64-encoded.
pub fn sign_ws_auth(key: &RsaPrivateKey, timestamp_ms: i64, path: &str) -> String {
    let message = format!("{timestamp_ms}GET{path}");
    let signing_key = rsa::pss::SigningKey::<Sha256>::new(key.clone());
    let signature = signing_key.sign_with_rng(&mut rand::thread_rng(), message.as_bytes());
    BASE64.encode(signature.to_bytes())
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct KalshiTrade {
    #[serde(alias = "market_ticker")]
    pub ticker: String,
    pub yes_price: i64,
    #[serde(default)]
    pub no_price: Option<i64>,
    #[serde(default)]
    pub count: Option<i64>,
    #[serde(default)]
    pub taker_side: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KalshiTicker {
    #[serde(alias = "market_ticker")]
    pub ticker: String,
    #[serde(default)]
    pub yes_bid: Option<i64>,
    #[serde(default)]
    pub yes_ask: Option<i64>,
    #[serde(default)]
    pub no_bid: Option<i64>,
    #[serde(default)]
    pub no_ask: Option<i64>,
    #[serde(default)]
    pub volume: Option<f64>,
}

/// Feed envelope. Payloads ride inside `msg`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KalshiMessage {
    Trade { msg: KalshiTrade },
    Ticker { msg: KalshiTicker },
    Subscribed {},
    Error { #[serde(default)] msg: Option<serde_json::Value> },
    Pong {},
    #[serde(other)]
    Unknown,
}

pub fn decode_frame(raw: &str) -> Option<KalshiMessage> {
    serde_json::from_str(raw).ok()
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Persistent session against the Kalshi trade-api WebSocket.
pub struct KalshiSession {
    cfg: Config,
    cache: Arc<MicroCache>,
    writer: Arc<BatchWriter>,
    health: Arc<HealthState>,
    /// ticker → display name, from the catalog at startup.
    names: Arc<HashMap<String, String>>,
    shutdown: watch::Receiver<bool>,
    private_key: Option<RsaPrivateKey>,
    parse_failures: AtomicU64,
    quotes_dropped: AtomicU64,
}

impl KalshiSession {
    pub fn new(
        cfg: Config,
        cache: Arc<MicroCache>,
        writer: Arc<BatchWriter>,
        health: Arc<HealthState>,
        names: Arc<HashMap<String, String>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let private_key = match cfg.kalshi_private_key_base64.as_deref() {
            Some(b64) => match decode_private_key(b64) {
                Ok(key) => Some(key),
                Err(e) => {
                    error!("KALSHI_PRIVATE_KEY_BASE64 unusable, connecting unsigned: {e}");
                    None
                }
            },
            None => None,
        };

        Self {
            cfg,
            cache,
            writer,
            health,
            names,
            shutdown,
            private_key,
            parse_failures: AtomicU64::new(0),
            quotes_dropped: AtomicU64::new(0),
        }
    }

    /// Recovery loop, independent of the Polymarket session.
    pub async fn run(mut self) {
        if self.cfg.kalshi_tickers.is_empty() {
            warn!("KALSHI_TICKERS not set — session will connect but receive no data");
        }
        if self.cfg.kalshi_api_key.is_none() || self.private_key.is_none() {
            warn!("kalshi credentials incomplete — the venue will reject the unsigned session");
        }

        let mut attempt = 0u32;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            info!(url = %self.cfg.kalshi_ws_url, "kalshi session connecting");
            match self.connect_once(&mut attempt).await {
                Ok(()) => info!("kalshi session closed"),
                Err(e) => error!("kalshi session error: {e}"),
            }
            self.health.set_connected(Platform::Kalshi, false);
            if *self.shutdown.borrow() {
                break;
            }

            let delay = backoff_delay(
                attempt,
                self.cfg.reconnect_base_delay_ms,
                self.cfg.reconnect_max_delay_ms,
            );
            attempt = attempt.saturating_add(1);
            warn!(attempt, "kalshi session reconnecting in {}ms", delay.as_millis());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }
        info!("kalshi session stopped");
    }

    fn signed_request(&self) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = self.cfg.kalshi_ws_url.as_str().into_client_request()?;

        if let (Some(api_key), Some(private_key)) = (&self.cfg.kalshi_api_key, &self.private_key) {
            let timestamp_ms = chrono::Utc::now().timestamp_millis();
            let signature = sign_ws_auth(private_key, timestamp_ms, KALSHI_WS_SIGN_PATH);
            let headers = request.headers_mut();
            headers.insert(
                "KALSHI-ACCESS-KEY",
                api_key
                    .parse()
                    .map_err(|_| AppError::Signing("api key is not a valid header value".to_string()))?,
            );
            headers.insert(
                "KALSHI-ACCESS-TIMESTAMP",
                timestamp_ms
                    .to_string()
                    .parse()
                    .map_err(|_| AppError::Signing("timestamp header".to_string()))?,
            );
            headers.insert(
                "KALSHI-ACCESS-SIGNATURE",
                signature
                    .parse()
                    .map_err(|_| AppError::Signing("signature is not a valid header value".to_string()))?,
            );
        }

        Ok(request)
    }

    async fn connect_once(&mut self, attempt: &mut u32) -> Result<()> {
        let request = self.signed_request()?;
        let (ws_stream, _) = connect_async(request).await?;
        *attempt = 0;
        self.health.set_connected(Platform::Kalshi, true);

        let (mut write, mut read) = ws_stream.split();

        if !self.cfg.kalshi_tickers.is_empty() {
            for (id, channel) in [(1u32, "trade"), (2u32, "ticker")] {
                let sub = serde_json::json!({
                    "id": id,
                    "cmd": "subscribe",
                    "params": {
                        "channels": [channel],
                        "market_tickers": self.cfg.kalshi_tickers,
                    },
                });
                write.send(Message::Text(sub.to_string().into())).await?;
            }
            info!(tickers = self.cfg.kalshi_tickers.len(), "kalshi subscribed to trade + ticker");
        }

        // This venue rejects application-level ping text; keep the session
        // alive with protocol-level Ping frames instead.
        let mut keepalive = interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
        keepalive.tick().await;

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
                    write.send(Message::Ping(Vec::new().into())).await?;
                }
                _ = self.shutdown.changed() => {
                    return Ok(());
                }
            }
        }
    }

    fn handle_frame(&self, raw: &str) {
        let Some(message) = decode_frame(raw) else {
            let failures = self.parse_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if sampled(failures) {
                let sample = &raw[..raw.len().min(300)];
                warn!(failures, "kalshi unrecognized frame: {sample}");
            }
            return;
        };

        match message {
            KalshiMessage::Ticker { msg } => {
                self.cache.apply_ticker(
                    &msg.ticker,
                    msg.yes_bid.map(|c| c as f64 / 100.0),
                    msg.yes_ask.map(|c| c as f64 / 100.0),
                    msg.volume,
                );
            }
            KalshiMessage::Trade { msg } => {
                let side = match msg.taker_side.as_deref() {
                    Some("no") => Side::Sell,
                    _ => Side::Buy,
                };
                let size = msg.count.unwrap_or(0).max(0) as f64;
                self.emit(&msg.ticker, msg.yes_price, side, size, raw);
            }
            KalshiMessage::Subscribed {} => debug!("kalshi subscription confirmed"),
            KalshiMessage::Error { msg } => warn!("kalshi feed error: {msg:?}"),
            KalshiMessage::Pong {} | KalshiMessage::Unknown => {}
        }
    }

    /// Normalize and hand off one trade. Price preference: cached mid over
    /// the trade's yes price in cents.
    fn emit(&self, ticker: &str, yes_price_cents: i64, side: Side, size: f64, raw: &str) {
        let micro = self.cache.get(ticker);
        let price = match micro.as_ref().and_then(|m| m.mid()) {
            Some(mid) => Price::from_raw(mid),
            None if yes_price_cents > 0 => Price::from_cents(yes_price_cents),
            None => return,
        };

        let name = self.names.get(ticker).map(String::as_str).unwrap_or(ticker);

        let quote = normalize::build_quote(
            Platform::Kalshi,
            ticker,
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
                warn!(ticker, dropped, "batch queue at high-water mark, dropping kalshi quote");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_trade_envelope() {
        let raw = r#"{"type":"trade","sid":3,"msg":{"market_ticker":"KXFED-25DEC","yes_price":62,"no_price":38,"count":5,"taker_side":"yes","ts":1735600000}}"#;
        match decode_frame(raw) {
            Some(KalshiMessage::Trade { msg }) => {
                assert_eq!(msg.ticker, "KXFED-25DEC");
                assert_eq!(msg.yes_price, 62);
                assert_eq!(msg.count, Some(5));
                assert_eq!(msg.taker_side.as_deref(), Some("yes"));
            }
            other => panic!("expected Trade, got {other:?}"),
        }
    }

    #[test]
    fn decodes_ticker_envelope() {
        let raw = r#"{"type":"ticker","sid":4,"msg":{"market_ticker":"KXFED-25DEC","yes_bid":61,"yes_ask":63,"no_bid":37,"no_ask":39,"volume":15000,"ts":1735600000}}"#;
        match decode_frame(raw) {
            Some(KalshiMessage::Ticker { msg }) => {
                assert_eq!(msg.yes_bid, Some(61));
                assert_eq!(msg.yes_ask, Some(63));
                assert_eq!(msg.volume, Some(15000.0));
            }
            other => panic!("expected Ticker, got {other:?}"),
        }
    }

    #[test]
    fn decodes_control_frames() {
        assert!(matches!(
            decode_frame(r#"{"type":"subscribed","id":1,"msg":{"channel":"trade","sid":3}}"#),
            Some(KalshiMessage::Subscribed {})
        ));
        assert!(matches!(
            decode_frame(r#"{"type":"pong"}"#),
            Some(KalshiMessage::Pong {})
        ));
        assert!(matches!(
            decode_frame(r#"{"type":"order_fill","msg":{}}"#),
            Some(KalshiMessage::Unknown)
        ));
        assert!(decode_frame("garbage").is_none());
    }

    #[test]
    fn ws_signature_roundtrips_under_pss_verification() {
        use rsa::pss::VerifyingKey;
        use rsa::signature::Verifier;

        // throwaway 2048-bit key; generation is slow but deterministic enough for CI
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let timestamp_ms = 1_735_600_000_123i64;
        let sig_b64 = sign_ws_auth(&key, timestamp_ms, KALSHI_WS_SIGN_PATH);

        let verifying_key = VerifyingKey::<Sha256>::new(key.to_public_key());
        let sig_bytes = BASE64.decode(sig_b64).unwrap();
        let signature = rsa::pss::Signature::try_from(sig_bytes.as_slice()).unwrap();
        let message = format!("{timestamp_ms}GET{}", KALSHI_WS_SIGN_PATH);
        verifying_key.verify(message.as_bytes(), &signature).unwrap();
    }

    #[test]
    fn rejects_bad_private_key_material() {
        assert!(decode_private_key("!!!not-base64!!!").is_err());
        let not_pem = BASE64.encode("this is not a pem file");
        assert!(decode_private_key(&not_pem).is_err());
    }
}
