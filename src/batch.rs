use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, Result};
use crate::ingest::sampled;
use crate::types::NormalizedQuote;

/// Destination for flushed quote batches. The engine hands the writer a
/// store-backed sink; tests hand it an in-memory one.
#[async_trait]
pub trait QuoteSink: Send + Sync {
    async fn insert_quotes(&self, quotes: &[NormalizedQuote]) -> Result<()>;
}

/// Accumulates normalized quotes and writes them out in bounded bursts.
///
/// Flush triggers: queue length reaching `batch_size`, or the periodic tick.
/// Failed batches are requeued at the front for the next flush; the retained
/// queue is capped at 10×batch_size, dropping oldest beyond that.
pub struct BatchWriter {
    queue: Mutex<VecDeque<NormalizedQuote>>,
    batch_size: usize,
    max_retained: usize,
    notify: Notify,
    queued: AtomicU64,
    inserted: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
    degraded: AtomicBool,
}

impl BatchWriter {
    pub fn new(batch_size: usize) -> Arc<Self> {
        let batch_size = batch_size.max(1);
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            batch_size,
            max_retained: batch_size * 10,
            notify: Notify::new(),
            queued: AtomicU64::new(0),
            inserted: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
        })
    }

    /// Non-blocking enqueue. Returns false when the queue is at its
    /// high-water mark; the caller drops the quote rather than blocking.
    pub fn enqueue(&self, quote: NormalizedQuote) -> bool {
        let hit_batch_size = {
            let mut queue = self.queue.lock();
            if queue.len() >= self.max_retained {
                return false;
            }
            queue.push_back(quote);
            queue.len() >= self.batch_size
        };
        self.queued.fetch_add(1, Ordering::Relaxed);
        if hit_batch_size {
            self.notify.notify_one();
        }
        true
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn queued_total(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn inserted_total(&self) -> u64 {
        self.inserted.load(Ordering::Relaxed)
    }

    pub fn error_total(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Flush loop. Runs until shutdown, then performs one final flush so a
    /// clean exit persists everything that was accepted.
    pub async fn run(
        self: Arc<Self>,
        sink: Arc<dyn QuoteSink>,
        flush_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = interval(flush_interval);
        tick.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.flush_once(sink.as_ref()).await;
                }
                _ = self.notify.notified() => {
                    if self.pending() >= self.batch_size {
                        self.flush_once(sink.as_ref()).await;
                    }
                }
                changed = shutdown.changed() => {
                    let stop = changed.is_err() || *shutdown.borrow();
                    if stop {
                        self.flush_once(sink.as_ref()).await;
                        info!(
                            queued = self.queued_total(),
                            inserted = self.inserted_total(),
                            errors = self.error_total(),
                            dropped = self.dropped_total(),
                            "batch writer: final flush complete"
                        );
                        return;
                    }
                }
            }
        }
    }

    /// Drain the queue atomically and hand the batch to the sink.
    pub async fn flush_once(&self, sink: &dyn QuoteSink) {
        let drained: Vec<NormalizedQuote> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }

        match sink.insert_quotes(&drained).await {
            Ok(()) => {
                self.inserted.fetch_add(drained.len() as u64, Ordering::Relaxed);
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!("quote persistence recovered, leaving degraded mode");
                }
                debug!(rows = drained.len(), "quote batch inserted");
            }
            Err(e) => {
                let errors = self.errors.fetch_add(1, Ordering::Relaxed) + 1;
                match &e {
                    AppError::PersistenceUnavailable(_) => {
                        if !self.degraded.swap(true, Ordering::Relaxed) {
                            error!("{e} — continuing in degraded mode, quotes will be retained up to the queue cap");
                        }
                    }
                    _ => {
                        if sampled(errors) {
                            error!(rows = drained.len(), "quote batch insert failed, requeueing: {e}");
                        }
                    }
                }

                let overflow = {
                    let mut queue = self.queue.lock();
                    for quote in drained.into_iter().rev() {
                        queue.push_front(quote);
                    }
                    let over = queue.len().saturating_sub(self.max_retained);
                    queue.drain(..over);
                    over
                };
                if overflow > 0 {
                    let dropped = self.dropped.fetch_add(overflow as u64, Ordering::Relaxed) + overflow as u64;
                    if sampled(dropped) {
                        warn!(overflow, "retained queue over cap, dropped oldest quotes");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Platform, Price, Side};
    use chrono::Utc;
    use uuid::Uuid;

    fn quote(n: u32) -> NormalizedQuote {
        let price = Price::from_raw(0.5);
        NormalizedQuote {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            platform: Platform::Polymarket,
            event_id: format!("asset-{n}"),
            proposition_name: format!("Market {n}"),
            price,
            side: Side::Buy,
            size: 1.0,
            probability_pct: price.pct(),
            liquidity_depth_usd: 0.0,
            bid_ask_spread_pct: None,
            volume_24h: None,
            confidence_flag: None,
            raw_payload: "{}".to_string(),
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        rows: Mutex<Vec<NormalizedQuote>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl QuoteSink for RecordingSink {
        async fn insert_quotes(&self, quotes: &[NormalizedQuote]) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(AppError::Config("sink down".to_string()));
            }
            self.rows.lock().extend_from_slice(quotes);
            Ok(())
        }
    }

    /// Sink that enqueues more quotes while a failing flush is in flight,
    /// forcing the requeue to overflow the retained cap.
    struct RefillingSink {
        writer: Arc<BatchWriter>,
        extra: u32,
    }

    #[async_trait]
    impl QuoteSink for RefillingSink {
        async fn insert_quotes(&self, _quotes: &[NormalizedQuote]) -> Result<()> {
            for n in 1000..1000 + self.extra {
                assert!(self.writer.enqueue(quote(n)));
            }
            Err(AppError::Config("sink down".to_string()))
        }
    }

    #[tokio::test]
    async fn enqueued_multiset_equals_persisted() {
        let writer = BatchWriter::new(5);
        let sink = RecordingSink::default();

        let mut expected: Vec<Uuid> = Vec::new();
        for n in 0..13 {
            let q = quote(n);
            expected.push(q.id);
            assert!(writer.enqueue(q));
        }
        // two partial flushes, like a tick firing mid-stream
        writer.flush_once(&sink).await;
        for n in 13..17 {
            let q = quote(n);
            expected.push(q.id);
            assert!(writer.enqueue(q));
        }
        writer.flush_once(&sink).await;

        let mut got: Vec<Uuid> = sink.rows.lock().iter().map(|q| q.id).collect();
        got.sort();
        expected.sort();
        assert_eq!(got, expected);
        assert_eq!(writer.queued_total(), 17);
        assert_eq!(writer.inserted_total(), 17);
        assert_eq!(writer.pending(), 0);
    }

    #[tokio::test]
    async fn failed_flush_requeues_in_order_then_persists() {
        let writer = BatchWriter::new(5);
        let sink = RecordingSink::default();
        sink.fail.store(true, Ordering::Relaxed);

        for n in 0..4 {
            writer.enqueue(quote(n));
        }
        writer.flush_once(&sink).await;
        assert_eq!(writer.error_total(), 1);
        assert_eq!(writer.pending(), 4);

        sink.fail.store(false, Ordering::Relaxed);
        writer.flush_once(&sink).await;

        let rows = sink.rows.lock();
        let names: Vec<&str> = rows.iter().map(|q| q.event_id.as_str()).collect();
        assert_eq!(names, vec!["asset-0", "asset-1", "asset-2", "asset-3"]);
    }

    #[tokio::test]
    async fn enqueue_refuses_beyond_high_water() {
        let writer = BatchWriter::new(2); // cap = 20
        for n in 0..20 {
            assert!(writer.enqueue(quote(n)));
        }
        assert!(!writer.enqueue(quote(99)), "21st quote must be refused");
        assert_eq!(writer.pending(), 20);
    }

    #[tokio::test]
    async fn requeue_overflow_drops_oldest() {
        let writer = BatchWriter::new(1); // cap = 10
        for n in 0..10 {
            assert!(writer.enqueue(quote(n)));
        }
        let sink = RefillingSink { writer: Arc::clone(&writer), extra: 3 };
        writer.flush_once(&sink).await;

        // 10 requeued + 3 arrived mid-flush → 3 oldest dropped
        assert_eq!(writer.pending(), 10);
        assert_eq!(writer.dropped_total(), 3);
        let front = writer.queue.lock().front().unwrap().event_id.clone();
        assert_eq!(front, "asset-3");
    }

    #[tokio::test]
    async fn missing_table_marks_degraded_and_recovers() {
        struct MissingTableSink {
            fail: AtomicBool,
        }
        #[async_trait]
        impl QuoteSink for MissingTableSink {
            async fn insert_quotes(&self, _q: &[NormalizedQuote]) -> Result<()> {
                if self.fail.load(Ordering::Relaxed) {
                    Err(AppError::PersistenceUnavailable("market_signals".to_string()))
                } else {
                    Ok(())
                }
            }
        }

        let writer = BatchWriter::new(2);
        let sink = MissingTableSink { fail: AtomicBool::new(true) };
        writer.enqueue(quote(1));
        writer.flush_once(&sink).await;
        assert!(writer.is_degraded());

        sink.fail.store(false, Ordering::Relaxed);
        writer.flush_once(&sink).await;
        assert!(!writer.is_degraded());
    }
}
