//! Background NDJSON event stream to the platform.
//!
//! Two delivery lanes. The default lane pushes onto an unbounded queue
//! drained by one worker that batches (5 events or 250 ms), POSTs NDJSON,
//! and retries a failed batch up to 10 times before dropping it so a dead
//! platform cannot grow memory forever. The synchronous lane posts inline
//! with 3 retries and is reserved for `run_completed`, so the terminal
//! transition is observed even if the worker dies. `close()` drains the
//! queue and joins the worker with a 30 s bound, which is what lets callers
//! exit knowing everything sendable was sent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gauge_wire::{encode_ndjson, EventBody, RunEventV1, SCHEMA_VERSION};

const MAX_BATCH: usize = 5;
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);
const QUEUE_POLL: Duration = Duration::from_millis(100);
const RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_BATCH_RETRIES: u32 = 10;
const SYNC_RETRIES: u32 = 3;
const CLOSE_GRACE: Duration = Duration::from_secs(30);

/// Where the scheduler publishes run events. The platform stream is the
/// production implementation; tests record in memory.
#[async_trait]
pub trait RunEventSink: Send + Sync {
    /// Queue an event for background delivery. Never blocks item progress.
    fn emit(&self, body: EventBody);

    /// Deliver inline with bounded retries; for terminal events.
    async fn emit_sync(&self, body: EventBody) -> anyhow::Result<()>;

    /// Drain and stop. Idempotent.
    async fn close(&self);
}

/// Transport seam so delivery is testable without a network.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn post_batch(&self, ndjson: &str) -> anyhow::Result<()>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, platform_url: &str, run_id: &str, api_key: &str) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}/v1/runs/{}/events",
                platform_url.trim_end_matches('/'),
                run_id
            ),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn post_batch(&self, ndjson: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/x-ndjson")
            .body(ndjson.to_string())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("event batch rejected with status {status}");
        }
        Ok(())
    }
}

pub struct EventStream {
    run_id: String,
    sequence: AtomicU64,
    transport: Arc<dyn EventTransport>,
    tx: mpsc::UnboundedSender<RunEventV1>,
    stop: CancellationToken,
    worker: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
}

impl EventStream {
    pub fn new(transport: Arc<dyn EventTransport>, run_id: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let dropped = Arc::new(AtomicU64::new(0));
        let worker = tokio::spawn(flush_loop(
            rx,
            transport.clone(),
            stop.clone(),
            dropped.clone(),
        ));
        Self {
            run_id: run_id.into(),
            sequence: AtomicU64::new(0),
            transport,
            tx,
            stop,
            worker: tokio::sync::Mutex::new(Some(worker)),
            dropped,
        }
    }

    pub fn http(
        client: reqwest::Client,
        platform_url: &str,
        run_id: &str,
        api_key: &str,
    ) -> Self {
        let transport = Arc::new(HttpTransport::new(client, platform_url, run_id, api_key));
        Self::new(transport, run_id)
    }

    /// Batches dropped after exhausting the retry budget.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    fn envelope(&self, body: EventBody) -> RunEventV1 {
        RunEventV1 {
            schema_version: SCHEMA_VERSION,
            event_id: Uuid::new_v4(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            sent_at: Utc::now(),
            run_id: self.run_id.clone(),
            body,
        }
    }
}

#[async_trait]
impl RunEventSink for EventStream {
    fn emit(&self, body: EventBody) {
        let event = self.envelope(body);
        if self.tx.send(event).is_err() {
            tracing::warn!(run_id = %self.run_id, "event stream worker gone; event discarded");
        }
    }

    async fn emit_sync(&self, body: EventBody) -> anyhow::Result<()> {
        let event = self.envelope(body);
        let ndjson = encode_ndjson(std::slice::from_ref(&event));
        let mut last_err = None;
        for attempt in 1..=SYNC_RETRIES {
            match self.transport.post_batch(&ndjson).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        run_id = %self.run_id,
                        attempt,
                        error = %err,
                        "synchronous event delivery failed"
                    );
                    last_err = Some(err);
                    if attempt < SYNC_RETRIES {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("event delivery failed")))
    }

    async fn close(&self) {
        self.stop.cancel();
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(CLOSE_GRACE, handle).await.is_err() {
                tracing::warn!(run_id = %self.run_id, "event stream flush did not finish in time");
            }
        }
    }
}

async fn flush_loop(
    mut rx: mpsc::UnboundedReceiver<RunEventV1>,
    transport: Arc<dyn EventTransport>,
    stop: CancellationToken,
    dropped: Arc<AtomicU64>,
) {
    let mut batch: Vec<RunEventV1> = Vec::new();
    let mut last_flush = Instant::now();
    let mut sender_gone = false;

    loop {
        match tokio::time::timeout(QUEUE_POLL, rx.recv()).await {
            Ok(Some(event)) => batch.push(event),
            Ok(None) => sender_gone = true,
            Err(_) => {}
        }

        let stopping = stop.is_cancelled() || sender_gone;
        if stopping {
            while let Ok(event) = rx.try_recv() {
                batch.push(event);
            }
        }

        let should_flush = batch.len() >= MAX_BATCH
            || (!batch.is_empty() && last_flush.elapsed() >= FLUSH_INTERVAL)
            || (stopping && !batch.is_empty());

        if should_flush {
            let ndjson = encode_ndjson(&batch);
            let mut delivered = false;
            for attempt in 1..=MAX_BATCH_RETRIES {
                match transport.post_batch(&ndjson).await {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(
                            attempt,
                            batch_len = batch.len(),
                            error = %err,
                            "event batch delivery failed"
                        );
                        if attempt < MAX_BATCH_RETRIES {
                            tokio::time::sleep(RETRY_DELAY).await;
                        }
                    }
                }
            }
            if !delivered {
                dropped.fetch_add(batch.len() as u64, Ordering::SeqCst);
                tracing::warn!(
                    batch_len = batch.len(),
                    "dropping event batch after retry budget"
                );
            }
            batch.clear();
            last_flush = Instant::now();
        }

        if stopping && batch.is_empty() {
            break;
        }
    }
}
