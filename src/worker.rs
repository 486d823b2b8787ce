// One worker per live subscription token: polls the snapshot source,
// runs detection + the stability filter, and fans results out to every
// attached subscriber channel.

use crate::stability::StabilityFilter;
use crate::types::{Config, FrameObservation};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Error messages sent to subscribers are truncated to this many chars.
pub const ERROR_TRUNCATE: usize = 100;
/// Bounded per-subscriber queue depth.
pub const SUBSCRIBER_QUEUE: usize = 10;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_FACTOR: f64 = 1.5;
const BACKOFF_CAP: Duration = Duration::from_secs(10);

// The subscriber that triggered the spawn attaches only after ensure()
// returns, so the first empty-set check waits this long before retiring.
const ATTACH_GRACE: Duration = Duration::from_millis(250);

/// Failures inside the poll loop. These never escape the worker; they
/// become `error` events plus backoff.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("snapshot fetch failed: {0}")]
    Fetch(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Events delivered to subscriber channels, in the worker's step order.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Count(u32),
    Log(String),
    Error(String),
    Heartbeat,
    Idle,
    Revoked,
}

#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, PollError>;
}

#[async_trait]
pub trait FrameAnalyzer: Send + Sync + 'static {
    async fn analyze(&self, image_bytes: Vec<u8>) -> Result<FrameObservation, PollError>;
}

/// Knobs the loop needs, snapshotted from the config.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub heartbeat: Duration,
    pub window_size: usize,
    pub close_zero_run: usize,
    pub fast_open_threshold: f32,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat: Duration::from_secs(config.stream.heartbeat_sec),
            window_size: config.stability.window_size,
            close_zero_run: config.stability.close_zero_run,
            fast_open_threshold: config.detection.fast_open_threshold,
        }
    }
}

pub struct Worker {
    token: String,
    url: String,
    interval_sec: AtomicU64,
    subscribers: Mutex<Vec<(u64, mpsc::Sender<OutputEvent>)>>,
    next_subscriber_id: AtomicU64,
    running: AtomicBool,
    source: Arc<dyn SnapshotSource>,
    analyzer: Arc<dyn FrameAnalyzer>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        token: &str,
        url: &str,
        interval_sec: u64,
        source: Arc<dyn SnapshotSource>,
        analyzer: Arc<dyn FrameAnalyzer>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            token: token.to_string(),
            url: url.to_string(),
            interval_sec: AtomicU64::new(interval_sec.max(1)),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(0),
            running: AtomicBool::new(false),
            source,
            analyzer,
            settings,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn set_interval(&self, interval_sec: u64) {
        self.interval_sec.store(interval_sec.max(1), Ordering::Relaxed);
    }

    /// Add a subscriber channel; returns the id to pass to `detach`.
    pub fn attach(&self, tx: mpsc::Sender<OutputEvent>) -> u64 {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.push((id, tx));
        debug!(token = %self.token, id, "subscriber attached ({} total)", subs.len());
        id
    }

    /// Remove a subscriber channel. No-op if already gone.
    pub fn detach(&self, id: u64) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|(sub_id, _)| *sub_id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Notify every subscriber the token is gone and close their streams.
    /// Clearing the set drops the senders, which is the close signal, and
    /// makes the loop exit on its next liveness check.
    pub fn revoke(&self) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        info!(token = %self.token, "revoking {} subscriber(s)", subs.len());
        for (_, tx) in subs.iter() {
            let _ = tx.try_send(OutputEvent::Revoked);
        }
        subs.clear();
    }

    /// Best-effort fan-out: a full or closed channel is dropped from the
    /// set rather than stalling the loop.
    fn broadcast(&self, event: &OutputEvent) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!(token = %self.token, id, "dropping unreachable subscriber");
                false
            }
        });
    }

    /// Marks the loop as running. Returns true if the caller should spawn
    /// it; callers must hold the manager's table lock so only one loop
    /// ever runs per token.
    pub(crate) fn begin_run(&self) -> bool {
        !self.running.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn end_run(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn poll_once(&self) -> Result<FrameObservation, PollError> {
        let bytes = self.source.fetch(&self.url).await?;
        self.analyzer.analyze(bytes).await
    }

    /// The detect-publish cycle. Runs until the attachment set is empty at
    /// the top of an iteration.
    pub async fn run(self: Arc<Self>) {
        let mut filter = StabilityFilter::new(
            self.settings.window_size,
            self.settings.close_zero_run,
            self.settings.fast_open_threshold,
        );
        let mut backoff = Backoff::new();
        let mut last_publish = Instant::now();
        let mut first_check = true;

        info!(token = %self.token, url = %self.url, "worker loop started");
        loop {
            if self.subscriber_count() == 0 {
                if !first_check {
                    break;
                }
                sleep(ATTACH_GRACE).await;
                if self.subscriber_count() == 0 {
                    break;
                }
            }
            first_check = false;

            let started = Instant::now();
            match self.poll_once().await {
                Ok(obs) => {
                    let published = filter.update(obs.raw_count, obs.max_confidence);
                    self.broadcast(&OutputEvent::Count(published));
                    self.broadcast(&OutputEvent::Log(format!(
                        "raw={} published={} state={:?} max_conf={:.2} confs={:?}",
                        obs.raw_count,
                        published,
                        filter.state(),
                        obs.max_confidence,
                        obs.confidences
                    )));
                    last_publish = started;
                    backoff.reset();
                }
                Err(err) => {
                    let message = truncate_chars(&err.to_string(), ERROR_TRUNCATE);
                    warn!(token = %self.token, "poll failed: {message}");
                    self.broadcast(&OutputEvent::Error(message));
                    sleep(backoff.next_delay()).await;
                }
            }

            if last_publish.elapsed() > self.settings.heartbeat {
                self.broadcast(&OutputEvent::Heartbeat);
                last_publish = Instant::now();
            }

            let interval = Duration::from_secs(self.interval_sec.load(Ordering::Relaxed));
            sleep(interval.saturating_sub(started.elapsed())).await;
        }
        info!(token = %self.token, "worker loop stopped");
    }
}

/// Failure backoff: 1s, x1.5 per consecutive failure, capped at 10s,
/// reset to 1s on success.
pub struct Backoff {
    delay: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            delay: BACKOFF_INITIAL,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * BACKOFF_FACTOR).min(BACKOFF_CAP.as_secs_f64()),
        );
        current
    }

    pub fn reset(&mut self) {
        self.delay = BACKOFF_INITIAL;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Canned snapshot source: always succeeds with an empty payload.
    pub struct StubSource {
        pub fetches: AtomicUsize,
    }

    impl StubSource {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SnapshotSource for StubSource {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>, PollError> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            Ok(Vec::new())
        }
    }

    /// Canned analyzer: fixed count and confidence.
    pub struct StubAnalyzer {
        pub raw_count: u32,
        pub confidence: f32,
    }

    #[async_trait]
    impl FrameAnalyzer for StubAnalyzer {
        async fn analyze(&self, _image_bytes: Vec<u8>) -> Result<FrameObservation, PollError> {
            Ok(FrameObservation {
                raw_count: self.raw_count,
                max_confidence: self.confidence,
                confidences: vec![self.confidence; self.raw_count as usize],
            })
        }
    }

    pub fn settings() -> WorkerSettings {
        WorkerSettings {
            heartbeat: Duration::from_secs(15),
            window_size: 4,
            close_zero_run: 3,
            fast_open_threshold: 0.30,
        }
    }

    pub fn stub_worker(token: &str) -> Arc<Worker> {
        Arc::new(Worker::new(
            token,
            "http://camera.local/snapshot.jpg",
            1,
            StubSource::new(),
            Arc::new(StubAnalyzer {
                raw_count: 1,
                confidence: 0.9,
            }),
            settings(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_secs_f64(1.0));
        assert_eq!(backoff.next_delay(), Duration::from_secs_f64(1.5));
        assert_eq!(backoff.next_delay(), Duration::from_secs_f64(2.25));
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), BACKOFF_CAP);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs_f64(1.0));
    }

    #[test]
    fn error_messages_truncate_on_char_boundaries() {
        let long = "é".repeat(200);
        let out = truncate_chars(&long, ERROR_TRUNCATE);
        assert_eq!(out.chars().count(), ERROR_TRUNCATE);
    }

    #[test]
    fn detach_is_a_noop_when_absent() {
        let worker = stub_worker("tok1");
        let (tx, _rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = worker.attach(tx);
        worker.detach(id);
        worker.detach(id);
        assert_eq!(worker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn revoke_notifies_all_then_closes() {
        let worker = stub_worker("tok2");
        let (tx1, mut rx1) = mpsc::channel(SUBSCRIBER_QUEUE);
        let (tx2, mut rx2) = mpsc::channel(SUBSCRIBER_QUEUE);
        worker.attach(tx1);
        worker.attach(tx2);

        worker.revoke();

        assert_eq!(rx1.recv().await, Some(OutputEvent::Revoked));
        assert_eq!(rx1.recv().await, None); // sender dropped = close signal
        assert_eq!(rx2.recv().await, Some(OutputEvent::Revoked));
        assert_eq!(rx2.recv().await, None);
        assert_eq!(worker.subscriber_count(), 0);

        // No further counts can reach a revoked subscriber.
        worker.broadcast(&OutputEvent::Count(3));
        assert_eq!(worker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn full_subscriber_is_dropped_not_awaited() {
        let worker = stub_worker("tok3");
        let (tx, _rx) = mpsc::channel(1);
        worker.attach(tx);

        worker.broadcast(&OutputEvent::Count(1));
        assert_eq!(worker.subscriber_count(), 1);
        // Queue now full; the next broadcast evicts the laggard.
        worker.broadcast(&OutputEvent::Count(2));
        assert_eq!(worker.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_publishes_count_then_log_in_order() {
        let worker = stub_worker("tok4");
        let (tx, mut rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = worker.attach(tx);

        let handle = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run().await }
        });

        assert_eq!(rx.recv().await, Some(OutputEvent::Count(1)));
        match rx.recv().await {
            Some(OutputEvent::Log(line)) => assert!(line.contains("raw=1")),
            other => panic!("expected log event, got {other:?}"),
        }

        worker.detach(id);
        drop(rx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn loop_exits_when_no_subscriber_attaches() {
        let worker = stub_worker("tok5");
        Arc::clone(&worker).run().await; // grace expires with nobody attached
        assert_eq!(worker.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_emit_truncated_error_events() {
        struct FailingSource;
        #[async_trait]
        impl SnapshotSource for FailingSource {
            async fn fetch(&self, _url: &str) -> Result<Vec<u8>, PollError> {
                Err(PollError::Fetch("x".repeat(500)))
            }
        }

        let worker = Arc::new(Worker::new(
            "tok6",
            "http://camera.local/snapshot.jpg",
            1,
            Arc::new(FailingSource),
            Arc::new(StubAnalyzer {
                raw_count: 0,
                confidence: 0.0,
            }),
            settings(),
        ));
        let (tx, mut rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = worker.attach(tx);

        let handle = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run().await }
        });

        match rx.recv().await {
            Some(OutputEvent::Error(msg)) => assert_eq!(msg.chars().count(), ERROR_TRUNCATE),
            other => panic!("expected error event, got {other:?}"),
        }

        worker.detach(id);
        drop(rx);
        handle.await.unwrap();
    }
}
