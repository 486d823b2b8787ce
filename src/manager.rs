// Single source of truth mapping subscription token -> live worker. The
// table mutex is the only structural critical section; loop bodies run
// unsynchronized with respect to each other.

use crate::worker::{FrameAnalyzer, OutputEvent, SnapshotSource, Worker, WorkerSettings};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

pub struct Manager {
    workers: Mutex<HashMap<String, Arc<Worker>>>,
    source: Arc<dyn SnapshotSource>,
    analyzer: Arc<dyn FrameAnalyzer>,
    settings: WorkerSettings,
}

impl Manager {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        analyzer: Arc<dyn FrameAnalyzer>,
        settings: WorkerSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            workers: Mutex::new(HashMap::new()),
            source,
            analyzer,
            settings,
        })
    }

    /// Look up or create the worker for `token`, refresh its interval, and
    /// start its loop if it is not already running. The whole operation
    /// happens under the table lock, so concurrent calls for the same token
    /// yield the same worker and exactly one running loop.
    pub async fn ensure(self: &Arc<Self>, token: &str, url: &str, interval_sec: u64) -> Arc<Worker> {
        let mut table = self.workers.lock().await;
        let worker = self.ensure_locked(&mut table, token, url, interval_sec);
        if worker.begin_run() {
            self.spawn_loop(Arc::clone(&worker));
        }
        worker
    }

    /// [`ensure`](Self::ensure) plus attaching a subscriber channel inside
    /// the same critical section. A retiring loop takes the table lock for
    /// its final liveness check, so an attach done under that lock can
    /// never slip in after the check and land on a removed worker.
    pub async fn ensure_attached(
        self: &Arc<Self>,
        token: &str,
        url: &str,
        interval_sec: u64,
        tx: mpsc::Sender<OutputEvent>,
    ) -> (Arc<Worker>, u64) {
        let mut table = self.workers.lock().await;
        let worker = self.ensure_locked(&mut table, token, url, interval_sec);
        let id = worker.attach(tx);
        if worker.begin_run() {
            self.spawn_loop(Arc::clone(&worker));
        }
        (worker, id)
    }

    fn ensure_locked(
        self: &Arc<Self>,
        table: &mut HashMap<String, Arc<Worker>>,
        token: &str,
        url: &str,
        interval_sec: u64,
    ) -> Arc<Worker> {
        let worker = table
            .entry(token.to_string())
            .or_insert_with(|| {
                debug!(token, "creating worker");
                Arc::new(Worker::new(
                    token,
                    url,
                    interval_sec,
                    Arc::clone(&self.source),
                    Arc::clone(&self.analyzer),
                    self.settings.clone(),
                ))
            })
            .clone();
        worker.set_interval(interval_sec);
        worker
    }

    /// Revoke the live worker for `token`, if any. Does not remove the
    /// table entry; the loop retires itself once its subscriber set drains.
    pub async fn revoke(&self, token: &str) -> bool {
        let worker = self.workers.lock().await.get(token).cloned();
        match worker {
            Some(worker) => {
                worker.revoke();
                true
            }
            None => {
                debug!(token, "revoke for unknown token");
                false
            }
        }
    }

    pub async fn live_workers(&self) -> usize {
        self.workers.lock().await.len()
    }

    fn spawn_loop(self: &Arc<Self>, worker: Arc<Worker>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                Arc::clone(&worker).run().await;
                let mut table = manager.workers.lock().await;
                // A subscriber may have attached between the loop's last
                // liveness check and this point; keep serving it.
                if worker.subscriber_count() > 0 {
                    drop(table);
                    continue;
                }
                worker.end_run();
                let still_ours = table
                    .get(worker.token())
                    .is_some_and(|current| Arc::ptr_eq(current, &worker));
                if still_ours {
                    table.remove(worker.token());
                    info!(token = %worker.token(), "worker retired");
                }
                break;
            }
        });
    }
}
