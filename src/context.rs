use crate::detector::{OnnxAnalyzer, YoloDetector};
use crate::fetch::HttpSnapshotSource;
use crate::manager::Manager;
use crate::store::SubscriptionStore;
use crate::types::Config;
use crate::worker::WorkerSettings;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// Everything the request handlers and worker loops share. Built once in
/// main and passed around explicitly; there is no process-wide state.
pub struct AppContext {
    pub config: Config,
    pub store: SubscriptionStore,
    pub manager: Arc<Manager>,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let store = SubscriptionStore::open(&config.store.path)?;
        let detector = YoloDetector::new(&config.model, &config.detection)?;
        let analyzer = Arc::new(OnnxAnalyzer::new(detector));
        let source = Arc::new(HttpSnapshotSource::new(Duration::from_secs(
            config.fetch.timeout_sec,
        ))?);
        let manager = Manager::new(source, analyzer, WorkerSettings::from_config(&config));
        Ok(Arc::new(Self {
            config,
            store,
            manager,
        }))
    }

    /// Construction with injected collaborators, for tests that must not
    /// touch the network or a model file.
    #[cfg(test)]
    pub(crate) fn with_parts(
        config: Config,
        store: SubscriptionStore,
        source: Arc<dyn crate::worker::SnapshotSource>,
        analyzer: Arc<dyn crate::worker::FrameAnalyzer>,
    ) -> Arc<Self> {
        let manager = Manager::new(source, analyzer, WorkerSettings::from_config(&config));
        Arc::new(Self {
            config,
            store,
            manager,
        })
    }
}
