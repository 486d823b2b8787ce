use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::warn;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let mut config: Config =
            serde_yaml::from_str(&contents).context("failed to parse config")?;
        config.validate();
        Ok(config)
    }

    /// Missing config file falls back to built-in defaults; a present but
    /// malformed file is still an error.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            warn!("config file {path} not found, using defaults");
            let mut config = Config::default();
            config.validate();
            Ok(config)
        }
    }

    fn validate(&mut self) {
        if self.stability.window_size == 0 {
            warn!("stability.window_size must be >= 1, clamping to 1");
            self.stability.window_size = 1;
        }
        if self.stability.close_zero_run > self.stability.window_size {
            warn!(
                "stability.close_zero_run {} exceeds window_size {}, clamping",
                self.stability.close_zero_run, self.stability.window_size
            );
            self.stability.close_zero_run = self.stability.window_size;
        }
        if self.stability.close_zero_run == 0 {
            self.stability.close_zero_run = 1;
        }
        if self.detection.fast_open_threshold > self.detection.confidence_threshold {
            warn!(
                "detection.fast_open_threshold {} exceeds confidence_threshold {}, clamping",
                self.detection.fast_open_threshold, self.detection.confidence_threshold
            );
            self.detection.fast_open_threshold = self.detection.confidence_threshold;
        }
    }
}
