//! Shared application state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use tabrelay_core::{BridgeConfig, DataPaths, ModelRegistry};
use tabrelay_dispatch::{Dispatcher, TaskResultStore};

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub paths: DataPaths,
    pub config: RwLock<BridgeConfig>,
    pub models: RwLock<ModelRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub tasks: TaskResultStore,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(paths: DataPaths) -> Self {
        let config = BridgeConfig::load(&paths.config_file).with_env_overrides();
        let models = ModelRegistry::load(&paths.models_file, &config.default_model_id);
        let tasks = TaskResultStore::new();
        let dispatcher = Arc::new(
            Dispatcher::new(config.outbound_capacity)
                .with_results(tasks.clone(), config.max_redeliveries),
        );

        info!(
            models = models.len(),
            port = config.port,
            "AppState initialized from {}",
            paths.root.display()
        );

        Self {
            config: RwLock::new(config),
            models: RwLock::new(models),
            dispatcher,
            tasks,
            started_at: Utc::now(),
            paths,
        }
    }

    /// Current config snapshot.
    pub fn config(&self) -> BridgeConfig {
        self.config.read().clone()
    }

    /// Re-read `config.jsonc`, keeping the previous value when it cannot be loaded.
    pub fn reload_config(&self) -> BridgeConfig {
        match BridgeConfig::try_load(&self.paths.config_file) {
            Ok(fresh) => {
                let mut fresh = fresh.with_env_overrides();
                let mut current = self.config.write();
                // The listener is already bound.
                fresh.port = current.port;
                self.models.write().set_default_id(&fresh.default_model_id);
                *current = fresh.clone();
                fresh
            }
            Err(e) => {
                debug!("Config reload skipped: {}", e);
                self.config.read().clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_picks_up_flags() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path()).unwrap();
        let state = AppState::new(paths.clone());
        assert!(!state.config().tavern_mode_enabled);

        std::fs::write(&paths.config_file, r#"{"tavern_mode_enabled": true}"#).unwrap();
        assert!(state.reload_config().tavern_mode_enabled);

        std::fs::write(&paths.config_file, "{ broken").unwrap();
        assert!(state.reload_config().tavern_mode_enabled);
    }
}
