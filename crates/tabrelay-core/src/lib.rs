//! Shared errors, configuration and the model registry used by every tabrelay crate.

pub mod config;
pub mod error;
pub mod models;

pub use config::{BridgeConfig, DataPaths, DEFAULT_MODEL_ID};
pub use error::{Error, Result};
pub use models::{extract_models_from_html, ModelDiff, ModelRegistry};
