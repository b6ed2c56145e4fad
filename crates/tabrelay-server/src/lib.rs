//! tabrelay server: OpenAI-compatible chat endpoint backed by browser-tab workers.

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::build_router;
pub use state::AppState;
