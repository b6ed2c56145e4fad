//! Worker dispatch: sessions, the pending job queue, the dispatcher that
//! matches them, and the per-task result channels workers stream into.

pub mod dispatcher;
pub mod heartbeat;
pub mod queue;
pub mod results;
pub mod session;
pub mod types;

pub use dispatcher::{Dispatcher, DEFAULT_MAX_REDELIVERIES};
pub use heartbeat::spawn_heartbeat;
pub use queue::JobQueue;
pub use results::{Inbound, TaskRecord, TaskResultStore, TaskStatus, TaskStream, END_MARKER};
pub use session::{SendFailure, WorkerSession};
pub use types::*;
