//! Chat bridge: OpenAI wire types, request-to-job adaptation and the decoder
//! that turns a worker's raw reply stream into chat deltas.

pub mod adapter;
pub mod decoder;
pub mod driver;
pub mod types;

pub use adapter::{map_finish_reason, AdapterOptions, MessageTemplate, RequestAdapter, ResponseFrames};
pub use decoder::{DecodeEvent, DecodeFailure, StreamDecoder, StreamEnd};
pub use driver::{decode_stream, DriverTimeouts, EventStream};
pub use types::*;
