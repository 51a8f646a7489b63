//! Bridge between a host application and an on-device LLM inference engine.
//!
//! The engine itself is external. This crate keeps the handle table, routes
//! streamed chunks back to the generation call that produced them and runs
//! the memory admission heuristic.

pub mod backend;
pub mod bridge;
pub mod config;
pub mod correlator;
pub mod errors;
pub mod events;
pub mod memory;
pub mod model_files;
pub mod registry;

pub use llm_bridge_models::{
    BridgeEvent, EventKind, EventPayload, FinalResponse, Handle, RequestId,
    ERROR_RESPONSE_EVENT, FINAL_RESPONSE_EVENT, PARTIAL_RESPONSE_EVENT,
};

pub use bridge::{LlmBridge, ModelSource, SamplingSettings};
pub use correlator::{PendingResponse, StreamSignal};
pub use errors::{BridgeError, CreationReason};
pub use events::{ChannelEmitter, EventEmitter, NullEmitter};
