//! LLM inference engine
//!
//! Model lifecycle, the prefill/decode loop, sampling and text streaming.

pub mod backend;
pub mod context;
pub mod engine;
pub mod llama;
pub mod model;
pub mod reassembler;
pub mod sampler;
pub mod session;
pub mod streaming;

#[cfg(test)]
mod fake;

// Re-export main types for convenience
pub use backend::{EngineBackend, EngineContext, EngineModel, TokenBatch, TokenId, Vocabulary};
pub use context::{ContextWindow, CONTEXT_RESERVE, DEFAULT_CONTEXT_CAPACITY};
pub use engine::{BatchOutput, EngineError, InitOptions, LlmEngine, LoadedModelInfo};
pub use model::{is_gguf_file, validate_gguf, GgufHeader, ModelError, GGUF_MAGIC};
pub use reassembler::Utf8Reassembler;
pub use sampler::{SamplerChain, SamplingConfig, SamplingUpdate};
pub use session::{CancelToken, FinishReason, Outcome, SessionSummary};
pub use streaming::{pump, StreamToken, TokenListener, TransportEncoding, TransportText};
