//! Pocket LLM Library
//!
//! Embedded text generation over a local GGUF model: model lifecycle,
//! prefill/decode sessions, sampling and streamed text delivery.

pub mod inference;
pub mod prompt;
pub mod storage;
pub mod system;

pub use inference::{
    pump, CancelToken, EngineError, FinishReason, InitOptions, LlmEngine, LoadedModelInfo,
    Outcome, SamplingConfig, SamplingUpdate, SessionSummary, StreamToken, TokenListener,
};
pub use prompt::{chat_prompt, essay_prompt, EssayRequest};
