//! llama.cpp backend
//!
//! Implements the engine boundary on top of llama-cpp-2. These types wrap raw
//! pointers and are not `Send`, so everything except [`LlamaCppBackend`]
//! itself is created and dropped on the inference worker thread.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::OnceLock;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;

use crate::inference::backend::{
    ContextParams, EngineBackend, EngineContext, EngineModel, ModelParams, ModelStats,
    TokenBatch, TokenId, Vocabulary,
};
use crate::inference::engine::EngineError;

/// llama.cpp can only be initialized once per process
static LLAMA_BACKEND: OnceLock<Result<LlamaBackend, String>> = OnceLock::new();

fn shared_backend() -> Result<&'static LlamaBackend, EngineError> {
    let result = LLAMA_BACKEND.get_or_init(|| {
        let mut backend = LlamaBackend::init().map_err(|e| e.to_string())?;
        backend.void_logs();
        tracing::info!("llama.cpp backend initialized");
        Ok(backend)
    });
    match result {
        Ok(backend) => Ok(backend),
        Err(e) => Err(EngineError::BackendInit(e.clone())),
    }
}

/// Production backend backed by llama.cpp
pub struct LlamaCppBackend {
    backend: &'static LlamaBackend,
}

impl LlamaCppBackend {
    pub fn init() -> Result<Self, EngineError> {
        Ok(Self {
            backend: shared_backend()?,
        })
    }
}

impl EngineBackend for LlamaCppBackend {
    type Model = LlamaCppModel;

    fn load_model(
        &mut self,
        path: &Path,
        params: &ModelParams,
    ) -> Result<Self::Model, EngineError> {
        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layers);
        let model = LlamaModel::load_from_file(self.backend, path, &model_params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        Ok(LlamaCppModel {
            backend: self.backend,
            model,
        })
    }
}

/// Loaded llama.cpp weights
pub struct LlamaCppModel {
    backend: &'static LlamaBackend,
    model: LlamaModel,
}

impl EngineModel for LlamaCppModel {
    type Context<'m> = LlamaCppContext<'m>;

    fn vocabulary(&self) -> Result<Vocabulary, EngineError> {
        let n_vocab = self.model.n_vocab();
        if n_vocab <= 0 {
            return Err(EngineError::Vocabulary(format!(
                "model reports {n_vocab} vocabulary entries"
            )));
        }
        Ok(Vocabulary {
            eos: self.model.token_eos().0,
            n_vocab: n_vocab as usize,
        })
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, EngineError> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        // Plaintext: control tokens render as nothing
        self.model
            .token_to_bytes(LlamaToken(token), Special::Plaintext)
            .map_err(|e| EngineError::Detokenization(e.to_string()))
    }

    fn new_context(&self, params: &ContextParams) -> Result<Self::Context<'_>, EngineError> {
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(params.n_ctx))
            .with_n_batch(params.n_batch)
            .with_n_threads(params.n_threads)
            .with_n_threads_batch(params.n_threads);

        let ctx = self
            .model
            .new_context(self.backend, ctx_params)
            .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

        tracing::debug!(
            "Created llama context (n_ctx={}, threads={})",
            params.n_ctx,
            params.n_threads
        );

        Ok(LlamaCppContext {
            ctx,
            logits_index: None,
        })
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn stats(&self) -> ModelStats {
        ModelStats {
            embedding_dim: self.model.n_embd(),
            train_context_length: self.model.n_ctx_train(),
            param_count: self.model.n_params(),
            size_bytes: self.model.size(),
        }
    }
}

/// A llama.cpp context borrowed from its model
pub struct LlamaCppContext<'m> {
    ctx: LlamaContext<'m>,
    /// Batch index whose scores are currently readable
    logits_index: Option<i32>,
}

impl EngineContext for LlamaCppContext<'_> {
    fn decode(&mut self, batch: &TokenBatch) -> Result<(), EngineError> {
        self.logits_index = None;

        let mut llama_batch = LlamaBatch::new(batch.len().max(1), 1);
        for entry in batch.entries() {
            llama_batch
                .add(LlamaToken(entry.token), entry.pos, &[0], entry.logits)
                .map_err(|e| EngineError::Submission(format!("failed to add token: {e}")))?;
        }

        self.ctx
            .decode(&mut llama_batch)
            .map_err(|e| EngineError::Submission(e.to_string()))?;

        self.logits_index = batch.last_logits_index().map(|i| i as i32);
        Ok(())
    }

    fn logits(&self) -> Option<&[f32]> {
        self.logits_index.map(|i| self.ctx.get_logits_ith(i))
    }

    fn clear(&mut self) -> bool {
        self.ctx.clear_kv_cache();
        self.logits_index = None;
        true
    }
}
