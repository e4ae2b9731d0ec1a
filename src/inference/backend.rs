//! Inference engine boundary
//!
//! The session engine never touches tensors directly. It talks to the numeric
//! engine through three traits: a backend that loads models, a model that
//! owns the vocabulary and hands out contexts, and a context that absorbs
//! token batches and exposes the latest score vector.
//!
//! A context borrows its model, so the borrow checker guarantees that a
//! context is always released before the model it was created from.

use std::path::Path;

use crate::inference::engine::EngineError;

/// Vocabulary id as understood by the engine
pub type TokenId = i32;

/// Read-only vocabulary facts derived from a loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vocabulary {
    /// Designated end-of-sequence token
    pub eos: TokenId,
    /// Number of entries in the score vector
    pub n_vocab: usize,
}

/// Static information reported by a loaded model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelStats {
    pub embedding_dim: i32,
    pub train_context_length: u32,
    pub param_count: u64,
    pub size_bytes: u64,
}

/// Parameters used when loading model weights
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelParams {
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
}

/// Construction parameters for a context window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    /// Token capacity of the window
    pub n_ctx: u32,
    /// Largest batch the engine accepts in one submission
    pub n_batch: u32,
    /// Threads used for internal engine parallelism
    pub n_threads: i32,
}

impl ContextParams {
    /// Parameters for a window of `n_ctx` tokens. The batch size matches the
    /// capacity so a whole prompt can be prefilled in a single submission.
    pub fn new(n_ctx: u32, n_threads: i32) -> Self {
        Self {
            n_ctx,
            n_batch: n_ctx,
            n_threads,
        }
    }
}

/// One token of a batch submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    /// Absolute position in the context window
    pub pos: i32,
    /// Whether the engine should compute scores for this position
    pub logits: bool,
}

/// Tokens submitted to the engine in one call (single sequence)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenBatch {
    entries: Vec<BatchEntry>,
}

impl TokenBatch {
    /// Prefill batch: positions `0..len`, scores requested for the final
    /// position only.
    pub fn prompt(tokens: &[TokenId]) -> Self {
        let last = tokens.len().saturating_sub(1);
        let entries = tokens
            .iter()
            .enumerate()
            .map(|(i, &token)| BatchEntry {
                token,
                pos: i as i32,
                logits: i == last,
            })
            .collect();
        Self { entries }
    }

    /// Decode-step batch: one token at `pos`, scores requested.
    pub fn single(token: TokenId, pos: i32) -> Self {
        Self {
            entries: vec![BatchEntry {
                token,
                pos,
                logits: true,
            }],
        }
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry that requested scores
    pub fn last_logits_index(&self) -> Option<usize> {
        self.entries.iter().rposition(|e| e.logits)
    }
}

/// Loads models. Moved onto the inference worker thread at startup.
pub trait EngineBackend: Send + 'static {
    type Model: EngineModel;

    fn load_model(&mut self, path: &Path, params: &ModelParams)
        -> Result<Self::Model, EngineError>;
}

/// Loaded weights plus vocabulary primitives
pub trait EngineModel {
    type Context<'m>: EngineContext
    where
        Self: 'm;

    /// Derives the vocabulary; fails when the model carries none.
    fn vocabulary(&self) -> Result<Vocabulary, EngineError>;

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, EngineError>;

    /// Raw bytes of a token's text piece. May be a partial character.
    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError>;

    fn new_context(&self, params: &ContextParams) -> Result<Self::Context<'_>, EngineError>;

    /// End-of-turn markers other than the designated end-of-sequence token
    fn is_end_of_generation(&self, _token: TokenId) -> bool {
        false
    }

    fn stats(&self) -> ModelStats {
        ModelStats::default()
    }
}

/// Engine-side mutable state: the decode context and its KV cache
pub trait EngineContext {
    /// Absorbs a batch. On error nothing about the batch may be relied upon.
    fn decode(&mut self, batch: &TokenBatch) -> Result<(), EngineError>;

    /// Scores for the last position of the most recent batch that requested them
    fn logits(&self) -> Option<&[f32]>;

    /// Clears the KV cache in place. Returns `false` when the engine has no
    /// such primitive and the context must be rebuilt instead.
    fn clear(&mut self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_batch_requests_last_logits_only() {
        let batch = TokenBatch::prompt(&[5, 6, 7]);
        let flags: Vec<bool> = batch.entries().iter().map(|e| e.logits).collect();
        let positions: Vec<i32> = batch.entries().iter().map(|e| e.pos).collect();

        assert_eq!(flags, vec![false, false, true]);
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(batch.last_logits_index(), Some(2));
    }

    #[test]
    fn test_single_batch() {
        let batch = TokenBatch::single(42, 17);
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch.entries()[0],
            BatchEntry {
                token: 42,
                pos: 17,
                logits: true
            }
        );
    }

    #[test]
    fn test_empty_prompt_batch() {
        let batch = TokenBatch::prompt(&[]);
        assert!(batch.is_empty());
        assert_eq!(batch.last_logits_index(), None);
    }
}
