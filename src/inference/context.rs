//! Context window management
//!
//! Owns the engine context for the currently loaded model and keeps prompts
//! within its fixed token capacity.

use crate::inference::backend::{ContextParams, EngineContext, EngineModel, TokenBatch, TokenId};
use crate::inference::engine::EngineError;

/// Tokens kept free at the end of the window for generated output
pub const CONTEXT_RESERVE: usize = 32;

/// Capacity used when the caller passes a non-positive value
pub const DEFAULT_CONTEXT_CAPACITY: u32 = 2048;

/// Normalizes a host-supplied capacity
pub fn effective_capacity(requested: i32) -> u32 {
    if requested > 0 {
        requested as u32
    } else {
        DEFAULT_CONTEXT_CAPACITY
    }
}

/// Keeps only the most recent `capacity - CONTEXT_RESERVE` tokens.
///
/// Recency wins over completeness: on overflow the oldest tokens are dropped.
pub fn fit_to_capacity(tokens: &[TokenId], capacity: usize) -> &[TokenId] {
    let limit = capacity.saturating_sub(CONTEXT_RESERVE);
    if tokens.len() <= limit {
        tokens
    } else {
        &tokens[tokens.len() - limit..]
    }
}

/// How a reset was carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// KV cache cleared in place
    Cleared,
    /// Context torn down and rebuilt from the model
    Rebuilt,
}

/// Bounded engine state for one model.
///
/// The window borrows the model, so it is always dropped first. It counts the
/// tokens absorbed since the last reset and refuses any batch that would take
/// the count past its capacity, whatever the engine itself would accept.
pub struct ContextWindow<'m, M: EngineModel + 'm> {
    model: &'m M,
    params: ContextParams,
    context: Option<M::Context<'m>>,
    absorbed: usize,
}

impl<'m, M: EngineModel + 'm> ContextWindow<'m, M> {
    /// Allocates the engine context up front so allocation failures surface
    /// during initialization rather than on the first request.
    pub fn allocate(model: &'m M, params: ContextParams) -> Result<Self, EngineError> {
        let context = model.new_context(&params)?;
        tracing::debug!("Allocated context window of {} tokens", params.n_ctx);
        Ok(Self {
            model,
            params,
            context: Some(context),
            absorbed: 0,
        })
    }

    pub fn model(&self) -> &'m M {
        self.model
    }

    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    pub fn capacity(&self) -> usize {
        self.params.n_ctx as usize
    }

    /// Largest prompt the window accepts
    pub fn prompt_limit(&self) -> usize {
        self.capacity().saturating_sub(CONTEXT_RESERVE)
    }

    /// Tokens absorbed since the last reset; also the next free position
    pub fn absorbed(&self) -> usize {
        self.absorbed
    }

    pub fn remaining(&self) -> usize {
        self.capacity().saturating_sub(self.absorbed)
    }

    pub fn is_available(&self) -> bool {
        self.context.is_some()
    }

    pub fn fit_to_capacity<'t>(&self, tokens: &'t [TokenId]) -> &'t [TokenId] {
        fit_to_capacity(tokens, self.capacity())
    }

    /// Forgets all absorbed tokens.
    ///
    /// Clears in place when the engine supports it, otherwise rebuilds the
    /// context with the parameters it was created with. If the rebuild fails
    /// the window is left without a context; the next reset tries again.
    pub fn reset(&mut self) -> Result<ResetKind, EngineError> {
        self.absorbed = 0;
        if let Some(context) = self.context.as_mut() {
            if context.clear() {
                return Ok(ResetKind::Cleared);
            }
        }

        // Release the old context before allocating its replacement
        self.context = None;
        self.context = Some(self.model.new_context(&self.params)?);
        tracing::debug!("Context window rebuilt");
        Ok(ResetKind::Rebuilt)
    }

    /// Submits `batch` to the engine and counts its tokens as absorbed.
    pub fn submit(&mut self, batch: &TokenBatch) -> Result<(), EngineError> {
        if batch.len() > self.remaining() {
            return Err(EngineError::WindowFull {
                capacity: self.capacity(),
                absorbed: self.absorbed,
                requested: batch.len(),
            });
        }
        let context = self.context.as_mut().ok_or(EngineError::ContextLost)?;
        context.decode(batch)?;
        self.absorbed += batch.len();
        Ok(())
    }

    pub fn context_mut(&mut self) -> Option<&mut M::Context<'m>> {
        self.context.as_mut()
    }
}
