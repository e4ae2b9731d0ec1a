//! Generation session
//!
//! One end-to-end generation: prefill the prompt, then decode one token per
//! step until end-of-sequence, cancellation, an engine failure, a full
//! window or the step budget ends it.
//!
//! ```text
//! Idle -> Prefilling -> Decoding -> { Completed | Cancelled | Failed }
//! ```
//!
//! Every terminal path flushes the reassembler and signals the sink's
//! `done` exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::inference::backend::{EngineContext, EngineModel, TokenBatch, TokenId, Vocabulary};
use crate::inference::context::ContextWindow;
use crate::inference::engine::EngineError;
use crate::inference::reassembler::Utf8Reassembler;
use crate::inference::sampler::{SamplerChain, SelectionTier};

/// Step budget for streaming chat
pub const STREAM_MAX_STEPS: usize = 512;

/// Lower bound on the step budget of batch generation
pub const BATCH_MIN_STEPS: usize = 32;

/// Cooperative cancellation flag shared between the host and the decode loop.
///
/// The loop polls it once at the top of every decode step, so a request to
/// stop takes effect after at most one more engine call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Where generated text goes
pub trait OutputSink {
    fn emit(&mut self, text: &str);

    fn done(&mut self, _summary: &SessionSummary) {}

    /// A closed sink stops generation like a cancellation
    fn is_closed(&self) -> bool {
        false
    }
}

/// Batch mode accumulates into a string
impl OutputSink for String {
    fn emit(&mut self, text: &str) {
        self.push_str(text);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Prefilling,
    Decoding,
    Completed,
    Cancelled,
    Failed,
}

/// Terminal classification of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Cancelled,
    Failed,
}

/// Why a request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndOfSequence,
    StepBudget,
    /// Every slot of the window is in use
    ContextFull,
    Cancelled,
    /// The output side went away before the session ended
    Disconnected,
    PrefillRejected,
    DecodeRejected,
    NoScores,
    SamplerExhausted,
    ContextUnavailable,
    EmptyPrompt,
    NotInitialized,
}

impl FinishReason {
    pub fn outcome(self) -> Outcome {
        match self {
            FinishReason::EndOfSequence | FinishReason::StepBudget | FinishReason::ContextFull => {
                Outcome::Completed
            }
            FinishReason::Cancelled | FinishReason::Disconnected => Outcome::Cancelled,
            _ => Outcome::Failed,
        }
    }
}

impl From<Outcome> for SessionState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Completed => SessionState::Completed,
            Outcome::Cancelled => SessionState::Cancelled,
            Outcome::Failed => SessionState::Failed,
        }
    }
}

/// Report produced by every request, including rejected ones
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub request_id: Uuid,
    pub outcome: Outcome,
    pub finish: FinishReason,
    /// Tokens actually submitted during prefill
    pub prompt_tokens: usize,
    /// Tokens selected and fed back, excluding end-of-sequence
    pub generated_tokens: usize,
    /// Whether the prompt lost its oldest tokens to fit the window
    pub truncated: bool,
}

impl SessionSummary {
    /// Summary of a request that ended before producing anything
    pub fn immediate(request_id: Uuid, finish: FinishReason) -> Self {
        Self {
            request_id,
            outcome: finish.outcome(),
            finish,
            prompt_tokens: 0,
            generated_tokens: 0,
            truncated: false,
        }
    }
}

/// A single generation over a borrowed context window
pub struct GenerationSession<'s, 'm, M: EngineModel + 'm> {
    window: &'s mut ContextWindow<'m, M>,
    vocab: Vocabulary,
    sampler: SamplerChain,
    cancel: &'s CancelToken,
    reassembler: Utf8Reassembler,
    state: SessionState,
    summary: SessionSummary,
}

impl<'s, 'm, M: EngineModel + 'm> GenerationSession<'s, 'm, M> {
    pub fn new(
        window: &'s mut ContextWindow<'m, M>,
        vocab: Vocabulary,
        sampler: SamplerChain,
        cancel: &'s CancelToken,
        request_id: Uuid,
    ) -> Self {
        Self {
            window,
            vocab,
            sampler,
            cancel,
            reassembler: Utf8Reassembler::new(),
            state: SessionState::Idle,
            summary: SessionSummary::immediate(request_id, FinishReason::EmptyPrompt),
        }
    }

    /// Runs the session to a terminal state.
    pub fn run(
        mut self,
        prompt: &str,
        max_steps: usize,
        sink: &mut dyn OutputSink,
    ) -> SessionSummary {
        let finish = match self.prefill(prompt) {
            Ok(()) => self.decode(max_steps, sink),
            Err(finish) => finish,
        };
        self.finish(finish, sink)
    }

    fn transition(&mut self, next: SessionState) {
        tracing::trace!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn prefill(&mut self, prompt: &str) -> Result<(), FinishReason> {
        self.transition(SessionState::Prefilling);

        // Never let a new request see the previous one's history
        if let Err(e) = self.window.reset() {
            tracing::warn!("Context reset failed: {}", e);
            return Err(FinishReason::ContextUnavailable);
        }

        let tokens = match self.window.model().tokenize(prompt, true) {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!("Tokenization failed: {}", e);
                Vec::new()
            }
        };
        let fitted = self.window.fit_to_capacity(&tokens);
        if fitted.is_empty() {
            return Err(FinishReason::EmptyPrompt);
        }
        if fitted.len() < tokens.len() {
            tracing::info!(
                "Prompt truncated from {} to {} tokens",
                tokens.len(),
                fitted.len()
            );
            self.summary.truncated = true;
        }

        if !self.window.is_available() {
            return Err(FinishReason::ContextUnavailable);
        }
        if let Err(e) = self.window.submit(&TokenBatch::prompt(fitted)) {
            tracing::warn!("Prefill rejected: {}", e);
            return Err(FinishReason::PrefillRejected);
        }

        self.summary.prompt_tokens = fitted.len();
        tracing::debug!("Prefilled {} tokens", fitted.len());
        Ok(())
    }

    fn decode(&mut self, max_steps: usize, sink: &mut dyn OutputSink) -> FinishReason {
        self.transition(SessionState::Decoding);

        for _ in 0..max_steps {
            if self.cancel.is_cancelled() {
                tracing::debug!("Generation stopped by user");
                return FinishReason::Cancelled;
            }
            if sink.is_closed() {
                return FinishReason::Disconnected;
            }
            if self.window.remaining() == 0 {
                tracing::debug!("Context window full after {} tokens", self.window.absorbed());
                return FinishReason::ContextFull;
            }

            let Some(context) = self.window.context_mut() else {
                return FinishReason::ContextUnavailable;
            };
            let Some(scores) = context.logits() else {
                return FinishReason::NoScores;
            };
            let Some(selection) = self.sampler.select_with_fallback(scores) else {
                tracing::warn!("No selectable token in score vector");
                return FinishReason::SamplerExhausted;
            };
            if selection.tier != SelectionTier::Chain {
                tracing::debug!("Sampler chain yielded nothing, fell back to {:?}", selection.tier);
            }

            let token = selection.token;
            if token == self.vocab.eos || self.window.model().is_end_of_generation(token) {
                tracing::debug!("End of generation token encountered");
                return FinishReason::EndOfSequence;
            }

            match self.window.model().token_to_bytes(token) {
                Ok(bytes) => {
                    if let Some(text) = self.reassembler.push(&bytes) {
                        sink.emit(&text);
                    }
                }
                Err(e) => tracing::warn!("Token {} has no text piece: {}", token, e),
            }
            self.summary.generated_tokens += 1;

            if let Err(e) = self.feed_back(token) {
                tracing::warn!("Decode rejected at position {}: {}", self.window.absorbed(), e);
                return FinishReason::DecodeRejected;
            }
        }

        FinishReason::StepBudget
    }

    fn feed_back(&mut self, token: TokenId) -> Result<(), EngineError> {
        let position = i32::try_from(self.window.absorbed()).unwrap_or(i32::MAX);
        self.window.submit(&TokenBatch::single(token, position))
    }

    fn finish(mut self, finish: FinishReason, sink: &mut dyn OutputSink) -> SessionSummary {
        if let Some(text) = self.reassembler.flush() {
            sink.emit(&text);
        }

        self.summary.finish = finish;
        self.summary.outcome = finish.outcome();
        let terminal = SessionState::from(self.summary.outcome);
        self.transition(terminal);

        tracing::info!(
            "Generation finished: {:?} ({:?}), {} prompt + {} generated tokens",
            self.summary.outcome,
            finish,
            self.summary.prompt_tokens,
            self.summary.generated_tokens
        );

        sink.done(&self.summary);
        self.summary
    }
}
