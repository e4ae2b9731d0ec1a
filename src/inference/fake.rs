//! Scripted in-memory engine used by unit tests.
//!
//! Token ids `1..=256` are single bytes (`id - 1`), id 0 is end-of-sequence.
//! After every decode the context predicts the next token of a fixed script
//! and falls back to end-of-sequence once the script is exhausted. Every
//! handle is counted so tests can check for leaks and release order.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::NamedTempFile;

use crate::inference::backend::{
    ContextParams, EngineBackend, EngineContext, EngineModel, ModelParams, TokenBatch, TokenId,
    Vocabulary,
};
use crate::inference::engine::EngineError;
use crate::inference::model::GGUF_MAGIC;

pub const FAKE_EOS: TokenId = 0;
pub const FAKE_N_VOCAB: usize = 258;

/// Beats a scripted token (10.0) only once that token has been penalized
/// by more than 10/9
pub const RIVAL_SCORE: f32 = 9.0;

/// Converts text into the fake vocabulary
pub fn byte_tokens(text: &str) -> Vec<TokenId> {
    text.bytes().map(|b| b as TokenId + 1).collect()
}

#[derive(Debug, Default)]
pub struct Counters {
    pub models_live: AtomicUsize,
    pub contexts_live: AtomicUsize,
    pub models_loaded: AtomicUsize,
    pub contexts_created: AtomicUsize,
    pub clears: AtomicUsize,
    pub decodes: AtomicUsize,
    /// Most tokens any context held at once
    pub peak_absorbed: AtomicUsize,
    events: Mutex<Vec<&'static str>>,
}

impl Counters {
    fn record(&self, event: &'static str) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone)]
pub struct FakeOptions {
    /// Tokens the model "wants" to produce, in order
    pub script: Vec<TokenId>,
    pub supports_clear: bool,
    pub fail_load: bool,
    pub fail_vocab: bool,
    pub fail_context: bool,
    /// Reject the n-th decode call of a context (0 = prefill)
    pub fail_decode_at: Option<usize>,
    /// Report no scores at all
    pub no_logits: bool,
    pub decode_delay: Option<Duration>,
    /// Extra token that ends generation like end-of-sequence
    pub end_of_turn: Option<TokenId>,
    /// Slots the engine really allocates, like llama.cpp padding `n_ctx`
    pub engine_capacity: Option<usize>,
    /// Runner-up candidate scored just below every scripted token
    pub rival: Option<TokenId>,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            script: Vec::new(),
            supports_clear: true,
            fail_load: false,
            fail_vocab: false,
            fail_context: false,
            fail_decode_at: None,
            no_logits: false,
            decode_delay: None,
            end_of_turn: None,
            engine_capacity: None,
            rival: None,
        }
    }
}

impl FakeOptions {
    pub fn replying(text: &str) -> Self {
        Self {
            script: byte_tokens(text),
            ..Self::default()
        }
    }
}

pub struct FakeBackend {
    options: FakeOptions,
    counters: Arc<Counters>,
}

impl FakeBackend {
    pub fn new(options: FakeOptions) -> Self {
        Self {
            options,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }
}

impl EngineBackend for FakeBackend {
    type Model = FakeModel;

    fn load_model(
        &mut self,
        _path: &Path,
        _params: &ModelParams,
    ) -> Result<Self::Model, EngineError> {
        if self.options.fail_load {
            return Err(EngineError::ModelLoad("scripted load failure".to_string()));
        }
        self.counters.models_live.fetch_add(1, Ordering::SeqCst);
        self.counters.models_loaded.fetch_add(1, Ordering::SeqCst);
        self.counters.record("model+");
        Ok(FakeModel {
            options: self.options.clone(),
            counters: self.counters.clone(),
        })
    }
}

pub struct FakeModel {
    options: FakeOptions,
    counters: Arc<Counters>,
}

impl Drop for FakeModel {
    fn drop(&mut self) {
        self.counters.models_live.fetch_sub(1, Ordering::SeqCst);
        self.counters.record("model-");
    }
}

impl EngineModel for FakeModel {
    type Context<'m> = FakeContext<'m>;

    fn vocabulary(&self) -> Result<Vocabulary, EngineError> {
        if self.options.fail_vocab {
            return Err(EngineError::Vocabulary("scripted vocab failure".to_string()));
        }
        Ok(Vocabulary {
            eos: FAKE_EOS,
            n_vocab: FAKE_N_VOCAB,
        })
    }

    fn tokenize(&self, text: &str, _add_bos: bool) -> Result<Vec<TokenId>, EngineError> {
        Ok(byte_tokens(text))
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        match token {
            1..=256 => Ok(vec![(token - 1) as u8]),
            _ => Ok(Vec::new()),
        }
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.options.end_of_turn == Some(token)
    }

    fn new_context(&self, params: &ContextParams) -> Result<Self::Context<'_>, EngineError> {
        if self.options.fail_context {
            return Err(EngineError::ContextCreate("scripted context failure".to_string()));
        }
        self.counters.contexts_live.fetch_add(1, Ordering::SeqCst);
        self.counters.contexts_created.fetch_add(1, Ordering::SeqCst);
        self.counters.record("ctx+");
        Ok(FakeContext {
            model: self,
            capacity: self
                .options
                .engine_capacity
                .unwrap_or(params.n_ctx as usize),
            absorbed: 0,
            decodes: 0,
            scores: None,
        })
    }
}

pub struct FakeContext<'m> {
    model: &'m FakeModel,
    capacity: usize,
    absorbed: usize,
    decodes: usize,
    scores: Option<Vec<f32>>,
}

impl Drop for FakeContext<'_> {
    fn drop(&mut self) {
        self.model.counters.contexts_live.fetch_sub(1, Ordering::SeqCst);
        self.model.counters.record("ctx-");
    }
}

impl EngineContext for FakeContext<'_> {
    fn decode(&mut self, batch: &TokenBatch) -> Result<(), EngineError> {
        let options = &self.model.options;
        self.model.counters.decodes.fetch_add(1, Ordering::SeqCst);
        self.scores = None;

        if let Some(delay) = options.decode_delay {
            thread::sleep(delay);
        }
        if options.fail_decode_at == Some(self.decodes) {
            return Err(EngineError::Submission("scripted decode failure".to_string()));
        }
        for entry in batch.entries() {
            if entry.pos as usize != self.absorbed {
                return Err(EngineError::Submission(format!(
                    "position {} submitted, expected {}",
                    entry.pos, self.absorbed
                )));
            }
            if self.absorbed >= self.capacity {
                return Err(EngineError::Submission("context full".to_string()));
            }
            self.absorbed += 1;
        }
        self.model
            .counters
            .peak_absorbed
            .fetch_max(self.absorbed, Ordering::SeqCst);

        let predicted = options.script.get(self.decodes).copied().unwrap_or(FAKE_EOS);
        self.decodes += 1;

        if !options.no_logits && batch.last_logits_index().is_some() {
            let mut scores = vec![0.0; FAKE_N_VOCAB];
            if let Some(rival) = options.rival {
                scores[rival as usize] = RIVAL_SCORE;
            }
            scores[predicted as usize] = 10.0;
            self.scores = Some(scores);
        }
        Ok(())
    }

    fn logits(&self) -> Option<&[f32]> {
        self.scores.as_deref()
    }

    fn clear(&mut self) -> bool {
        if !self.model.options.supports_clear {
            return false;
        }
        self.model.counters.clears.fetch_add(1, Ordering::SeqCst);
        self.absorbed = 0;
        self.decodes = 0;
        self.scores = None;
        true
    }
}

/// A file with a valid GGUF v3 header
pub fn gguf_fixture() -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
    file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
    file.write_all(&3u32.to_le_bytes()).unwrap();
    file.write_all(&1u64.to_le_bytes()).unwrap();
    file.write_all(&1u64.to_le_bytes()).unwrap();
    file.flush().unwrap();
    file
}
