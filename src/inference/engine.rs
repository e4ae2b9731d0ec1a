//! Inference engine handle
//!
//! Lifecycle management and request dispatch for the loaded model.
//!
//! # Architecture
//!
//! llama-cpp-2 types (`LlamaModel`, `LlamaContext`) hold raw pointers and are
//! not `Send`, so every engine-owned value lives on one dedicated worker
//! thread. [`LlmEngine`] is a cheap handle that sends commands over a channel.
//!
//! The worker handles commands strictly in arrival order, which makes the
//! command queue the single lock serializing initialization, release,
//! configuration changes and generation. Only [`LlmEngine::request_stop`]
//! bypasses it.
//!
//! While a model is loaded, the model and its context window are locals of
//! the worker's serving scope. The window borrows the model, so it is always
//! destroyed first, and re-initializing leaves that scope (releasing both)
//! before the replacement is loaded.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use uuid::Uuid;

use crate::inference::backend::{ContextParams, EngineBackend, EngineModel, ModelParams, Vocabulary};
use crate::inference::context::{effective_capacity, ContextWindow};
use crate::inference::llama::LlamaCppBackend;
use crate::inference::model::{validate_gguf, ModelError};
use crate::inference::sampler::{SamplerChain, SamplingConfig, SamplingUpdate};
use crate::inference::session::{
    CancelToken, FinishReason, GenerationSession, SessionSummary, BATCH_MIN_STEPS,
    STREAM_MAX_STEPS,
};
use crate::inference::streaming::{ChannelSink, StreamToken};
use crate::prompt::{chat_prompt, essay_prompt, EssayRequest};
use crate::system::resources::inference_threads;

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to derive vocabulary: {0}")]
    Vocabulary(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Detokenization failed: {0}")]
    Detokenization(String),

    #[error("Batch rejected by engine: {0}")]
    Submission(String),

    #[error("Context window full: {requested} more token(s) after {absorbed} of {capacity}")]
    WindowFull {
        capacity: usize,
        absorbed: usize,
        requested: usize,
    },

    #[error("Context window has no engine context")]
    ContextLost,

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Model information after loading
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModelInfo {
    /// Path to the loaded model
    pub path: String,
    /// Vocabulary size
    pub vocab_size: usize,
    /// End-of-sequence token id
    pub eos_token: i32,
    /// Token capacity of the context window
    pub context_capacity: u32,
    /// Threads handed to the engine
    pub n_threads: i32,
    /// Embedding dimension
    pub embedding_dim: i32,
    /// Training context length
    pub context_length: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
}

/// Everything needed to bring a model up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOptions {
    pub model_path: PathBuf,
    /// Requested window size; non-positive selects the default
    pub context_capacity: i32,
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
}

/// Result of a batch generation
#[derive(Debug, Clone)]
pub struct BatchOutput {
    pub text: String,
    pub summary: SessionSummary,
}

impl BatchOutput {
    fn immediate(request_id: Uuid, finish: FinishReason) -> Self {
        Self {
            text: String::new(),
            summary: SessionSummary::immediate(request_id, finish),
        }
    }
}

struct GenerationJob {
    request_id: Uuid,
    prompt: String,
    max_steps: usize,
}

enum JobOutput {
    Stream(Sender<StreamToken>),
    Batch(Sender<BatchOutput>),
}

impl JobOutput {
    /// Answers a job that cannot run
    fn reject(self, request_id: Uuid, finish: FinishReason) {
        match self {
            JobOutput::Stream(tx) => {
                let _ = tx.send(StreamToken::Done(SessionSummary::immediate(request_id, finish)));
            }
            JobOutput::Batch(tx) => {
                let _ = tx.send(BatchOutput::immediate(request_id, finish));
            }
        }
    }
}

enum SamplingChange {
    Update(SamplingUpdate),
    Replace(SamplingConfig),
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Initialize {
        options: InitOptions,
        response_tx: Sender<Result<LoadedModelInfo, EngineError>>,
    },
    Release {
        response_tx: Sender<()>,
    },
    /// `None` reads the current configuration
    Sampling {
        change: Option<SamplingChange>,
        response_tx: Sender<SamplingConfig>,
    },
    Generate {
        job: GenerationJob,
        output: JobOutput,
    },
    Shutdown,
}

type SharedStatus = Arc<Mutex<Option<LoadedModelInfo>>>;

fn lock_status(status: &SharedStatus) -> MutexGuard<'_, Option<LoadedModelInfo>> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the inference worker
///
/// Dropping the handle shuts the worker down and releases the model.
pub struct LlmEngine {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    /// Shared with every session; never goes through the command queue
    stop_signal: CancelToken,
    /// Written by the worker, read by the handle
    status: SharedStatus,
    /// Offload used by [`LlmEngine::initialize`]
    gpu_layers: u32,
}

impl LlmEngine {
    /// Spawns the worker thread around `backend`
    pub fn with_backend<B: EngineBackend>(backend: B) -> Result<Self, EngineError> {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let stop_signal = CancelToken::new();
        let status: SharedStatus = Arc::new(Mutex::new(None));

        let worker_stop = stop_signal.clone();
        let worker_status = status.clone();
        let handle = thread::Builder::new()
            .name("llm-worker".to_string())
            .spawn(move || worker_thread_main(backend, command_rx, worker_stop, worker_status))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        tracing::info!("Inference worker thread started");

        Ok(Self {
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
            stop_signal,
            status,
            gpu_layers: 0,
        })
    }

    /// Engine backed by llama.cpp
    pub fn llama(gpu_layers: u32) -> Result<Self, EngineError> {
        let backend = LlamaCppBackend::init()?;
        let mut engine = Self::with_backend(backend)?;
        engine.gpu_layers = gpu_layers;
        Ok(engine)
    }

    fn send(&self, command: WorkerCommand) -> Result<(), EngineError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| EngineError::WorkerError("worker stopped".to_string()))?;
        command_tx
            .send(command)
            .map_err(|e| EngineError::WorkerError(e.to_string()))
    }

    /// Loads a GGUF model and allocates its context window
    ///
    /// # Arguments
    /// * `path` - Path to the GGUF model file
    /// * `context_capacity` - Window size in tokens (non-positive = 2048)
    pub fn initialize<P: AsRef<Path>>(
        &self,
        path: P,
        context_capacity: i32,
    ) -> Result<LoadedModelInfo, EngineError> {
        self.initialize_with(&InitOptions {
            model_path: path.as_ref().to_path_buf(),
            context_capacity,
            gpu_layers: self.gpu_layers,
        })
    }

    /// Loads a model, replacing any model already loaded.
    ///
    /// On failure the engine is left uninitialized.
    pub fn initialize_with(&self, options: &InitOptions) -> Result<LoadedModelInfo, EngineError> {
        // Validate GGUF file first (on caller thread, just file I/O)
        if let Err(e) = validate_gguf(&options.model_path) {
            tracing::warn!("Rejected model file {:?}: {}", options.model_path, e);
            self.release();
            return Err(e.into());
        }
        tracing::debug!("GGUF validation passed for {:?}", options.model_path);

        let (response_tx, response_rx) = mpsc::channel();
        self.send(WorkerCommand::Initialize {
            options: options.clone(),
            response_tx,
        })?;

        response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))?
    }

    /// Destroys the context window, then the model. Safe to call repeatedly.
    pub fn release(&self) {
        let (response_tx, response_rx) = mpsc::channel();
        if self.send(WorkerCommand::Release { response_tx }).is_ok() {
            let _ = response_rx.recv();
        }
    }

    /// Asks the running generation, if any, to stop. Does not block.
    pub fn request_stop(&self) {
        tracing::debug!("Stop requested");
        self.stop_signal.cancel();
    }

    /// Token the host can keep to request stops from another thread or task
    pub fn stop_handle(&self) -> CancelToken {
        self.stop_signal.clone()
    }

    /// Clamps and stores new sampling parameters for future sessions.
    /// Returns the configuration now in effect.
    pub fn update_sampling_config(
        &self,
        update: &SamplingUpdate,
    ) -> Result<SamplingConfig, EngineError> {
        self.sampling_request(Some(SamplingChange::Update(*update)))
    }

    /// Replaces the whole configuration, seed included
    pub fn set_sampling_config(&self, config: SamplingConfig) -> Result<SamplingConfig, EngineError> {
        self.sampling_request(Some(SamplingChange::Replace(config)))
    }

    pub fn sampling_config(&self) -> Result<SamplingConfig, EngineError> {
        self.sampling_request(None)
    }

    fn sampling_request(
        &self,
        change: Option<SamplingChange>,
    ) -> Result<SamplingConfig, EngineError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.send(WorkerCommand::Sampling {
            change,
            response_tx,
        })?;
        response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))
    }

    /// Returns true if a model and context window are ready
    pub fn is_initialized(&self) -> bool {
        lock_status(&self.status).is_some()
    }

    /// Returns information about the currently loaded model
    pub fn model_info(&self) -> Option<LoadedModelInfo> {
        lock_status(&self.status).clone()
    }

    /// Streams a chat reply to `user_text`.
    ///
    /// The receiver yields zero or more [`StreamToken::Token`] messages
    /// followed by exactly one [`StreamToken::Done`].
    pub fn generate_stream(&self, user_text: &str) -> Receiver<StreamToken> {
        let (token_tx, token_rx) = mpsc::channel();
        let job = GenerationJob {
            request_id: Uuid::new_v4(),
            prompt: chat_prompt(user_text),
            max_steps: STREAM_MAX_STEPS,
        };
        let request_id = job.request_id;
        tracing::debug!("Queued streaming request {}", request_id);

        if let Err(e) = self.send(WorkerCommand::Generate {
            job,
            output: JobOutput::Stream(token_tx.clone()),
        }) {
            tracing::warn!("Could not queue request {}: {}", request_id, e);
            JobOutput::Stream(token_tx).reject(request_id, FinishReason::NotInitialized);
        }
        token_rx
    }

    /// Generates up to `max(32, max_new_tokens)` tokens and returns the text.
    /// Returns an empty string when the engine is not ready.
    pub fn generate_batch(&self, prompt: &str, max_new_tokens: usize) -> String {
        self.generate_batch_with_summary(prompt, max_new_tokens).text
    }

    pub fn generate_batch_with_summary(&self, prompt: &str, max_new_tokens: usize) -> BatchOutput {
        let (output_tx, output_rx) = mpsc::channel();
        let request_id = Uuid::new_v4();
        let job = GenerationJob {
            request_id,
            prompt: prompt.to_string(),
            max_steps: max_new_tokens.max(BATCH_MIN_STEPS),
        };
        tracing::debug!("Queued batch request {}", request_id);

        let sent = self.send(WorkerCommand::Generate {
            job,
            output: JobOutput::Batch(output_tx),
        });
        match sent.and_then(|()| {
            output_rx
                .recv()
                .map_err(|e| EngineError::WorkerError(e.to_string()))
        }) {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("Batch request {} failed: {}", request_id, e);
                BatchOutput::immediate(request_id, FinishReason::NotInitialized)
            }
        }
    }

    /// Writes an essay for language learners
    pub fn generate_essay(&self, request: &EssayRequest) -> String {
        self.generate_batch(&essay_prompt(request), request.token_budget())
    }
}

impl Drop for LlmEngine {
    fn drop(&mut self) {
        // A running generation must notice the shutdown too
        self.stop_signal.cancel();
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        // Wait for worker thread to finish
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

fn apply_sampling_change(
    sampling: &mut SamplingConfig,
    change: Option<SamplingChange>,
    response_tx: Sender<SamplingConfig>,
) {
    match change {
        Some(SamplingChange::Update(update)) => {
            sampling.apply(&update);
            tracing::info!("Sampling config updated: {:?}", sampling);
        }
        Some(SamplingChange::Replace(mut config)) => {
            config.validate();
            *sampling = config;
            tracing::info!("Sampling config replaced: {:?}", sampling);
        }
        None => {}
    }
    let _ = response_tx.send(sampling.clone());
}

/// Worker thread main loop while no model is loaded
///
/// Owns the backend and, through [`serve_model`], the loaded model.
fn worker_thread_main<B: EngineBackend>(
    mut backend: B,
    command_rx: Receiver<WorkerCommand>,
    stop: CancelToken,
    status: SharedStatus,
) {
    let mut sampling = SamplingConfig::default();
    let mut next: Option<WorkerCommand> = None;

    loop {
        let command = match next.take() {
            Some(command) => command,
            None => match command_rx.recv() {
                Ok(command) => command,
                Err(_) => {
                    tracing::debug!("Command channel closed, worker exiting");
                    break;
                }
            },
        };

        match command {
            WorkerCommand::Initialize {
                options,
                response_tx,
            } => {
                let n_threads = inference_threads();
                let model = match backend.load_model(
                    &options.model_path,
                    &ModelParams {
                        gpu_layers: options.gpu_layers,
                    },
                ) {
                    Ok(model) => model,
                    Err(e) => {
                        tracing::error!("Failed to load {:?}: {}", options.model_path, e);
                        let _ = response_tx.send(Err(e));
                        continue;
                    }
                };
                let vocab = match model.vocabulary() {
                    Ok(vocab) => vocab,
                    Err(e) => {
                        tracing::error!("Model has no usable vocabulary: {}", e);
                        let _ = response_tx.send(Err(e));
                        continue;
                    }
                };

                let capacity = effective_capacity(options.context_capacity);
                let window =
                    match ContextWindow::allocate(&model, ContextParams::new(capacity, n_threads)) {
                        Ok(window) => window,
                        Err(e) => {
                            tracing::error!("Failed to allocate context window: {}", e);
                            let _ = response_tx.send(Err(e));
                            continue;
                        }
                    };

                let stats = model.stats();
                let info = LoadedModelInfo {
                    path: options.model_path.to_string_lossy().to_string(),
                    vocab_size: vocab.n_vocab,
                    eos_token: vocab.eos,
                    context_capacity: capacity,
                    n_threads,
                    embedding_dim: stats.embedding_dim,
                    context_length: stats.train_context_length,
                    param_count: stats.param_count,
                    size_bytes: stats.size_bytes,
                };
                tracing::info!(
                    "Model loaded: {} ({} params, {} vocab, {} ctx, {} threads)",
                    info.path,
                    info.param_count,
                    info.vocab_size,
                    info.context_capacity,
                    info.n_threads
                );

                *lock_status(&status) = Some(info.clone());
                let _ = response_tx.send(Ok(info));

                let ended_by = serve_model(window, vocab, &command_rx, &stop, &mut sampling);
                drop(model);
                *lock_status(&status) = None;
                tracing::info!("Model released");

                match ended_by {
                    Some(WorkerCommand::Release { response_tx }) => {
                        let _ = response_tx.send(());
                    }
                    Some(WorkerCommand::Shutdown) | None => break,
                    // Re-initialization runs on the next iteration
                    other => next = other,
                }
            }
            WorkerCommand::Release { response_tx } => {
                let _ = response_tx.send(());
            }
            WorkerCommand::Sampling {
                change,
                response_tx,
            } => apply_sampling_change(&mut sampling, change, response_tx),
            WorkerCommand::Generate { job, output } => {
                tracing::debug!("Request {} rejected: no model loaded", job.request_id);
                output.reject(job.request_id, FinishReason::NotInitialized);
            }
            WorkerCommand::Shutdown => {
                tracing::info!("Worker thread shutting down");
                break;
            }
        }
    }
}

/// Serves requests against one loaded model.
///
/// Returns the command that ended the loaded phase (re-initialize, release
/// or shutdown), or `None` if the handle went away. The window is destroyed
/// before this returns.
fn serve_model<'m, M: EngineModel + 'm>(
    mut window: ContextWindow<'m, M>,
    vocab: Vocabulary,
    command_rx: &Receiver<WorkerCommand>,
    stop: &CancelToken,
    sampling: &mut SamplingConfig,
) -> Option<WorkerCommand> {
    let ended_by = loop {
        let Ok(command) = command_rx.recv() else {
            tracing::debug!("Command channel closed, worker exiting");
            break Some(WorkerCommand::Shutdown);
        };

        match command {
            WorkerCommand::Sampling {
                change,
                response_tx,
            } => apply_sampling_change(sampling, change, response_tx),
            WorkerCommand::Generate { job, output } => {
                run_job(&mut window, vocab, sampling, stop, job, output)
            }
            other => break Some(other),
        }
    };

    drop(window);
    ended_by
}

fn run_job<M: EngineModel>(
    window: &mut ContextWindow<'_, M>,
    vocab: Vocabulary,
    sampling: &SamplingConfig,
    stop: &CancelToken,
    job: GenerationJob,
    output: JobOutput,
) {
    let span = tracing::info_span!("generate", request_id = %job.request_id);
    let _enter = span.enter();

    // A stop aimed at an earlier request must not leak into this one
    stop.reset();

    let sampler = SamplerChain::build(sampling);
    let session = GenerationSession::new(window, vocab, sampler, stop, job.request_id);

    match output {
        JobOutput::Stream(token_tx) => {
            let mut sink = ChannelSink::new(token_tx);
            session.run(&job.prompt, job.max_steps, &mut sink);
        }
        JobOutput::Batch(output_tx) => {
            let mut text = String::new();
            let summary = session.run(&job.prompt, job.max_steps, &mut text);
            let _ = output_tx.send(BatchOutput { text, summary });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::fake::{byte_tokens, gguf_fixture, Counters, FakeBackend, FakeOptions};
    use crate::inference::sampler::SamplerStage;
    use crate::inference::session::Outcome;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn engine(options: FakeOptions) -> (LlmEngine, Arc<Counters>) {
        let backend = FakeBackend::new(options);
        let counters = backend.counters();
        (LlmEngine::with_backend(backend).unwrap(), counters)
    }

    fn collect(rx: Receiver<StreamToken>) -> (String, Vec<SessionSummary>) {
        let mut text = String::new();
        let mut done = Vec::new();
        for message in rx.iter() {
            match message {
                StreamToken::Token(t) => {
                    assert!(done.is_empty(), "token after done");
                    text.push_str(&t);
                }
                StreamToken::Done(summary) => done.push(summary),
            }
        }
        (text, done)
    }

    #[test]
    fn test_uninitialized_engine() {
        let (engine, counters) = engine(FakeOptions::replying("never"));
        assert!(!engine.is_initialized());
        assert!(engine.model_info().is_none());

        assert_eq!(engine.generate_batch("Hello", 16), "");

        let (text, done) = collect(engine.generate_stream("Hello"));
        assert_eq!(text, "");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].finish, FinishReason::NotInitialized);
        assert_eq!(done[0].outcome, Outcome::Failed);
        assert_eq!(counters.decodes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_initialize_reports_model_info() {
        let (engine, _counters) = engine(FakeOptions::default());
        let file = gguf_fixture();

        let info = engine.initialize(file.path(), 0).unwrap();
        assert_eq!(info.context_capacity, 2048);
        assert_eq!(info.vocab_size, 258);
        assert_eq!(info.eos_token, 0);
        assert!(info.n_threads >= 2);
        assert!(engine.is_initialized());
        assert_eq!(engine.model_info(), Some(info));
    }

    #[test]
    fn test_invalid_model_file_never_reaches_engine() {
        let (engine, counters) = engine(FakeOptions::default());
        let result = engine.initialize("/this/path/does/not/exist.gguf", 512);

        assert!(matches!(result, Err(EngineError::ModelValidation(_))));
        assert_eq!(counters.models_loaded.load(Ordering::SeqCst), 0);
        assert!(!engine.is_initialized());
    }

    #[test]
    fn test_load_failure_leaves_nothing_behind() {
        let (engine, counters) = engine(FakeOptions {
            fail_load: true,
            ..FakeOptions::default()
        });
        let file = gguf_fixture();

        assert!(matches!(
            engine.initialize(file.path(), 512),
            Err(EngineError::ModelLoad(_))
        ));
        assert!(!engine.is_initialized());
        assert_eq!(counters.models_live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_vocabulary_failure_releases_model() {
        let (engine, counters) = engine(FakeOptions {
            fail_vocab: true,
            ..FakeOptions::default()
        });
        let file = gguf_fixture();

        assert!(matches!(
            engine.initialize(file.path(), 512),
            Err(EngineError::Vocabulary(_))
        ));
        assert_eq!(counters.models_loaded.load(Ordering::SeqCst), 1);
        assert_eq!(counters.models_live.load(Ordering::SeqCst), 0);
        assert!(!engine.is_initialized());
    }

    #[test]
    fn test_context_failure_releases_model() {
        let (engine, counters) = engine(FakeOptions {
            fail_context: true,
            ..FakeOptions::default()
        });
        let file = gguf_fixture();

        assert!(matches!(
            engine.initialize(file.path(), 512),
            Err(EngineError::ContextCreate(_))
        ));
        assert_eq!(counters.models_live.load(Ordering::SeqCst), 0);
        assert_eq!(counters.contexts_live.load(Ordering::SeqCst), 0);
        assert_eq!(engine.generate_batch("Hello", 8), "");
    }

    #[test]
    fn test_reinitialize_releases_previous_model_first() {
        let (engine, counters) = engine(FakeOptions::default());
        let file = gguf_fixture();

        engine.initialize(file.path(), 256).unwrap();
        engine.initialize(file.path(), 512).unwrap();

        assert_eq!(
            counters.events(),
            vec!["model+", "ctx+", "ctx-", "model-", "model+", "ctx+"]
        );
        assert_eq!(counters.models_live.load(Ordering::SeqCst), 1);
        assert_eq!(engine.model_info().map(|i| i.context_capacity), Some(512));
    }

    #[test]
    fn test_release_is_idempotent() {
        let (engine, counters) = engine(FakeOptions::replying("hi"));
        engine.release();

        let file = gguf_fixture();
        engine.initialize(file.path(), 256).unwrap();
        engine.release();
        engine.release();

        assert!(!engine.is_initialized());
        assert_eq!(counters.models_live.load(Ordering::SeqCst), 0);
        assert_eq!(counters.contexts_live.load(Ordering::SeqCst), 0);
        assert_eq!(engine.generate_batch("Hello", 8), "");
    }

    #[test]
    fn test_drop_releases_model() {
        let (engine, counters) = engine(FakeOptions::default());
        let file = gguf_fixture();
        engine.initialize(file.path(), 256).unwrap();
        drop(engine);

        assert_eq!(counters.events(), vec!["model+", "ctx+", "ctx-", "model-"]);
    }

    #[test]
    fn test_sampling_update_is_clamped() {
        let (engine, _counters) = engine(FakeOptions::default());
        let config = engine
            .update_sampling_config(&SamplingUpdate {
                top_p: 1.5,
                top_k: -3,
                temperature: -0.5,
                ..SamplingUpdate::default()
            })
            .unwrap();

        assert_eq!(config.top_p, 1.0);
        assert_eq!(config.top_k, 0);
        assert_eq!(config.temperature, 0.0);
        assert_eq!(engine.sampling_config().unwrap(), config);

        let chain = SamplerChain::build(&config);
        assert!(!chain
            .stages()
            .iter()
            .any(|stage| matches!(stage, SamplerStage::TopP { .. })));
    }

    #[test]
    fn test_set_sampling_config_keeps_seed() {
        let (engine, _counters) = engine(FakeOptions::default());
        let config = engine
            .set_sampling_config(SamplingConfig {
                seed: Some(7),
                min_keep: 0,
                ..SamplingConfig::default()
            })
            .unwrap();

        assert_eq!(config.seed, Some(7));
        assert_eq!(config.min_keep, 1);
    }

    /// Loaded engine with greedy selection; keep the fixture alive with it
    fn greedy_engine(
        options: FakeOptions,
        capacity: i32,
    ) -> (LlmEngine, Arc<Counters>, tempfile::NamedTempFile) {
        let (engine, counters) = engine(options);
        let file = gguf_fixture();
        engine.initialize(file.path(), capacity).unwrap();
        engine
            .update_sampling_config(&SamplingUpdate {
                temperature: 0.0,
                ..SamplingUpdate::default()
            })
            .unwrap();
        (engine, counters, file)
    }

    /// Scripted "aaaa" with "b" a close second at every step
    fn near_tie() -> FakeOptions {
        FakeOptions {
            rival: Some(byte_tokens("b")[0]),
            ..FakeOptions::replying("aaaa")
        }
    }

    fn heavy_penalty() -> SamplingUpdate {
        SamplingUpdate {
            temperature: 0.0,
            repeat_penalty: 2.0,
            ..SamplingUpdate::default()
        }
    }

    #[test]
    fn test_sampling_update_changes_next_generation() {
        let (engine, _counters, _file) = greedy_engine(near_tie(), 0);
        assert_eq!(engine.generate_batch("go", 4), "aaaa");

        engine.update_sampling_config(&heavy_penalty()).unwrap();

        // A repeated "a" now scores 5.0 and loses to the runner-up once
        assert_eq!(engine.generate_batch("go", 4), "abaa");
    }

    #[test]
    fn test_sampling_update_leaves_running_request_alone() {
        let (engine, _counters, _file) = greedy_engine(
            FakeOptions {
                decode_delay: Some(Duration::from_millis(5)),
                ..near_tie()
            },
            0,
        );

        let rx = engine.generate_stream("go");
        let first = rx.recv().unwrap();
        assert_eq!(first.as_token(), Some("a"));

        // Queued behind the running request
        let config = engine.update_sampling_config(&heavy_penalty()).unwrap();
        assert_eq!(config.repeat_penalty, 2.0);

        let (rest, done) = collect(rx);
        assert_eq!(format!("a{}", rest), "aaaa");
        assert_eq!(done[0].finish, FinishReason::EndOfSequence);

        assert_eq!(engine.generate_batch("go", 4), "abaa");
    }

    #[test]
    fn test_stream_delivers_reply_then_done() {
        let (engine, _counters, _file) = greedy_engine(FakeOptions::replying("Hello, 世界!"), 0);

        let (text, done) = collect(engine.generate_stream("Hi"));
        assert_eq!(text, "Hello, 世界!");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].finish, FinishReason::EndOfSequence);
        assert_eq!(done[0].prompt_tokens, chat_prompt("Hi").len());
    }

    #[test]
    fn test_immediate_end_of_sequence_returns_empty() {
        let (engine, counters, _file) = greedy_engine(FakeOptions::default(), 0);

        assert_eq!(engine.generate_batch("Hello", 1), "");
        // Only the prefill reached the engine
        assert_eq!(counters.decodes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_batch_step_budget_has_floor() {
        let reply = "x".repeat(100);
        let (engine, _counters, _file) = greedy_engine(FakeOptions::replying(&reply), 0);

        let output = engine.generate_batch_with_summary("go", 1);
        assert_eq!(output.text.len(), BATCH_MIN_STEPS);
        assert_eq!(output.summary.finish, FinishReason::StepBudget);
    }

    #[test]
    fn test_request_stop_cancels_stream() {
        let reply = "a".repeat(400);
        let (engine, _counters, _file) = greedy_engine(
            FakeOptions {
                decode_delay: Some(Duration::from_millis(2)),
                ..FakeOptions::replying(&reply)
            },
            0,
        );

        let rx = engine.generate_stream("Tell me a story");
        let first = rx.recv().unwrap();
        assert!(first.is_token());
        engine.request_stop();

        let (rest, done) = collect(rx);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].outcome, Outcome::Cancelled);
        assert!(rest.len() < 399);

        // The next request is not affected by the earlier stop
        let output = engine.generate_batch_with_summary("again", 4);
        assert_ne!(output.summary.outcome, Outcome::Cancelled);
    }

    #[test]
    fn test_rebuild_without_clear_primitive() {
        let (engine, counters, _file) = greedy_engine(
            FakeOptions {
                supports_clear: false,
                ..FakeOptions::replying("ok")
            },
            0,
        );

        assert_eq!(engine.generate_batch("one", 8), "ok");
        assert_eq!(engine.generate_batch("two", 8), "ok");
        assert_eq!(counters.contexts_created.load(Ordering::SeqCst), 3);
        assert_eq!(counters.contexts_live.load(Ordering::SeqCst), 1);
        assert_eq!(counters.clears.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_decode_failure_returns_partial_text() {
        let (engine, _counters, _file) = greedy_engine(
            FakeOptions {
                fail_decode_at: Some(3),
                ..FakeOptions::replying("abcdef")
            },
            0,
        );

        let output = engine.generate_batch_with_summary("go", 16);
        assert_eq!(output.text, "abc");
        assert_eq!(output.summary.outcome, Outcome::Failed);
        assert_eq!(output.summary.finish, FinishReason::DecodeRejected);

        // The window is usable again for the next request
        assert!(engine.is_initialized());
    }

    #[test]
    fn test_long_prompt_truncated_to_window() {
        let (engine, _counters, _file) = greedy_engine(FakeOptions::replying("ok"), 40);

        let output = engine.generate_batch_with_summary(&"p".repeat(100), 8);
        assert!(output.summary.truncated);
        assert_eq!(output.summary.prompt_tokens, 8);
        assert_eq!(output.text, "ok");
    }

    #[test]
    fn test_generate_essay() {
        let (engine, _counters, _file) = greedy_engine(FakeOptions::replying("Once upon a time."), 0);

        let essay = engine.generate_essay(&EssayRequest {
            title: "Spring".to_string(),
            ..EssayRequest::default()
        });
        assert_eq!(essay, "Once upon a time.");
    }
}
