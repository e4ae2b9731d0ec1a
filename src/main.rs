//! Pocket LLM - local text generation from the command line
//!
//! Streams chat replies, writes essays and manages the local model store.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pocket_llm::storage::models::{resolve_model, scan_models_directory, ModelSource};
use pocket_llm::storage::settings::{load_settings, EngineSettings};
use pocket_llm::storage::StorageError;
use pocket_llm::inference::TransportEncoding;
use pocket_llm::{
    pump, EngineError, EssayRequest, InitOptions, LlmEngine, SessionSummary, TokenListener,
};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Invalid log filter: {0}")]
    LogFilter(String),
}

#[derive(Debug, Parser)]
#[command(name = "pocket-llm", version, about = "Local text generation with llama.cpp")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stream a chat reply to stdout (Ctrl-C stops generation)
    Chat {
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        sampling: SamplingArgs,
        /// Print the session summary as JSON on stderr
        #[arg(long)]
        summary: bool,
        /// Byte encoding of the streamed text: utf8, utf16 (little-endian)
        /// or modified-utf8 (JNI)
        #[arg(long, default_value = "utf8")]
        transport: TransportEncoding,
        prompt: String,
    },
    /// Continue a raw prompt without any chat template
    Complete {
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        sampling: SamplingArgs,
        #[arg(long, default_value_t = 256)]
        max_new_tokens: usize,
        #[arg(long)]
        summary: bool,
        prompt: String,
    },
    /// Write an essay for language learners
    Essay {
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        sampling: SamplingArgs,
        #[arg(long, default_value = "An Essay")]
        title: String,
        #[arg(long, default_value_t = 200)]
        words: u32,
        #[arg(long, default_value = "en")]
        lang: String,
        /// Comma-separated words learners often get wrong
        #[arg(long, value_delimiter = ',')]
        mistaken: Vec<String>,
        /// Comma-separated vocabulary to practice
        #[arg(long, value_delimiter = ',')]
        vocab: Vec<String>,
        #[arg(long)]
        max_new_tokens: Option<usize>,
    },
    /// List models in the models directory
    Models {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct ModelArgs {
    /// Path to a GGUF model file
    #[arg(long)]
    model: Option<PathBuf>,
    /// File name inside the models directory
    #[arg(long)]
    model_name: Option<String>,
    /// Download from this URL if the model is not present yet
    #[arg(long)]
    url: Option<String>,
    /// Expected SHA-256 of the model file (hex)
    #[arg(long)]
    sha256: Option<String>,
    #[arg(long)]
    models_dir: Option<PathBuf>,
    /// Context window in tokens
    #[arg(long)]
    ctx: Option<u32>,
    #[arg(long)]
    gpu_layers: Option<u32>,
}

#[derive(Debug, Args)]
struct SamplingArgs {
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    top_p: Option<f32>,
    #[arg(long)]
    top_k: Option<u32>,
    #[arg(long)]
    repeat_penalty: Option<f32>,
    #[arg(long)]
    repeat_last_n: Option<u32>,
    #[arg(long)]
    min_p: Option<f32>,
    #[arg(long)]
    seed: Option<u64>,
}

impl SamplingArgs {
    fn apply(&self, settings: &mut EngineSettings) {
        let sampling = &mut settings.sampling;
        if let Some(v) = self.temperature {
            sampling.temperature = v;
        }
        if let Some(v) = self.top_p {
            sampling.top_p = v;
        }
        if let Some(v) = self.top_k {
            sampling.top_k = v;
        }
        if let Some(v) = self.repeat_penalty {
            sampling.repeat_penalty = v;
        }
        if let Some(v) = self.repeat_last_n {
            sampling.repeat_last_n = v;
        }
        if let Some(v) = self.min_p {
            sampling.min_p = v;
        }
        if self.seed.is_some() {
            sampling.seed = self.seed;
        }
    }
}

/// Writes tokens to stdout as they arrive
struct StdoutListener {
    encoding: TransportEncoding,
}

impl TokenListener for StdoutListener {
    fn on_token(&mut self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(&self.encoding.encode(text).into_bytes());
        let _ = stdout.flush();
    }

    fn on_done(&mut self, _summary: &SessionSummary) {
        if self.encoding == TransportEncoding::Utf8 {
            println!();
        }
    }
}

fn print_summary(summary: &SessionSummary) {
    match serde_json::to_string_pretty(summary) {
        Ok(json) => eprintln!("{json}"),
        Err(e) => tracing::warn!("Could not serialize summary: {}", e),
    }
}

/// Resolves the model, then loads it on the inference worker
async fn load_engine(
    model: &ModelArgs,
    sampling: &SamplingArgs,
) -> Result<LlmEngine, CliError> {
    let mut settings = load_settings();
    sampling.apply(&mut settings);
    if let Some(ctx) = model.ctx {
        settings.context_capacity = ctx;
    }
    if let Some(layers) = model.gpu_layers {
        settings.gpu_layers = layers;
    }
    settings.validate();

    let models_dir = model
        .models_dir
        .clone()
        .unwrap_or_else(|| settings.models_directory.clone());
    let source = ModelSource {
        path: model.model.clone(),
        file_name: model.model_name.clone(),
        remote_url: model.url.clone(),
        expected_sha256: model.sha256.clone(),
    };
    let model_path = resolve_model(&source, &models_dir).await?;

    let engine = tokio::task::spawn_blocking(move || -> Result<LlmEngine, EngineError> {
        let engine = LlmEngine::llama(settings.gpu_layers)?;
        engine.set_sampling_config(settings.sampling.clone())?;
        engine.initialize_with(&InitOptions {
            model_path,
            context_capacity: i32::try_from(settings.context_capacity).unwrap_or(i32::MAX),
            gpu_layers: settings.gpu_layers,
        })?;
        Ok(engine)
    })
    .await??;

    Ok(engine)
}

/// Ctrl-C asks the running generation to stop instead of killing the process
fn stop_on_ctrl_c(engine: &LlmEngine) -> tokio::task::JoinHandle<()> {
    let stop = engine.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping generation");
            stop.cancel();
        }
    })
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Chat {
            model,
            sampling,
            summary,
            transport,
            prompt,
        } => {
            let engine = load_engine(&model, &sampling).await?;
            let watcher = stop_on_ctrl_c(&engine);

            let result = tokio::task::spawn_blocking(move || {
                let rx = engine.generate_stream(&prompt);
                pump(rx, &mut StdoutListener { encoding: transport })
            })
            .await?;
            watcher.abort();

            if summary {
                print_summary(&result);
            }
        }
        Command::Complete {
            model,
            sampling,
            max_new_tokens,
            summary,
            prompt,
        } => {
            let engine = load_engine(&model, &sampling).await?;
            let watcher = stop_on_ctrl_c(&engine);

            let output = tokio::task::spawn_blocking(move || {
                engine.generate_batch_with_summary(&prompt, max_new_tokens)
            })
            .await?;
            watcher.abort();

            println!("{}", output.text);
            if summary {
                print_summary(&output.summary);
            }
        }
        Command::Essay {
            model,
            sampling,
            title,
            words,
            lang,
            mistaken,
            vocab,
            max_new_tokens,
        } => {
            let engine = load_engine(&model, &sampling).await?;
            let watcher = stop_on_ctrl_c(&engine);
            let request = EssayRequest {
                title,
                word_limit: words,
                lang,
                mistaken_words: mistaken,
                frequent_words: vocab,
                max_new_tokens,
            };

            let essay = tokio::task::spawn_blocking(move || engine.generate_essay(&request)).await?;
            watcher.abort();
            println!("{essay}");
        }
        Command::Models { dir } => {
            let dir = match dir {
                Some(dir) => dir,
                None => load_settings().models_directory,
            };
            let models = scan_models_directory(&dir)?;
            if models.is_empty() {
                println!("No models in {}", dir.display());
            }
            for model in models {
                let marker = if model.valid_header { "" } else { "  (invalid header)" };
                println!("{:<48} {:>10}{}", model.filename, model.size_string(), marker);
            }
        }
    }
    Ok(())
}

fn init_tracing() -> Result<(), CliError> {
    let directive: Directive = "pocket_llm=info"
        .parse()
        .map_err(|e: tracing_subscriber::filter::ParseError| CliError::LogFilter(e.to_string()))?;

    // Logs go to stderr so stdout carries only generated text
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(directive))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing() {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    info!("Starting Pocket LLM v{}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
