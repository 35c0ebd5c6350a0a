use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facematch_core::{
    spawn_extractor, verify, EmbeddingExtractor, Embedding, ExtractorHandle, MatchPolicy, ModelSource,
    OrtEngine,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

mod config;

use config::Config;

/// Exit status for a completed comparison that did not match.
const EXIT_NO_MATCH: u8 = 1;
/// Exit status for any failure (bad input, model load, timeout).
const EXIT_ERROR: u8 = 2;

#[derive(Parser)]
#[command(name = "facematch", about = "Face embedding extraction and 1:1 verification")]
struct Cli {
    /// TOML config file (default: $FACEMATCH_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// ArcFace ONNX model (overrides config)
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the SIMD capability and the engine settings derived from it
    Probe,
    /// Extract an embedding from a cropped face image
    Embed {
        /// Face image (already cropped to the face)
        image: PathBuf,
        /// Write the embedding JSON here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Compare two stored embeddings
    Compare {
        a: PathBuf,
        b: PathBuf,
        /// Match threshold in [0, 1] (overrides config)
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Verify a face image against a reference (embedding JSON or image)
    Verify {
        image: PathBuf,
        #[arg(short, long)]
        reference: PathBuf,
        /// Match threshold in [0, 1] (overrides config)
        #[arg(short, long)]
        threshold: Option<f32>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let result = run(Cli::parse()).await;
    if let Err(e) = &result {
        eprintln!("Error: {e:#}");
    }
    ExitCode::from(exit_status(&result))
}

/// Map a command outcome to the process exit status: 0 on success or match,
/// 1 on a non-match, 2 on error.
fn exit_status(result: &Result<bool>) -> u8 {
    match result {
        Ok(true) => 0,
        Ok(false) => EXIT_NO_MATCH,
        Err(_) => EXIT_ERROR,
    }
}

/// Run one subcommand. `Ok(false)` means a comparison completed without a match.
async fn run(cli: Cli) -> Result<bool> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(model) = cli.model {
        config.model_path = model;
    }

    match cli.command {
        Commands::Probe => {
            let simd = facematch_core::simd_supported();
            let report = serde_json::json!({
                "simd": simd,
                "session": config.session_config(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(true)
        }
        Commands::Embed { image, out } => {
            let extractor = start(&config).await?;
            let embedding = extract(&extractor, &image, &config).await?;
            let json = serde_json::to_string(&embedding)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
                    tracing::info!(path = %path.display(), dim = embedding.len(), "embedding written");
                }
                None => println!("{json}"),
            }
            Ok(true)
        }
        Commands::Compare { a, b, threshold } => {
            let policy = MatchPolicy::new(threshold.unwrap_or(config.similarity_threshold))?;
            let result = verify(&read_embedding(&a)?, &read_embedding(&b)?, policy)?;
            report(&result)
        }
        Commands::Verify {
            image,
            reference,
            threshold,
        } => {
            let policy = MatchPolicy::new(threshold.unwrap_or(config.similarity_threshold))?;
            let extractor = start(&config).await?;
            let reference = if is_json(&reference) {
                read_embedding(&reference)?
            } else {
                extract(&extractor, &reference, &config).await?
            };
            let probe = extract(&extractor, &image, &config).await?;
            let result = verify(&probe, &reference, policy)?;
            tracing::info!(
                similarity = result.similarity,
                threshold = policy.threshold(),
                matched = result.matched,
                "verification finished"
            );
            report(&result)
        }
    }
}

/// Spawn the extraction thread and load the configured model.
async fn start(config: &Config) -> Result<ExtractorHandle> {
    let extractor = EmbeddingExtractor::new(
        Box::new(OrtEngine),
        config.session_config(),
        config.extractor.clone(),
    )?;
    let handle = spawn_extractor(extractor)?;
    let source = ModelSource::File(config.model_path.clone());
    with_timeout(config, handle.load(source))
        .await?
        .with_context(|| format!("loading model {}", config.model_path.display()))?;
    Ok(handle)
}

async fn extract(handle: &ExtractorHandle, path: &Path, config: &Config) -> Result<Embedding> {
    let image = image::open(path).with_context(|| format!("decoding {}", path.display()))?;
    let embedding = with_timeout(config, handle.extract(image))
        .await?
        .with_context(|| format!("extracting embedding from {}", path.display()))?;
    Ok(embedding)
}

/// Abandons the wait after the configured timeout; the worker finishes regardless.
async fn with_timeout<T>(config: &Config, fut: impl Future<Output = T>) -> Result<T> {
    let limit = Duration::from_secs(config.timeout_secs);
    match tokio::time::timeout(limit, fut).await {
        Ok(v) => Ok(v),
        Err(_) => bail!("timed out after {}s", config.timeout_secs),
    }
}

fn read_embedding(path: &Path) -> Result<Embedding> {
    let src = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&src).with_context(|| format!("parsing embedding {}", path.display()))
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

fn report(result: &facematch_core::MatchResult) -> Result<bool> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(result.matched)
}
