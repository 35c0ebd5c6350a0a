use anyhow::{Context, Result};
use facematch_core::{ExtractorConfig, SessionConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI configuration: defaults, then an optional TOML file, then
/// `FACEMATCH_*` environment variables. Command-line flags are applied last
/// by the caller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// ArcFace ONNX model file.
    pub model_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Seconds to wait for a model load or extraction before giving up.
    pub timeout_secs: u64,
    /// Engine settings. Derived from the SIMD probe when absent.
    pub session: Option<SessionConfig>,
    pub extractor: ExtractorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: default_model_dir().join("w600k_mbf.onnx"),
            similarity_threshold: 0.40,
            timeout_secs: 30,
            session: None,
            extractor: ExtractorConfig::default(),
        }
    }
}

impl Config {
    /// Load from `path` (or `FACEMATCH_CONFIG`) if given, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("FACEMATCH_CONFIG").ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                let src = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::from_toml(&src).with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_toml(src: &str) -> Result<Self> {
        Ok(toml::from_str(src)?)
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("FACEMATCH_MODEL_PATH") {
            self.model_path = PathBuf::from(path);
        }
        self.similarity_threshold = env_parse("FACEMATCH_SIMILARITY_THRESHOLD", self.similarity_threshold);
        self.timeout_secs = env_parse("FACEMATCH_TIMEOUT_SECS", self.timeout_secs);
        self.extractor.l2_normalize = std::env::var("FACEMATCH_L2_NORMALIZE")
            .map(|v| v != "0")
            .unwrap_or(self.extractor.l2_normalize);
        if let Some(threads) = env_opt::<usize>("FACEMATCH_NUM_THREADS") {
            let mut session = self.session_config();
            session.num_threads = threads;
            self.session = Some(session);
        }
    }

    /// Engine settings: the configured ones, else derived from the SIMD probe.
    pub fn session_config(&self) -> SessionConfig {
        self.session
            .clone()
            .unwrap_or_else(|| SessionConfig::for_capability(facematch_core::simd_supported()))
    }
}

/// `$XDG_DATA_HOME/facematch/models`, falling back to `~/.local/share`.
fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facematch/models")
}

fn env_opt<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_opt(key).unwrap_or(default)
}
