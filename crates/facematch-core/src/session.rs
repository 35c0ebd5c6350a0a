//! Inference session adapter and its lifecycle.
//!
//! ```text
//! Unloaded ──load──▶ Loading ──ok──▶ Ready ──load──▶ Loading ...
//!                       │
//!                       └──err──▶ Failed ──load──▶ Loading ...
//! ```
//!
//! The adapter owns exactly one engine session at a time. `load` and `run`
//! both take `&mut self`, so a single owner can never overlap them.

use crate::types::{Embedding, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Intra-op threads when the SIMD fast path is available.
const FAST_PATH_THREADS: usize = 2;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("inference engine unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("session not ready (state: {0})")]
    NotReady(SessionState),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where model weights come from.
#[derive(Clone)]
pub enum ModelSource {
    File(PathBuf),
    Memory(Vec<u8>),
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Memory(bytes) => write!(f, "<{} bytes in memory>", bytes.len()),
        }
    }
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphOptimizationLevel {
    None,
    Basic,
    Extended,
    All,
}

/// Engine configuration, passed explicitly at session creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Backends to try, in order (e.g. `["cpu"]`).
    pub execution_providers: Vec<String>,
    pub graph_optimization_level: GraphOptimizationLevel,
    pub num_threads: usize,
    pub simd_enabled: bool,
}

/// CPU provider, full graph optimization, one intra-op thread. The fast
/// path is assumed available until a probe says otherwise.
impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            ..Self::for_capability(true)
        }
    }
}

impl SessionConfig {
    /// Derive a config from the SIMD probe result.
    pub fn for_capability(simd_enabled: bool) -> Self {
        Self {
            execution_providers: vec!["cpu".to_string()],
            graph_optimization_level: GraphOptimizationLevel::All,
            num_threads: if simd_enabled { FAST_PATH_THREADS } else { 1 },
            simd_enabled,
        }
    }
}

/// The external inference engine.
pub trait InferenceEngine: Send {
    fn create_session(
        &self,
        source: &ModelSource,
        config: &SessionConfig,
    ) -> Result<Box<dyn EngineSession>, EngineError>;
}

/// A model loaded into the engine.
pub trait EngineSession: Send {
    fn input_names(&self) -> Vec<String>;
    fn output_names(&self) -> Vec<String>;

    /// Feed `tensor` as `input`, return the flat `f32` contents of `output`.
    fn run(&mut self, input: &str, tensor: &Tensor, output: &str) -> Result<Vec<f32>, EngineError>;
}

struct LoadedModel {
    session: Box<dyn EngineSession>,
    input_names: Vec<String>,
    output_names: Vec<String>,
    /// Length of the first embedding this model produced.
    observed_dim: Option<usize>,
}

/// Owns the loaded model and enforces the lifecycle.
pub struct InferenceSession {
    engine: Box<dyn InferenceEngine>,
    config: SessionConfig,
    state: SessionState,
    model: Option<LoadedModel>,
    expected_dim: Option<usize>,
    model_version: Option<String>,
}

impl InferenceSession {
    pub fn new(engine: Box<dyn InferenceEngine>, config: SessionConfig) -> Self {
        Self {
            engine,
            config,
            state: SessionState::Unloaded,
            model: None,
            expected_dim: None,
            model_version: None,
        }
    }

    /// Reject embeddings whose length differs from `dim`.
    pub fn with_expected_dim(mut self, dim: Option<usize>) -> Self {
        self.expected_dim = dim;
        self
    }

    /// Tag stamped on every embedding this session produces.
    pub fn with_model_version(mut self, version: Option<String>) -> Self {
        self.model_version = version;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn input_names(&self) -> &[String] {
        self.model.as_ref().map(|m| m.input_names.as_slice()).unwrap_or(&[])
    }

    pub fn output_names(&self) -> &[String] {
        self.model.as_ref().map(|m| m.output_names.as_slice()).unwrap_or(&[])
    }

    /// Embedding length: the configured one, else the one observed so far.
    pub fn embedding_dim(&self) -> Option<usize> {
        self.expected_dim
            .or_else(|| self.model.as_ref().and_then(|m| m.observed_dim))
    }

    /// Load (or reload) a model. Any previously loaded model is dropped first.
    pub fn load(&mut self, source: &ModelSource) -> Result<(), SessionError> {
        self.model = None;
        self.state = SessionState::Loading;
        tracing::info!(%source, config = ?self.config, "loading face embedding model");

        match self.open(source) {
            Ok(model) => {
                tracing::info!(
                    %source,
                    inputs = ?model.input_names,
                    outputs = ?model.output_names,
                    "loaded face embedding model"
                );
                self.model = Some(model);
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%source, error = %e, "model load failed");
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    fn open(&self, source: &ModelSource) -> Result<LoadedModel, SessionError> {
        let session = self
            .engine
            .create_session(source, &self.config)
            .map_err(|e| SessionError::ModelLoad(e.to_string()))?;

        let input_names = session.input_names();
        let output_names = session.output_names();
        if input_names.is_empty() || output_names.is_empty() {
            return Err(SessionError::ModelLoad(format!(
                "model declares {} inputs and {} outputs; need at least one of each",
                input_names.len(),
                output_names.len()
            )));
        }
        if input_names.len() > 1 || output_names.len() > 1 {
            // Only the first input and first output are used.
            tracing::warn!(
                inputs = ?input_names,
                outputs = ?output_names,
                "model has multiple inputs or outputs; using the first of each"
            );
        }

        Ok(LoadedModel {
            session,
            input_names,
            output_names,
            observed_dim: None,
        })
    }

    /// Run one tensor through the model.
    pub fn run(&mut self, tensor: &Tensor) -> Result<Embedding, SessionError> {
        let state = self.state;
        let expected_dim = self.expected_dim;
        let model = match (state, self.model.as_mut()) {
            (SessionState::Ready, Some(model)) => model,
            _ => return Err(SessionError::NotReady(state)),
        };

        let input = &model.input_names[0];
        let output = &model.output_names[0];
        let values = model
            .session
            .run(input, tensor, output)
            .map_err(|e| SessionError::InferenceFailed(e.to_string()))?;

        if values.is_empty() {
            return Err(SessionError::InferenceFailed(format!("output '{output}' is empty")));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(SessionError::InferenceFailed(
                "embedding contains non-finite values".to_string(),
            ));
        }

        let want = expected_dim.or(model.observed_dim);
        match want {
            Some(dim) if dim != values.len() => {
                return Err(SessionError::InferenceFailed(format!(
                    "expected {dim}-dim embedding, got {}",
                    values.len()
                )));
            }
            Some(_) => {}
            None => model.observed_dim = Some(values.len()),
        }

        let embedding = Embedding::new(values);
        Ok(match &self.model_version {
            Some(v) => embedding.with_model_version(v.clone()),
            None => embedding,
        })
    }
}
