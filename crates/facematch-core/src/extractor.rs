//! Face embedding extraction: preprocess, then infer.
//!
//! Extracts 512-dimensional embeddings from face crops using an InsightFace
//! ArcFace model (w600k_mbf by default). The caller crops the face; this
//! component only resizes, normalizes and runs the model. No retries.

use crate::preprocess::{Normalization, PixelSource, PreprocessError, Preprocessor};
use crate::session::{InferenceEngine, InferenceSession, ModelSource, SessionConfig, SessionError, SessionState};
use crate::types::{Embedding, InputSize, Tensor};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_mbf";

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ExtractError {
    /// The model was not loaded (or its last load failed).
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::Session(SessionError::NotReady(_)))
    }
}

/// Extraction options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub input_size: InputSize,
    pub normalization: Normalization,
    /// Reject model outputs of any other length. `None` accepts the first
    /// length seen and holds the model to it.
    pub embedding_dim: Option<usize>,
    /// Scale embeddings to unit length. Off by default: the raw model output
    /// is returned.
    pub l2_normalize: bool,
    pub model_version: Option<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            input_size: InputSize::default(),
            normalization: Normalization::default(),
            embedding_dim: Some(ARCFACE_EMBEDDING_DIM),
            l2_normalize: false,
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        }
    }
}

/// Owns the preprocessor and the one inference session.
pub struct EmbeddingExtractor {
    preprocessor: Preprocessor,
    session: InferenceSession,
    l2_normalize: bool,
}

impl EmbeddingExtractor {
    pub fn new(
        engine: Box<dyn InferenceEngine>,
        session_config: SessionConfig,
        config: ExtractorConfig,
    ) -> Result<Self, ExtractError> {
        let preprocessor = Preprocessor::new(config.input_size, config.normalization)?;
        let session = InferenceSession::new(engine, session_config)
            .with_expected_dim(config.embedding_dim)
            .with_model_version(config.model_version);
        Ok(Self {
            preprocessor,
            session,
            l2_normalize: config.l2_normalize,
        })
    }

    /// Load or reload the model.
    pub fn load(&mut self, source: &ModelSource) -> Result<(), ExtractError> {
        Ok(self.session.load(source)?)
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &InferenceSession {
        &self.session
    }

    pub fn input_size(&self) -> InputSize {
        self.preprocessor.input_size()
    }

    /// Extract an embedding from a cropped face.
    pub fn extract_feature<S: PixelSource + ?Sized>(&mut self, image: &S) -> Result<Embedding, ExtractError> {
        // Fail fast before paying for preprocessing.
        let state = self.session.state();
        if state != SessionState::Ready {
            return Err(SessionError::NotReady(state).into());
        }

        let tensor = self.preprocessor.preprocess(image)?;
        log_tensor_stats(&tensor);

        let embedding = self.session.run(&tensor)?;
        tracing::debug!(dim = embedding.len(), "extracted face embedding");

        Ok(if self.l2_normalize {
            l2_normalize(embedding)
        } else {
            embedding
        })
    }

    /// Decode an image file and extract from the whole picture.
    ///
    /// A file that cannot be read or decoded is an invalid input.
    pub fn extract_from_path(&mut self, path: impl AsRef<Path>) -> Result<Embedding, ExtractError> {
        let path = path.as_ref();
        let image = image::open(path).map_err(|e| {
            PreprocessError::InvalidInput(format!("cannot read image {}: {e}", path.display()))
        })?;
        self.extract_feature(&image)
    }
}

/// Scale to unit L2 norm. Zero vectors are returned unchanged.
pub fn l2_normalize(embedding: Embedding) -> Embedding {
    let norm: f32 = embedding.values().iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= 0.0 {
        return embedding;
    }
    let values = embedding.values().iter().map(|x| x / norm).collect();
    match embedding.model_version() {
        Some(v) => Embedding::new(values).with_model_version(v),
        None => Embedding::new(values),
    }
}

/// Per-channel means, for checking normalization and channel order.
fn log_tensor_stats(tensor: &Tensor) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    let mean = |c: usize| {
        let plane = tensor.plane(c);
        plane.iter().sum::<f32>() / plane.len().max(1) as f32
    };
    tracing::debug!(
        shape = ?tensor.shape(),
        r_mean = mean(0),
        g_mean = mean(1),
        b_mean = mean(2),
        "preprocessed face tensor"
    );
}
