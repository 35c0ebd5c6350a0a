//! facematch-core — Face embedding extraction and verification.
//!
//! Turns a cropped face image into an ArcFace embedding via ONNX Runtime
//! and compares embeddings by cosine similarity.

pub mod extractor;
pub mod matcher;
pub mod onnx;
pub mod preprocess;
pub mod probe;
pub mod session;
pub mod types;
pub mod worker;

pub use extractor::{EmbeddingExtractor, ExtractError, ExtractorConfig};
pub use matcher::{compare, identify, verify, MatchPolicy, MatchResult, Reference, SimilarityError};
pub use onnx::OrtEngine;
pub use preprocess::{Normalization, PixelSource, PreprocessError, Preprocessor, Rect, RgbaFrame};
pub use probe::simd_supported;
pub use session::{InferenceSession, ModelSource, SessionConfig, SessionError, SessionState};
pub use types::{Embedding, InputSize, Tensor};
pub use worker::{spawn_extractor, ExtractorHandle, WorkerError};
