//! ONNX Runtime backend for [`InferenceEngine`].

use crate::session::{
    EngineError, EngineSession, GraphOptimizationLevel, InferenceEngine, ModelSource, SessionConfig,
};
use crate::types::Tensor;
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::builder::GraphOptimizationLevel as OrtOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;

/// Creates sessions through the `ort` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrtEngine;

fn backend(e: impl std::fmt::Display) -> EngineError {
    EngineError::Backend(e.to_string())
}

fn optimization_level(level: GraphOptimizationLevel) -> OrtOptimizationLevel {
    match level {
        GraphOptimizationLevel::None => OrtOptimizationLevel::Disable,
        GraphOptimizationLevel::Basic => OrtOptimizationLevel::Level1,
        GraphOptimizationLevel::Extended => OrtOptimizationLevel::Level2,
        GraphOptimizationLevel::All => OrtOptimizationLevel::Level3,
    }
}

/// Map provider names onto the providers this build can dispatch to.
fn execution_providers(names: &[String]) -> Vec<ExecutionProviderDispatch> {
    names
        .iter()
        .filter_map(|name| match name.to_ascii_lowercase().as_str() {
            "cpu" | "wasm" => Some(CPUExecutionProvider::default().build()),
            other => {
                tracing::warn!(provider = other, "execution provider not compiled in; skipping");
                None
            }
        })
        .collect()
}

impl InferenceEngine for OrtEngine {
    fn create_session(
        &self,
        source: &ModelSource,
        config: &SessionConfig,
    ) -> Result<Box<dyn EngineSession>, EngineError> {
        if let ModelSource::File(path) = source {
            if !path.exists() {
                return Err(EngineError::Backend(format!(
                    "model file not found: {} — download w600k_mbf.onnx from insightface buffalo_sc",
                    path.display()
                )));
            }
        }

        // Fails when the ONNX Runtime shared library cannot be loaded.
        let builder = Session::builder().map_err(|e| EngineError::Unavailable(e.to_string()))?;

        let mut builder = builder
            .with_optimization_level(optimization_level(config.graph_optimization_level))
            .map_err(backend)?
            .with_intra_threads(config.num_threads.max(1))
            .map_err(backend)?;

        let providers = execution_providers(&config.execution_providers);
        if !providers.is_empty() {
            builder = builder.with_execution_providers(providers).map_err(backend)?;
        }

        // ONNX Runtime picks its vectorized kernels itself; the flag only
        // shapes the thread count chosen upstream.
        tracing::debug!(
            simd_enabled = config.simd_enabled,
            threads = config.num_threads,
            "creating ONNX Runtime session"
        );

        let session = match source {
            ModelSource::File(path) => builder.commit_from_file(path),
            ModelSource::Memory(bytes) => builder.commit_from_memory(bytes),
        }
        .map_err(backend)?;

        Ok(Box::new(OrtSession { session }))
    }
}

struct OrtSession {
    session: Session,
}

impl EngineSession for OrtSession {
    fn input_names(&self) -> Vec<String> {
        self.session.inputs().iter().map(|i| i.name().to_string()).collect()
    }

    fn output_names(&self) -> Vec<String> {
        self.session.outputs().iter().map(|o| o.name().to_string()).collect()
    }

    fn run(&mut self, input: &str, tensor: &Tensor, output: &str) -> Result<Vec<f32>, EngineError> {
        let value = TensorRef::from_array_view(tensor.view()).map_err(backend)?;
        let outputs = self
            .session
            .run(ort::inputs![input.to_string() => value])
            .map_err(backend)?;

        let result = outputs
            .get(output)
            .ok_or_else(|| EngineError::Backend(format!("model produced no output '{output}'")))?;

        let (_, data) = result
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::Backend(format!("embedding extraction: {e}")))?;

        Ok(data.to_vec())
    }
}
