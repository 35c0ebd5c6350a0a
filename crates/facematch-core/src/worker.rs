//! Dedicated extraction thread with a clone-safe async handle.
//!
//! The extractor lives on one OS thread and serves requests from a bounded
//! queue one at a time, so `load` never overlaps `extract` and the engine
//! session is never entered concurrently. Session state is published on a
//! watch channel so callers can see `Loading` while a load is in flight.

use crate::extractor::{EmbeddingExtractor, ExtractError};
use crate::preprocess::RgbaFrame;
use crate::session::{ModelSource, SessionState};
use crate::types::Embedding;
use image::DynamicImage;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

const QUEUE_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("failed to spawn extraction thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("extraction thread exited")]
    ChannelClosed,
}

impl WorkerError {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::Extract(e) if e.is_not_ready())
    }
}

/// Owned image payloads the worker can extract from.
pub enum FaceImage {
    Dynamic(DynamicImage),
    Frame(RgbaFrame),
}

impl From<DynamicImage> for FaceImage {
    fn from(image: DynamicImage) -> Self {
        Self::Dynamic(image)
    }
}

impl From<RgbaFrame> for FaceImage {
    fn from(frame: RgbaFrame) -> Self {
        Self::Frame(frame)
    }
}

/// Messages sent from handles to the worker thread.
enum WorkerRequest {
    Load {
        source: ModelSource,
        reply: oneshot::Sender<Result<(), ExtractError>>,
    },
    Extract {
        image: FaceImage,
        reply: oneshot::Sender<Result<Embedding, ExtractError>>,
    },
}

/// Clone-safe handle to the extraction thread.
#[derive(Clone)]
pub struct ExtractorHandle {
    tx: mpsc::Sender<WorkerRequest>,
    state: watch::Receiver<SessionState>,
}

impl ExtractorHandle {
    /// Queue a model (re)load. Extract requests queued behind it see the new model.
    pub async fn load(&self, source: ModelSource) -> Result<(), WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WorkerRequest::Load {
                source,
                reply: reply_tx,
            })
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| WorkerError::ChannelClosed)??)
    }

    /// Queue an extraction.
    pub async fn extract(&self, image: impl Into<FaceImage>) -> Result<Embedding, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WorkerRequest::Extract {
                image: image.into(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| WorkerError::ChannelClosed)??)
    }

    /// Current session state as last published by the worker.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }
}

/// Move `extractor` onto its own thread and return a handle to it.
///
/// The thread exits once every handle has been dropped.
pub fn spawn_extractor(mut extractor: EmbeddingExtractor) -> Result<ExtractorHandle, WorkerError> {
    let (tx, mut rx) = mpsc::channel::<WorkerRequest>(QUEUE_DEPTH);
    let (state_tx, state_rx) = watch::channel(extractor.state());

    std::thread::Builder::new()
        .name("facematch-extractor".into())
        .spawn(move || {
            tracing::info!("extractor thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    WorkerRequest::Load { source, reply } => {
                        state_tx.send_replace(SessionState::Loading);
                        let result = extractor.load(&source);
                        state_tx.send_replace(extractor.state());
                        let _ = reply.send(result);
                    }
                    WorkerRequest::Extract { image, reply } => {
                        let result = match &image {
                            FaceImage::Dynamic(img) => extractor.extract_feature(img),
                            FaceImage::Frame(frame) => extractor.extract_feature(frame),
                        };
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("extractor thread exiting");
        })?;

    Ok(ExtractorHandle { tx, state: state_rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::ExtractorConfig;
    use crate::session::testing::{model_bytes, MockEngine};
    use crate::session::SessionConfig;
    use image::{Rgba, RgbaImage};
    use std::time::Duration;

    fn handle() -> ExtractorHandle {
        handle_with(MockEngine::new(32))
    }

    fn handle_with(engine: MockEngine) -> ExtractorHandle {
        let config = ExtractorConfig {
            embedding_dim: Some(32),
            ..ExtractorConfig::default()
        };
        let extractor = EmbeddingExtractor::new(Box::new(engine), SessionConfig::default(), config).unwrap();
        spawn_extractor(extractor).unwrap()
    }

    fn face() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(112, 112, Rgba([90, 60, 30, 255])))
    }

    #[tokio::test]
    async fn test_extract_before_load() {
        let h = handle();
        assert_eq!(h.state(), SessionState::Unloaded);
        let err = h.extract(face()).await.unwrap_err();
        assert!(err.is_not_ready());
    }

    #[tokio::test]
    async fn test_load_then_extract() {
        let h = handle();
        h.load(model_bytes()).await.unwrap();
        assert_eq!(h.state(), SessionState::Ready);

        let e = h.extract(face()).await.unwrap();
        assert_eq!(e.len(), 32);

        let frame = RgbaFrame::new(vec![90; 4 * 4 * 4], 4, 4).unwrap();
        assert_eq!(h.extract(frame).await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_failed_load_published() {
        let h = handle();
        let mut states = h.watch_state();
        assert!(h.load(ModelSource::Memory(Vec::new())).await.is_err());
        assert_eq!(*states.borrow_and_update(), SessionState::Failed);

        h.load(model_bytes()).await.unwrap();
        assert_eq!(h.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_loading_visible_while_in_flight() {
        let mut engine = MockEngine::new(32);
        engine.load_delay = Duration::from_millis(300);
        let h = handle_with(engine);
        let mut states = h.watch_state();

        let loader = {
            let h = h.clone();
            tokio::spawn(async move { h.load(model_bytes()).await })
        };

        let seen = tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == SessionState::Loading),
        )
        .await
        .unwrap()
        .map(|s| *s)
        .unwrap();
        assert_eq!(seen, SessionState::Loading);
        assert_eq!(h.state(), SessionState::Loading);

        // Requests queued behind the load see the new model.
        assert_eq!(h.extract(face()).await.unwrap().len(), 32);
        loader.await.unwrap().unwrap();
        assert_eq!(h.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_concurrent_callers_are_serialized() {
        let h = handle();
        h.load(model_bytes()).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let h = h.clone();
                tokio::spawn(async move { h.extract(face()).await })
            })
            .collect();
        for t in tasks {
            assert_eq!(t.await.unwrap().unwrap().len(), 32);
        }
    }
}
