//! Inference adapter between encoded frames and the detection model.
//!
use std::{fmt, future::Future, sync::Arc};

use anyhow::Result;
use bytes::Bytes;
use common::detection::Detection;
use image::RgbImage;
use thiserror::Error;
use tokio::{
    sync::{watch, Semaphore},
    task::JoinHandle,
};

use crate::nn::DetectModel;

/// Tuning of the adapter, fixed for the lifetime of the process.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectConfig {
    /// Detections with a lower score are excluded.
    pub score_threshold: f32,
    /// Upper bound on the number of detections per frame.
    pub max_detections: usize,
    /// Number of frames which may run through the model at the same time.
    pub max_concurrent: usize,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            max_detections: 20,
            max_concurrent: 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("model is still loading")]
    NotReady,
    #[error("model failed to load: {0}")]
    ModelFailed(String),
    #[error("failed to decode image: {0}")]
    Decode(#[from] turbojpeg::Error),
    #[error("inference failed: {0}")]
    Inference(anyhow::Error),
    #[error("inference task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("detector is shutting down")]
    Closed,
}

/// Lifecycle of the process-wide model handle.
#[derive(Clone)]
pub enum ModelState {
    Loading,
    Ready(Arc<dyn DetectModel>),
    Failed(String),
}

impl fmt::Debug for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelState::Loading => write!(f, "Loading"),
            ModelState::Ready(_) => write!(f, "Ready"),
            ModelState::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

/// Decodes frames and runs them through the model once it is loaded.
pub struct Detector {
    config: DetectConfig,
    state_tx: watch::Sender<ModelState>,
    permits: Arc<Semaphore>,
}

impl Detector {
    /// Create a detector waiting for its model.
    pub fn new(config: DetectConfig) -> Self {
        let (state_tx, _) = watch::channel(ModelState::Loading);
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            state_tx,
            permits,
        }
    }

    /// Create a detector with an already loaded model.
    pub fn with_model(config: DetectConfig, model: Arc<dyn DetectModel>) -> Self {
        let detector = Self::new(config);
        detector.state_tx.send_replace(ModelState::Ready(model));
        detector
    }

    pub fn config(&self) -> &DetectConfig {
        &self.config
    }

    pub fn state(&self) -> ModelState {
        self.state_tx.borrow().clone()
    }

    /// Run the model loader in the background and publish its outcome.
    pub fn spawn_load<F>(self: &Arc<Self>, load: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<Arc<dyn DetectModel>>> + Send + 'static,
    {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            log::info!("Loading model...");
            let state = match load.await {
                Ok(model) => {
                    log::info!("Model ready");
                    ModelState::Ready(model)
                }
                Err(e) => {
                    log::error!("Failed to load model: {e:#}");
                    ModelState::Failed(format!("{e:#}"))
                }
            };
            detector.state_tx.send_replace(state);
        })
    }

    /// Wait until the model finished loading.
    pub async fn wait_ready(&self) -> Result<(), DetectError> {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            match &*state_rx.borrow_and_update() {
                ModelState::Ready(_) => return Ok(()),
                ModelState::Failed(reason) => return Err(DetectError::ModelFailed(reason.clone())),
                ModelState::Loading => (),
            }
            state_rx.changed().await.map_err(|_| DetectError::Closed)?;
        }
    }

    /// Detect objects on a JPEG encoded image.
    ///
    /// Calls made before the model is loaded are rejected with [`DetectError::NotReady`]. The
    /// result never holds more than `max_detections` entries and none below `score_threshold`.
    pub async fn detect(&self, jpeg: Bytes) -> Result<Vec<Detection>, DetectError> {
        let model = match &*self.state_tx.borrow() {
            ModelState::Ready(model) => Arc::clone(model),
            ModelState::Loading => return Err(DetectError::NotReady),
            ModelState::Failed(reason) => return Err(DetectError::ModelFailed(reason.clone())),
        };

        // Held by the model run itself, which outlives this future when the caller gives up
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DetectError::Closed)?;

        let max_detections = self.config.max_detections;
        let score_threshold = self.config.score_threshold;

        // The decoded image and all model buffers are dropped on the blocking thread
        let detections = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let image: RgbImage = turbojpeg::decompress_image(&jpeg)?;
            log::trace!("Decoded {}x{} frame", image.width(), image.height());
            model
                .detect(&image, max_detections, score_threshold)
                .map_err(DetectError::Inference)
        })
        .await??;

        Ok(limit_detections(detections, score_threshold, max_detections))
    }
}

/// Keep the most confident detections above the threshold.
fn limit_detections(
    mut detections: Vec<Detection>,
    score_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    detections.retain(|d| d.score >= score_threshold);
    if detections.len() > max_detections {
        detections.sort_by(|a, b| b.score.total_cmp(&a.score));
        detections.truncate(max_detections);
    }
    detections
}
