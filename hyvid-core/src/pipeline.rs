use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use candle_core::Tensor;
use serde::Serialize;
use thiserror::Error;

use crate::{DeviceMap, InferTuning, PipelineKey, Precision};

/// Construction parameters for one pipeline variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSpec {
    pub pretrained_model_name_or_path: PathBuf,
    pub transformer_version: String,
    pub create_sr_pipeline: bool,
    pub force_sparse_attn: bool,
    pub transformer_dtype: Precision,
    pub enable_offloading: bool,
    pub enable_group_offloading: Option<bool>,
    pub overlap_group_offloading: bool,
    pub device_map: DeviceMap,
}

impl PipelineSpec {
    pub fn for_key(key: &PipelineKey, device_map: DeviceMap) -> Self {
        Self {
            pretrained_model_name_or_path: key.model_path.clone(),
            transformer_version: key.transformer_version(),
            create_sr_pipeline: key.sr,
            force_sparse_attn: key.sparse_attn,
            transformer_dtype: key.dtype,
            enable_offloading: key.offloading,
            enable_group_offloading: key.group_offloading,
            overlap_group_offloading: key.overlap_group_offloading,
            device_map,
        }
    }
}

/// Per-run parameters. `reference_image` is only set for image-to-video.
/// `tuning` is the same value handed to `initialize_infer_state` for this
/// request, for backends that apply it per run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineInput {
    pub prompt: String,
    pub negative_prompt: String,
    pub aspect_ratio: String,
    pub num_inference_steps: i64,
    pub video_length: i64,
    pub seed: i64,
    pub enable_sr: bool,
    pub prompt_rewrite: bool,
    pub return_pre_sr_video: bool,
    pub reference_image: Option<PathBuf>,
    #[serde(skip)]
    pub tuning: InferTuning,
}

/// Raw frames, `(frames, 3, height, width)`. `sr_videos` is present when the
/// super-resolution stage ran.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub videos: Tensor,
    pub sr_videos: Option<Tensor>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("accelerator out of memory: {0}")]
    OutOfMemory(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A built pipeline. Shared across request workers and run concurrently
/// without extra locking, so implementations serialize internally if their
/// backend requires it.
pub trait Pipeline: Send + Sync {
    fn run(&self, input: &PipelineInput) -> Result<PipelineOutput, PipelineError>;
}

pub trait PipelineFactory: Send + Sync {
    /// Applies process-wide inference settings ahead of a run.
    fn initialize_infer_state(&self, _tuning: InferTuning) -> anyhow::Result<()> {
        Ok(())
    }

    /// Builds a pipeline. Expensive: called at most once per cache key.
    fn create(&self, spec: &PipelineSpec) -> anyhow::Result<Arc<dyn Pipeline>>;
}

/// Persists frames to a media file.
pub trait VideoWriter: Send + Sync {
    fn save(&self, frames: &Tensor, path: &Path) -> anyhow::Result<()>;
}
