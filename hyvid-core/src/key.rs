use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{GenerateRequest, ValidationError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Bf16,
    Fp32,
}

/// Text-only or image-conditioned generation, derived from the request shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    T2v,
    I2v,
}

serde_plain::derive_display_from_serialize!(Resolution);
serde_plain::derive_fromstr_from_deserialize!(Resolution);
serde_plain::derive_display_from_serialize!(Precision);
serde_plain::derive_fromstr_from_deserialize!(Precision);
serde_plain::derive_display_from_serialize!(Task);

impl Resolution {
    /// The request's tier, or the error every caller reports for it.
    pub fn of(req: &GenerateRequest) -> Result<Self, ValidationError> {
        req.resolution
            .parse()
            .map_err(|_| ValidationError::UnsupportedResolution(req.resolution.clone()))
    }
}

impl Precision {
    pub fn of(req: &GenerateRequest) -> Result<Self, ValidationError> {
        req.dtype
            .parse()
            .map_err(|_| ValidationError::UnsupportedPrecision(req.dtype.clone()))
    }
}

impl Task {
    pub fn infer(req: &GenerateRequest) -> Self {
        if req.image_path.is_some() {
            Self::I2v
        } else {
            Self::T2v
        }
    }
}

/// Every request field that changes how a pipeline is constructed, and
/// nothing else. Prompts, seeds and step counts never appear here.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct PipelineKey {
    pub resolution: Resolution,
    pub task: Task,
    pub cfg_distilled: bool,
    pub sparse_attn: bool,
    pub sr: bool,
    pub dtype: Precision,
    pub offloading: bool,
    pub group_offloading: Option<bool>,
    pub overlap_group_offloading: bool,
    pub model_path: PathBuf,
}

impl PipelineKey {
    pub fn derive(req: &GenerateRequest, task: Task) -> Result<Self, ValidationError> {
        Ok(Self {
            resolution: Resolution::of(req)?,
            task,
            cfg_distilled: req.cfg_distilled,
            sparse_attn: req.sparse_attn,
            sr: req.sr,
            dtype: Precision::of(req)?,
            offloading: req.offloading,
            group_offloading: req.group_offloading,
            overlap_group_offloading: req.overlap_group_offloading,
            model_path: req.model_path.clone(),
        })
    }

    /// Name of the transformer checkpoint variant this key loads,
    /// e.g. `720p_i2v_distilled_sparse`.
    pub fn transformer_version(&self) -> String {
        let mut version = format!("{}_{}", self.resolution, self.task);
        if self.cfg_distilled {
            version.push_str("_distilled");
        }
        if self.sparse_attn {
            version.push_str("_sparse");
        }
        version
    }
}
