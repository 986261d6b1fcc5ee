use std::path::Path;

use crate::{GenerateRequest, Precision, Resolution, Result, ServiceError, ValidationError};

/// Paths, relative to the model root, that must exist before any pipeline
/// can be built.
pub const REQUIRED_ARTIFACTS: [&str; 7] = [
    "vision_encoder/siglip",
    "text_encoder/Glyph-SDXL-v2",
    "text_encoder/llm",
    "text_encoder/byt5",
    "vae",
    "transformer",
    "scheduler/scheduler_config.json",
];

/// Every checklist entry missing under `model_path`, in checklist order.
pub fn missing_artifacts(model_path: &Path) -> Vec<String> {
    REQUIRED_ARTIFACTS
        .iter()
        .filter(|rel| !model_path.join(rel).exists())
        .map(|rel| rel.to_string())
        .collect()
}

/// Rejects a request before any expensive work. The first user-input problem
/// wins; the artifact check runs last and reports everything it finds.
pub fn validate(req: &GenerateRequest) -> Result<()> {
    check_input(req)?;
    let missing = missing_artifacts(&req.model_path);
    if !missing.is_empty() {
        return Err(ServiceError::MissingArtifacts(missing));
    }
    Ok(())
}

fn check_input(req: &GenerateRequest) -> Result<(), ValidationError> {
    if req.prompt.trim().is_empty() {
        return Err(ValidationError::EmptyPrompt);
    }
    let resolution = Resolution::of(req)?;
    Precision::of(req)?;
    if req.sparse_attn && resolution != Resolution::P720 {
        return Err(ValidationError::SparseAttentionRequires720p);
    }
    if req.video_length <= 0 {
        return Err(ValidationError::NotPositive("video_length"));
    }
    if req.num_inference_steps <= 0 {
        return Err(ValidationError::NotPositive("num_inference_steps"));
    }
    if let Some(image) = &req.image_path {
        if !image.exists() {
            return Err(ValidationError::ImageNotFound(image.display().to_string()));
        }
    }
    Ok(())
}
