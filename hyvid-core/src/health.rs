use std::path::Path;

use serde::Serialize;

use crate::{missing_artifacts, PipelineKey};

/// Readiness of the default model root plus what has been built so far.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub ready: bool,
    pub missing_artifacts: Vec<String>,
    pub credential_present: bool,
    pub cache_keys: Vec<PipelineKey>,
}

impl HealthReport {
    pub fn collect(
        model_path: &Path,
        credential_present: bool,
        cache_keys: Vec<PipelineKey>,
    ) -> Self {
        let missing_artifacts = missing_artifacts(model_path);
        Self {
            ready: missing_artifacts.is_empty(),
            missing_artifacts,
            credential_present,
            cache_keys,
        }
    }
}
