use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::{Result, ServiceError};

pub const DEFAULT_RESOLUTION: &str = "480p";
pub const DEFAULT_ASPECT_RATIO: &str = "16:9";
pub const DEFAULT_DTYPE: &str = "bf16";
/// Frame count the transformer was trained for.
pub const OPTIMAL_VIDEO_LENGTH: i64 = 121;

/// One generation job, fully defaulted. Immutable once normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub render_request_id: String,
    pub negative_prompt: String,
    pub resolution: String,
    pub aspect_ratio: String,
    pub num_inference_steps: i64,
    pub video_length: i64,
    pub seed: i64,
    pub image_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub sr: bool,
    pub save_pre_sr_video: bool,
    pub rewrite: bool,
    pub cfg_distilled: bool,
    pub sparse_attn: bool,
    pub offloading: bool,
    pub group_offloading: Option<bool>,
    pub overlap_group_offloading: bool,
    pub dtype: String,
    pub use_sageattn: bool,
    pub sage_blocks_range: String,
    pub enable_torch_compile: bool,
    pub enable_cache: bool,
    pub cache_type: String,
    pub no_cache_block_id: String,
    pub cache_start_step: i64,
    pub cache_end_step: i64,
    pub total_steps: i64,
    pub cache_step_interval: i64,
    pub model_path: PathBuf,
}

/// Knobs for the process-wide inference state (step caching, attention
/// kernels, compilation). Applied before every pipeline lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InferTuning {
    pub enable_cache: bool,
    pub cache_type: String,
    pub no_cache_block_id: String,
    pub cache_start_step: i64,
    pub cache_end_step: i64,
    pub total_steps: i64,
    pub cache_step_interval: i64,
    pub enable_torch_compile: bool,
    pub sage_blocks_range: String,
    pub use_sageattn: bool,
}

impl GenerateRequest {
    /// Normalizes an untrusted JSON payload. `prompt` and `render_request_id`
    /// are required, unknown keys are ignored, everything else is defaulted.
    pub fn from_json(payload: &Value, default_model_path: &Path) -> Result<Self> {
        let fields = Fields::new(payload)?;
        let prompt = fields.required_str("prompt")?;
        let render_request_id = fields.required_str("render_request_id")?;

        Ok(Self {
            prompt,
            render_request_id,
            negative_prompt: fields.str_or("negative_prompt", "")?,
            resolution: fields.str_or("resolution", DEFAULT_RESOLUTION)?,
            aspect_ratio: fields.str_or("aspect_ratio", DEFAULT_ASPECT_RATIO)?,
            num_inference_steps: fields.int_or("num_inference_steps", 50)?,
            video_length: fields.int_or("video_length", OPTIMAL_VIDEO_LENGTH)?,
            seed: fields.int_or("seed", 123)?,
            image_path: fields.path("image_path")?,
            output_path: fields.path("output_path")?,
            sr: fields.bool_or("sr", true)?,
            save_pre_sr_video: fields.bool_or("save_pre_sr_video", false)?,
            rewrite: fields.bool_or("rewrite", true)?,
            cfg_distilled: fields.bool_or("cfg_distilled", false)?,
            sparse_attn: fields.bool_or("sparse_attn", false)?,
            offloading: fields.bool_or("offloading", false)?,
            group_offloading: fields.bool("group_offloading")?,
            overlap_group_offloading: fields.bool_or("overlap_group_offloading", false)?,
            dtype: fields.str_or("dtype", DEFAULT_DTYPE)?,
            use_sageattn: fields.bool_or("use_sageattn", false)?,
            sage_blocks_range: fields.str_or("sage_blocks_range", "0-53")?,
            enable_torch_compile: fields.bool_or("enable_torch_compile", false)?,
            enable_cache: fields.bool_or("enable_cache", false)?,
            cache_type: fields.str_or("cache_type", "deepcache")?,
            no_cache_block_id: fields.str_or("no_cache_block_id", "53")?,
            cache_start_step: fields.int_or("cache_start_step", 11)?,
            cache_end_step: fields.int_or("cache_end_step", 45)?,
            total_steps: fields.int_or("total_steps", 50)?,
            cache_step_interval: fields.int_or("cache_step_interval", 4)?,
            model_path: fields
                .path("model_path")?
                .unwrap_or_else(|| default_model_path.to_path_buf()),
        })
    }

    pub fn infer_tuning(&self) -> InferTuning {
        InferTuning {
            enable_cache: self.enable_cache,
            cache_type: self.cache_type.clone(),
            no_cache_block_id: self.no_cache_block_id.clone(),
            cache_start_step: self.cache_start_step,
            cache_end_step: self.cache_end_step,
            total_steps: self.total_steps,
            cache_step_interval: self.cache_step_interval,
            enable_torch_compile: self.enable_torch_compile,
            sage_blocks_range: self.sage_blocks_range.clone(),
            use_sageattn: self.use_sageattn,
        }
    }
}

/// Typed, coercing accessors over a JSON object. `null` reads as absent.
struct Fields<'a>(&'a Map<String, Value>);

impl<'a> Fields<'a> {
    fn new(payload: &'a Value) -> Result<Self> {
        payload
            .as_object()
            .map(Self)
            .ok_or(ServiceError::MalformedField {
                field: "body",
                expected: "a JSON object",
            })
    }

    fn get(&self, field: &str) -> Option<&'a Value> {
        self.0.get(field).filter(|value| !value.is_null())
    }

    fn required_str(&self, field: &'static str) -> Result<String> {
        match self.get(field) {
            Some(value) => as_string(field, value),
            None => Err(ServiceError::MissingField(field)),
        }
    }

    fn str_or(&self, field: &'static str, default: &str) -> Result<String> {
        self.get(field)
            .map_or_else(|| Ok(default.to_string()), |value| as_string(field, value))
    }

    /// Empty strings count as absent, matching how an unset path is sent.
    fn path(&self, field: &'static str) -> Result<Option<PathBuf>> {
        let Some(value) = self.get(field) else {
            return Ok(None);
        };
        let raw = as_string(field, value)?;
        Ok((!raw.is_empty()).then(|| PathBuf::from(raw)))
    }

    fn int_or(&self, field: &'static str, default: i64) -> Result<i64> {
        let Some(value) = self.get(field) else {
            return Ok(default);
        };
        let parsed = match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        parsed.ok_or(ServiceError::MalformedField {
            field,
            expected: "an integer",
        })
    }

    fn bool(&self, field: &'static str) -> Result<Option<bool>> {
        let Some(value) = self.get(field) else {
            return Ok(None);
        };
        let parsed = match value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        };
        parsed.map(Some).ok_or(ServiceError::MalformedField {
            field,
            expected: "a boolean",
        })
    }

    fn bool_or(&self, field: &'static str, default: bool) -> Result<bool> {
        Ok(self.bool(field)?.unwrap_or(default))
    }
}

fn as_string(field: &'static str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(ServiceError::MalformedField {
            field,
            expected: "a string",
        }),
    }
}
