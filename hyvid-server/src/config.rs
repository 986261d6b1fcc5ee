use std::path::PathBuf;

use clap::Parser;
use hyvid_core::{DeviceMap, ServiceConfig};

// Define command line arguments
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "HunyuanVideo generation server")]
pub struct Args {
    /// Host address to bind the server to
    #[arg(long, env = "WRAPPER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, env = "WRAPPER_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Model artifact root used when a request does not name one
    #[arg(long, env = "HUNYUAN_MODEL_PATH", default_value = "ckpts")]
    pub model_path: PathBuf,

    /// Directory for outputs of requests without an explicit output_path
    #[arg(long, env = "HUNYUAN_OUTPUT_DIR", default_value = "outputs")]
    pub output_dir: PathBuf,

    /// Accelerator ordinal
    #[arg(long, env = "LOCAL_RANK", default_value_t = 0)]
    pub device: usize,

    /// Use CPU instead of GPU
    #[arg(long)]
    pub cpu: bool,

    /// Generator program run for every request
    #[arg(long, env = "HUNYUAN_GENERATOR", default_value = "hunyuan-generate")]
    pub generator: PathBuf,

    /// Extra argument passed to the generator, repeatable
    #[arg(long = "generator-arg", allow_hyphen_values = true)]
    pub generator_args: Vec<String>,

    /// ffmpeg binary used to encode outputs
    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// Output frame rate
    #[arg(long, default_value_t = 24)]
    pub fps: u32,

    /// Hub credential; only its presence is reported
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,
}

impl Args {
    pub fn device_map(&self) -> DeviceMap {
        if self.cpu {
            DeviceMap::ForceCpu
        } else {
            DeviceMap::Ordinal(self.device)
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            model_path: self.model_path.clone(),
            output_dir: self.output_dir.clone(),
            credential_present: self.hf_token.as_deref().is_some_and(|t| !t.is_empty()),
            device_map: self.device_map(),
        }
    }
}
