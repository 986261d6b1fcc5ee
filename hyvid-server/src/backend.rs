use std::{
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use candle_core::Device;
use hyvid_core::{
    InferTuning, Pipeline, PipelineError, PipelineFactory, PipelineInput, PipelineOutput,
    PipelineSpec,
};
use serde::Serialize;

/// Lines of generator stderr kept in error messages.
const STDERR_TAIL: usize = 20;

/// Runs generation in an external program, one process per request.
///
/// The program reads a JSON job from stdin and writes a safetensors file at
/// `output` holding a `videos` tensor and, when super-resolution ran, an
/// `sr_videos` tensor, both `(frames, 3, height, width)`.
pub struct SubprocessFactory {
    program: PathBuf,
    args: Vec<String>,
}

impl SubprocessFactory {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

// Tuning travels with each job, so there is no process-wide state to set up.
impl PipelineFactory for SubprocessFactory {
    fn create(&self, spec: &PipelineSpec) -> Result<Arc<dyn Pipeline>> {
        if self.program.components().count() > 1 && !self.program.exists() {
            anyhow::bail!("generator {} does not exist", self.program.display());
        }
        Ok(Arc::new(SubprocessPipeline {
            program: self.program.clone(),
            args: self.args.clone(),
            spec: spec.clone(),
        }))
    }
}

pub struct SubprocessPipeline {
    program: PathBuf,
    args: Vec<String>,
    spec: PipelineSpec,
}

#[derive(Serialize)]
struct Job<'a> {
    pipeline: &'a PipelineSpec,
    tuning: &'a InferTuning,
    input: &'a PipelineInput,
    output: &'a Path,
}

impl Pipeline for SubprocessPipeline {
    fn run(&self, input: &PipelineInput) -> Result<PipelineOutput, PipelineError> {
        let workdir = tempfile::tempdir().context("failed to create generator workdir")?;
        let output = workdir.path().join("frames.safetensors");
        let job = Job {
            pipeline: &self.spec,
            tuning: &input.tuning,
            input,
            output: &output,
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped());
        if let Some(rank) = self.spec.device_map.local_rank() {
            command.env("LOCAL_RANK", rank.to_string());
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn generator {}", self.program.display()))?;
        // a generator that dies early breaks the pipe; its exit status says why
        let sent = child
            .stdin
            .take()
            .context("generator stdin unavailable")
            .and_then(|mut stdin| {
                serde_json::to_writer(&mut stdin, &job)?;
                stdin.flush()?;
                Ok(())
            });
        let finished = child
            .wait_with_output()
            .context("failed to wait for generator")?;

        if !finished.status.success() {
            let stderr = String::from_utf8_lossy(&finished.stderr);
            let tail = tail(&stderr, STDERR_TAIL);
            if is_out_of_memory(&stderr) {
                return Err(PipelineError::OutOfMemory(tail));
            }
            return Err(anyhow!("generator exited with {}: {tail}", finished.status).into());
        }
        sent.context("failed to send job")?;

        let mut tensors = candle_core::safetensors::load(&output, &Device::Cpu)
            .context("failed to read generator output")?;
        let videos = tensors
            .remove("videos")
            .context("generator output has no `videos` tensor")?;
        Ok(PipelineOutput {
            videos,
            sr_videos: tensors.remove("sr_videos"),
        })
    }
}

fn is_out_of_memory(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("out of memory") || stderr.contains("outofmemoryerror")
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
