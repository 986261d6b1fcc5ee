use std::{
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{Context, Result};
use candle_core::Tensor;
use hyvid_core::{frames_to_rgb24, VideoWriter};

/// Encodes frames to H.264 by piping raw rgb24 into ffmpeg.
pub struct FfmpegWriter {
    program: PathBuf,
    fps: u32,
}

impl FfmpegWriter {
    pub fn new(program: PathBuf, fps: u32) -> Self {
        Self { program, fps }
    }

    fn command(&self, width: usize, height: usize, path: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(["-y", "-loglevel", "error", "-f", "rawvideo", "-pix_fmt", "rgb24"])
            .arg("-s")
            .arg(format!("{width}x{height}"))
            .arg("-r")
            .arg(self.fps.to_string())
            .args(["-i", "-", "-c:v", "libx264", "-pix_fmt", "yuv420p"])
            // yuv420p needs even dimensions
            .args(["-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        command
    }
}

impl VideoWriter for FfmpegWriter {
    fn save(&self, frames: &Tensor, path: &Path) -> Result<()> {
        let (width, height, pixels) = frames_to_rgb24(frames)?;
        let mut child = self
            .command(width, height, path)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;

        // ffmpeg exiting early breaks the pipe; its own status says why
        let written = child
            .stdin
            .take()
            .context("ffmpeg stdin unavailable")?
            .write_all(&pixels);
        let finished = child.wait_with_output().context("failed to wait for ffmpeg")?;
        if !finished.status.success() {
            anyhow::bail!(
                "ffmpeg exited with {}: {}",
                finished.status,
                String::from_utf8_lossy(&finished.stderr).trim()
            );
        }
        written.context("failed to stream frames to ffmpeg")?;
        Ok(())
    }
}
