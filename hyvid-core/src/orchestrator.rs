use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;

use crate::{
    sha256_file, validate, DeviceMap, GenerateRequest, HealthReport, Pipeline, PipelineCache,
    PipelineError, PipelineFactory, PipelineInput, PipelineKey, PipelineOutput, PipelineSpec,
    Resolution, Result, ServiceError, Task, VideoWriter, OPTIMAL_VIDEO_LENGTH,
};

/// Process settings, read once at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Artifact root used when a request names none, and the one health reports on.
    pub model_path: PathBuf,
    /// Where outputs land when a request names no `output_path`.
    pub output_dir: PathBuf,
    pub credential_present: bool,
    pub device_map: DeviceMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerateResult {
    pub output_path: PathBuf,
    pub pre_sr_output_path: Option<PathBuf>,
    pub checksum_sha256: String,
    pub duration_seconds: f64,
    pub transformer_version: String,
    pub resolution: Resolution,
    pub task: Task,
    pub sr_enabled: bool,
    pub warnings: Vec<String>,
}

/// Observability hook: percentage and phase label.
pub type Progress<'a> = &'a (dyn Fn(u8, &str) + Sync);

/// Drives a request from validation to a checksummed output file, building
/// pipelines on demand and reusing them for every compatible request.
///
/// There is no timeout around a pipeline run: a stuck run blocks its worker
/// until the backend returns.
pub struct Orchestrator {
    config: ServiceConfig,
    factory: Arc<dyn PipelineFactory>,
    writer: Arc<dyn VideoWriter>,
    pipelines: PipelineCache<PipelineKey, Arc<dyn Pipeline>>,
}

impl Orchestrator {
    pub fn new(
        config: ServiceConfig,
        factory: Arc<dyn PipelineFactory>,
        writer: Arc<dyn VideoWriter>,
    ) -> Self {
        Self {
            config,
            factory,
            writer,
            pipelines: PipelineCache::new(),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn normalize(&self, payload: &Value) -> Result<GenerateRequest> {
        GenerateRequest::from_json(payload, &self.config.model_path)
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::collect(
            &self.config.model_path,
            self.config.credential_present,
            self.pipelines.keys(),
        )
    }

    pub fn execute(
        &self,
        req: &GenerateRequest,
        progress: Option<Progress<'_>>,
    ) -> Result<GenerateResult> {
        validate(req)?;
        let task = Task::infer(req);
        let warnings = advisories(req);
        let output_path = self.output_path(req)?;

        let tuning = req.infer_tuning();
        self.factory
            .initialize_infer_state(tuning.clone())
            .context("failed to initialize inference state")?;
        let key = PipelineKey::derive(req, task)?;
        let pipeline = self.pipeline(&key)?;

        if let Some(progress) = progress {
            progress(0, "started");
        }

        let input = PipelineInput {
            prompt: req.prompt.clone(),
            negative_prompt: req.negative_prompt.clone(),
            aspect_ratio: req.aspect_ratio.clone(),
            num_inference_steps: req.num_inference_steps,
            video_length: req.video_length,
            seed: req.seed,
            enable_sr: req.sr,
            prompt_rewrite: req.rewrite,
            return_pre_sr_video: req.save_pre_sr_video,
            reference_image: match task {
                Task::I2v => req.image_path.clone(),
                Task::T2v => None,
            },
            tuning,
        };

        let start = Instant::now();
        let output = pipeline.run(&input).map_err(|err| match err {
            PipelineError::OutOfMemory(detail) => {
                log::warn!("out of memory on {}: {detail}", key.transformer_version());
                ServiceError::ResourceExhausted("CUDA OOM during generation".to_string())
            }
            PipelineError::Other(err) => {
                ServiceError::ExecutionFailed(format!("Pipeline execution failed: {err:#}"))
            }
        })?;
        let duration = start.elapsed();

        let (sr_enabled, pre_sr_output_path) = self
            .persist(req, &output, &output_path)
            .map_err(|err| ServiceError::ExecutionFailed(format!("Failed to save video: {err:#}")))?;
        let checksum_sha256 = sha256_file(&output_path).map_err(|err| {
            ServiceError::ExecutionFailed(format!(
                "Failed to checksum {}: {err}",
                output_path.display()
            ))
        })?;

        if let Some(progress) = progress {
            progress(100, "completed");
        }

        Ok(GenerateResult {
            output_path,
            pre_sr_output_path,
            checksum_sha256,
            duration_seconds: duration.as_secs_f64(),
            transformer_version: key.transformer_version(),
            resolution: key.resolution,
            task,
            sr_enabled,
            warnings,
        })
    }

    fn pipeline(&self, key: &PipelineKey) -> Result<Arc<dyn Pipeline>> {
        let pipeline = self.pipelines.get_or_build(key, |key| {
            let spec = PipelineSpec::for_key(key, self.config.device_map);
            log::info!(
                "loading pipeline variant={} sr={} offload={} group_offload={:?} overlap_group_offload={} dtype={}",
                spec.transformer_version,
                spec.create_sr_pipeline,
                spec.enable_offloading,
                spec.enable_group_offloading,
                spec.overlap_group_offloading,
                spec.transformer_dtype,
            );
            let started = Instant::now();
            let pipeline = self
                .factory
                .create(&spec)
                .with_context(|| format!("failed to build pipeline {}", spec.transformer_version))?;
            log::info!(
                "pipeline {} ready in {:.1}s",
                spec.transformer_version,
                started.elapsed().as_secs_f64()
            );
            anyhow::Ok(pipeline)
        })?;
        Ok(pipeline)
    }

    fn output_path(&self, req: &GenerateRequest) -> Result<PathBuf> {
        let path = match &req.output_path {
            Some(path) => path.clone(),
            None => self
                .config
                .output_dir
                .join(format!("{}.mp4", req.render_request_id)),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create output directory {}", parent.display()))?;
        }
        Ok(path)
    }

    /// Writes the primary video and, when asked for, the pre-SR video.
    /// Returns whether the super-resolved frames became the primary output.
    fn persist(
        &self,
        req: &GenerateRequest,
        output: &PipelineOutput,
        path: &Path,
    ) -> anyhow::Result<(bool, Option<PathBuf>)> {
        match (&output.sr_videos, req.sr) {
            (Some(sr_videos), true) => {
                self.writer.save(sr_videos, path)?;
                if !req.save_pre_sr_video {
                    return Ok((true, None));
                }
                let pre_sr = pre_sr_path(path);
                self.writer.save(&output.videos, &pre_sr)?;
                Ok((true, Some(pre_sr)))
            }
            _ => {
                self.writer.save(&output.videos, path)?;
                Ok((false, None))
            }
        }
    }
}

fn advisories(req: &GenerateRequest) -> Vec<String> {
    let mut warnings = Vec::new();
    if req.video_length != OPTIMAL_VIDEO_LENGTH {
        warnings.push(format!(
            "video_length != {OPTIMAL_VIDEO_LENGTH}; best quality is {OPTIMAL_VIDEO_LENGTH} frames"
        ));
    }
    if !req.rewrite {
        warnings.push("prompt rewrite disabled; quality may degrade".to_string());
    }
    warnings
}

/// `out/clip.mp4` -> `out/clip_before_sr.mp4`
fn pre_sr_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_before_sr.{}", ext.to_string_lossy()),
        None => format!("{stem}_before_sr"),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier, Mutex,
        },
        thread,
    };

    use candle_core::{Device, Tensor};
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::{validate::tests::provisioned_root, InferTuning};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Frames,
        NoSrFrames,
        OutOfMemory,
        Crash,
    }

    struct StubPipeline {
        behaviour: Behaviour,
        inputs: Arc<Mutex<Vec<PipelineInput>>>,
    }

    impl Pipeline for StubPipeline {
        fn run(&self, input: &PipelineInput) -> Result<PipelineOutput, PipelineError> {
            self.inputs.lock().unwrap().push(input.clone());
            let frames = |value: u8, side: usize| {
                Tensor::full(value, (2, 3, side, side), &Device::Cpu).map_err(anyhow::Error::from)
            };
            match self.behaviour {
                Behaviour::Frames => Ok(PipelineOutput {
                    videos: frames(1, 2)?,
                    sr_videos: Some(frames(2, 4)?),
                }),
                Behaviour::NoSrFrames => Ok(PipelineOutput {
                    videos: frames(1, 2)?,
                    sr_videos: None,
                }),
                Behaviour::OutOfMemory => Err(PipelineError::OutOfMemory("tried to allocate 20 GiB".into())),
                Behaviour::Crash => Err(anyhow::anyhow!("denoiser diverged").into()),
            }
        }
    }

    struct StubFactory {
        behaviour: Behaviour,
        builds: AtomicUsize,
        failing_builds: AtomicUsize,
        specs: Mutex<Vec<PipelineSpec>>,
        tunings: Mutex<Vec<InferTuning>>,
        inputs: Arc<Mutex<Vec<PipelineInput>>>,
    }

    impl StubFactory {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                builds: AtomicUsize::new(0),
                failing_builds: AtomicUsize::new(0),
                specs: Mutex::default(),
                tunings: Mutex::default(),
                inputs: Arc::default(),
            })
        }

        fn builds(&self) -> usize {
            self.builds.load(Ordering::SeqCst)
        }
    }

    impl PipelineFactory for StubFactory {
        fn initialize_infer_state(&self, tuning: InferTuning) -> anyhow::Result<()> {
            self.tunings.lock().unwrap().push(tuning);
            Ok(())
        }

        fn create(&self, spec: &PipelineSpec) -> anyhow::Result<Arc<dyn Pipeline>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            self.specs.lock().unwrap().push(spec.clone());
            if self
                .failing_builds
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("weights truncated");
            }
            Ok(Arc::new(StubPipeline {
                behaviour: self.behaviour,
                inputs: Arc::clone(&self.inputs),
            }))
        }
    }

    /// Dumps the raw frame bytes.
    struct RawWriter {
        fail: bool,
    }

    impl VideoWriter for RawWriter {
        fn save(&self, frames: &Tensor, path: &Path) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("disk full");
            }
            fs::write(path, frames.flatten_all()?.to_vec1::<u8>()?)?;
            Ok(())
        }
    }

    struct Harness {
        models: TempDir,
        outputs: TempDir,
        factory: Arc<StubFactory>,
        orchestrator: Orchestrator,
    }

    impl Harness {
        fn new(behaviour: Behaviour) -> Self {
            Self::with_writer(behaviour, RawWriter { fail: false })
        }

        fn with_writer(behaviour: Behaviour, writer: RawWriter) -> Self {
            let models = provisioned_root();
            let outputs = TempDir::new().unwrap();
            let factory = StubFactory::new(behaviour);
            let config = ServiceConfig {
                model_path: models.path().to_path_buf(),
                output_dir: outputs.path().join("videos"),
                credential_present: false,
                device_map: DeviceMap::ForceCpu,
            };
            let orchestrator = Orchestrator::new(config, factory.clone(), Arc::new(writer));
            Self {
                models,
                outputs,
                factory,
                orchestrator,
            }
        }

        fn request(&self, payload: Value) -> GenerateRequest {
            self.orchestrator.normalize(&payload).unwrap()
        }

        fn run(&self, payload: Value) -> Result<GenerateResult> {
            self.orchestrator.execute(&self.request(payload), None)
        }
    }

    #[test]
    fn text_request_with_defaults() {
        let h = Harness::new(Behaviour::Frames);
        let result = h
            .run(json!({"prompt": "a cat", "render_request_id": "r1"}))
            .unwrap();

        let expected_path = h.outputs.path().join("videos").join("r1.mp4");
        assert_eq!(result.output_path, expected_path);
        assert_eq!(result.task, Task::T2v);
        assert_eq!(result.resolution, Resolution::P480);
        assert_eq!(result.transformer_version, "480p_t2v");
        assert!(result.sr_enabled);
        assert!(result.warnings.is_empty());
        assert_eq!(result.pre_sr_output_path, None);
        assert_eq!(result.checksum_sha256, sha256_file(&expected_path).unwrap());
        // super-resolved frames are the primary output
        assert_eq!(fs::read(&expected_path).unwrap(), vec![2u8; 2 * 3 * 4 * 4]);

        let inputs = h.factory.inputs.lock().unwrap();
        assert_eq!(inputs[0].prompt, "a cat");
        assert_eq!(inputs[0].reference_image, None);
        let specs = h.factory.specs.lock().unwrap();
        assert_eq!(specs[0].pretrained_model_name_or_path, h.models.path());
        assert!(specs[0].create_sr_pipeline);
    }

    #[test]
    fn non_default_settings_raise_advisories() {
        let h = Harness::new(Behaviour::Frames);
        let result = h
            .run(json!({
                "prompt": "a cat",
                "render_request_id": "r1",
                "video_length": 60,
                "rewrite": false,
            }))
            .unwrap();
        assert_eq!(result.warnings.len(), 2);
        assert!(result.warnings[0].contains("video_length"));
        assert!(result.warnings[1].contains("rewrite"));
    }

    #[test]
    fn reference_image_selects_image_to_video() {
        let h = Harness::new(Behaviour::Frames);
        let image = h.outputs.path().join("ref.png");
        fs::write(&image, b"png").unwrap();

        let result = h
            .run(json!({
                "prompt": "a cat",
                "render_request_id": "r1",
                "image_path": image.to_str().unwrap(),
            }))
            .unwrap();
        assert_eq!(result.task, Task::I2v);
        assert_eq!(result.transformer_version, "480p_i2v");
        let inputs = h.factory.inputs.lock().unwrap();
        assert_eq!(inputs[0].reference_image.as_deref(), Some(image.as_path()));
        assert_eq!(h.orchestrator.health().cache_keys[0].task, Task::I2v);
    }

    #[test]
    fn pre_sr_video_lands_next_to_the_output() {
        let h = Harness::new(Behaviour::Frames);
        let target = h.outputs.path().join("nested/dir/clip.mp4");
        let result = h
            .run(json!({
                "prompt": "a cat",
                "render_request_id": "r1",
                "output_path": target.to_str().unwrap(),
                "save_pre_sr_video": true,
            }))
            .unwrap();
        assert_eq!(result.output_path, target);
        let pre_sr = h.outputs.path().join("nested/dir/clip_before_sr.mp4");
        assert_eq!(result.pre_sr_output_path.as_deref(), Some(pre_sr.as_path()));
        assert_eq!(fs::read(&pre_sr).unwrap(), vec![1u8; 2 * 3 * 2 * 2]);
    }

    #[test]
    fn base_frames_are_written_without_sr() {
        let h = Harness::new(Behaviour::Frames);
        let result = h
            .run(json!({"prompt": "a cat", "render_request_id": "r1", "sr": false, "save_pre_sr_video": true}))
            .unwrap();
        assert!(!result.sr_enabled);
        assert_eq!(result.pre_sr_output_path, None);
        assert_eq!(fs::read(&result.output_path).unwrap(), vec![1u8; 2 * 3 * 2 * 2]);

        let h = Harness::new(Behaviour::NoSrFrames);
        let result = h
            .run(json!({"prompt": "a cat", "render_request_id": "r2"}))
            .unwrap();
        assert!(!result.sr_enabled);
    }

    #[test]
    fn compatible_requests_share_one_build() {
        let h = Harness::new(Behaviour::Frames);
        let barrier = Barrier::new(6);
        thread::scope(|scope| {
            for i in 0..6 {
                let h = &h;
                let barrier = &barrier;
                scope.spawn(move || {
                    let req = h.request(json!({
                        "prompt": format!("prompt {i}"),
                        "render_request_id": format!("r{i}"),
                        "seed": i,
                    }));
                    barrier.wait();
                    h.orchestrator.execute(&req, None).unwrap();
                });
            }
        });
        assert_eq!(h.factory.builds(), 1);
        assert_eq!(h.factory.inputs.lock().unwrap().len(), 6);

        h.run(json!({"prompt": "a cat", "render_request_id": "r9", "dtype": "fp32"}))
            .unwrap();
        assert_eq!(h.factory.builds(), 2);
        assert_eq!(h.orchestrator.health().cache_keys.len(), 2);
    }

    #[test]
    fn out_of_memory_is_retryable() {
        let h = Harness::new(Behaviour::OutOfMemory);
        let err = h
            .run(json!({"prompt": "a cat", "render_request_id": "r1"}))
            .unwrap_err();
        assert!(matches!(err, ServiceError::ResourceExhausted(_)));
        assert!(err.retryable());
    }

    #[test]
    fn pipeline_failures_pass_their_message_through() {
        let h = Harness::new(Behaviour::Crash);
        let err = h
            .run(json!({"prompt": "a cat", "render_request_id": "r1"}))
            .unwrap_err();
        assert!(matches!(err, ServiceError::ExecutionFailed(_)));
        assert!(!err.retryable());
        assert!(err.to_string().contains("denoiser diverged"));
    }

    #[test]
    fn save_failures_are_execution_failures() {
        let h = Harness::with_writer(Behaviour::Frames, RawWriter { fail: true });
        let err = h
            .run(json!({"prompt": "a cat", "render_request_id": "r1"}))
            .unwrap_err();
        assert!(matches!(err, ServiceError::ExecutionFailed(_)));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn failed_builds_are_not_cached() {
        let h = Harness::new(Behaviour::Frames);
        h.factory.failing_builds.store(1, Ordering::SeqCst);

        let err = h
            .run(json!({"prompt": "a cat", "render_request_id": "r1"}))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Internal(_)));
        assert!(h.orchestrator.health().cache_keys.is_empty());

        h.run(json!({"prompt": "a cat", "render_request_id": "r1"}))
            .unwrap();
        assert_eq!(h.factory.builds(), 2);
    }

    #[test]
    fn invalid_requests_never_touch_the_factory() {
        let h = Harness::new(Behaviour::Frames);
        let err = h
            .run(json!({"prompt": "a cat", "render_request_id": "r1", "sparse_attn": true}))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        fs::remove_dir_all(h.models.path().join("transformer")).unwrap();
        let err = h
            .run(json!({"prompt": "a cat", "render_request_id": "r1"}))
            .unwrap_err();
        assert!(matches!(err, ServiceError::MissingArtifacts(_)));

        assert_eq!(h.factory.builds(), 0);
        assert!(h.factory.tunings.lock().unwrap().is_empty());
    }

    #[test]
    fn tuning_reaches_the_factory() {
        let h = Harness::new(Behaviour::Frames);
        h.run(json!({
            "prompt": "a cat",
            "render_request_id": "r1",
            "enable_cache": true,
            "use_sageattn": true,
        }))
        .unwrap();
        let tunings = h.factory.tunings.lock().unwrap();
        assert!(tunings[0].enable_cache);
        assert!(tunings[0].use_sageattn);
        // the run sees its own request's settings, not whatever was applied last
        let inputs = h.factory.inputs.lock().unwrap();
        assert_eq!(inputs[0].tuning, tunings[0]);
    }

    #[test]
    fn progress_brackets_the_run() {
        let h = Harness::new(Behaviour::Frames);
        let events = Mutex::new(Vec::new());
        let record = |pct: u8, phase: &str| events.lock().unwrap().push((pct, phase.to_string()));
        let req = h.request(json!({"prompt": "a cat", "render_request_id": "r1"}));
        h.orchestrator.execute(&req, Some(&record)).unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec![(0, "started".to_string()), (100, "completed".to_string())]
        );
    }

    #[test]
    fn health_reports_the_default_root() {
        let h = Harness::new(Behaviour::Frames);
        let report = h.orchestrator.health();
        assert!(report.ready);
        assert!(report.missing_artifacts.is_empty());
        assert!(!report.credential_present);

        fs::remove_dir_all(h.models.path().join("transformer")).unwrap();
        let report = h.orchestrator.health();
        assert!(!report.ready);
        assert_eq!(report.missing_artifacts, vec!["transformer".to_string()]);
    }

    #[test]
    fn pre_sr_name_keeps_the_extension() {
        assert_eq!(
            pre_sr_path(Path::new("/tmp/out/clip.mp4")),
            PathBuf::from("/tmp/out/clip_before_sr.mp4")
        );
        assert_eq!(
            pre_sr_path(Path::new("clip")),
            PathBuf::from("clip_before_sr")
        );
    }
}
