//! Recording mock engine shared by the integration tests.

#![allow(dead_code)]

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use easel_core::{
    DType, Device, DeviceMap, GenerationParams, LoadSpec, Loader, Pipeline, SessionManager,
    SessionOptions,
};
use image::{DynamicImage, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::Rng;
use tempfile::TempDir;

/// Prompt that makes the mock pipeline return an error.
pub const FAILING_PROMPT: &str = "fail";
/// Prompt that makes the mock pipeline panic.
pub const PANICKING_PROMPT: &str = "panic";

/// What the engine saw during one `generate` call.
#[derive(Debug, Clone)]
pub struct GenerateCall {
    pub model: String,
    pub params: GenerationParams,
    /// First value drawn from the RNG handed to the pipeline.
    pub first_draw: u64,
}

#[derive(Default)]
pub struct Recorder {
    loads: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    fail_loads: AtomicBool,
    supports_memory_efficient_attention: AtomicBool,
    specs: Mutex<Vec<LoadSpec>>,
    calls: Mutex<Vec<GenerateCall>>,
}

impl Recorder {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Pipelines constructed and not yet dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn specs(&self) -> Vec<LoadSpec> {
        self.specs.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<GenerateCall> {
        self.calls.lock().unwrap().clone()
    }
}

pub struct MockLoader {
    recorder: Arc<Recorder>,
}

impl MockLoader {
    pub fn new() -> (Self, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let loader = Self {
            recorder: recorder.clone(),
        };
        (loader, recorder)
    }

    pub fn with_memory_efficient_attention() -> (Self, Arc<Recorder>) {
        let (loader, recorder) = Self::new();
        recorder
            .supports_memory_efficient_attention
            .store(true, Ordering::SeqCst);
        (loader, recorder)
    }
}

impl Loader for MockLoader {
    fn supports_memory_efficient_attention(&self, _device: &Device, _dtype: DType) -> bool {
        self.recorder
            .supports_memory_efficient_attention
            .load(Ordering::SeqCst)
    }

    fn load(&self, spec: &LoadSpec) -> Result<Box<dyn Pipeline>> {
        self.recorder.loads.fetch_add(1, Ordering::SeqCst);
        self.recorder.specs.lock().unwrap().push(spec.clone());
        if self.recorder.fail_loads.load(Ordering::SeqCst) {
            bail!("weights are corrupt");
        }
        let live = self.recorder.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.max_live.fetch_max(live, Ordering::SeqCst);
        let model = spec
            .weights
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Box::new(MockPipeline {
            model,
            recorder: self.recorder.clone(),
        }))
    }
}

struct MockPipeline {
    model: String,
    recorder: Arc<Recorder>,
}

impl Pipeline for MockPipeline {
    fn generate(&mut self, params: &GenerationParams, rng: &mut StdRng) -> Result<DynamicImage> {
        let first_draw: u64 = rng.gen();
        self.recorder.calls.lock().unwrap().push(GenerateCall {
            model: self.model.clone(),
            params: params.clone(),
            first_draw,
        });
        match params.prompt() {
            FAILING_PROMPT => bail!("out of memory"),
            PANICKING_PROMPT => panic!("shape mismatch"),
            _ => {}
        }
        let pixel = Rgb([first_draw as u8, (first_draw >> 8) as u8, (first_draw >> 16) as u8]);
        let image = RgbImage::from_pixel(params.width() as u32, params.height() as u32, pixel);
        Ok(DynamicImage::ImageRgb8(image))
    }
}

impl Drop for MockPipeline {
    fn drop(&mut self) {
        self.recorder.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Model roots on disk: repositories `sd15` and `sdxl-base`, checkpoint
/// `dreamshaper_8.safetensors`.
pub struct Fixture {
    pub root: TempDir,
    pub options: SessionOptions,
}

impl Fixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let models_dir = root.path().join("models");
        let checkpoints_dir = root.path().join("checkpoints");
        fs::create_dir_all(models_dir.join("sd15").join("scheduler")).unwrap();
        fs::write(
            models_dir.join("sd15").join("scheduler").join("scheduler_config.json"),
            r#"{"beta_schedule": "scaled_linear", "beta_start": 0.00085, "beta_end": 0.012}"#,
        )
        .unwrap();
        fs::create_dir_all(models_dir.join("sdxl-base")).unwrap();
        fs::create_dir_all(&checkpoints_dir).unwrap();
        fs::write(checkpoints_dir.join("dreamshaper_8.safetensors"), b"").unwrap();

        let options = SessionOptions {
            converted_dir: checkpoints_dir.join(".converted"),
            models_dir,
            checkpoints_dir,
            use_hf_cache: false,
            device_map: DeviceMap::ForceCpu,
            ..SessionOptions::default()
        };
        Self { root, options }
    }

    pub fn session(&self) -> (SessionManager, Arc<Recorder>) {
        let (loader, recorder) = MockLoader::new();
        (SessionManager::new(self.options.clone(), loader), recorder)
    }
}
