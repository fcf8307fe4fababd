//! The single-model session.
//!
//! ```text
//! Unloaded ──load──▶ Loading ──ok──▶ Loaded ──generate──▶ Generating ──▶ Loaded
//!     ▲                 │                                      │
//!     └──── failure ────┘                   failure keeps the model loaded
//! ```
//!
//! `load` releases the current model before it constructs the next one, so
//! device memory never holds two models. All calls are blocking and are
//! serialized by one guard around the model slot.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use image::DynamicImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::error::{Result, SessionError};
use crate::sampler::{DpmSolverConfig, NativeSchedule};
use crate::{
    select_best_device, select_dtype, validate, ArtifactLayout, ArtifactLocator,
    GenerationParams, GenerationRequest, LoadSpec, LoadStrategy, Loader, ModelKind, Pipeline,
    Placement, Seed, SessionOptions,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    Unloaded,
    Loading,
    Loaded,
    Generating,
}

/// Description of the loaded model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub identifier: String,
    pub kind: ModelKind,
    pub layout: ArtifactLayout,
    pub placement: Placement,
    /// Where the weights were read from.
    pub source: PathBuf,
    pub memory_efficient_attention: bool,
}

/// Output of one successful generation.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    image: DynamicImage,
    seed: u64,
    model: String,
    params: GenerationParams,
}

impl GenerationResult {
    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn into_image(self) -> DynamicImage {
        self.image
    }

    /// The seed actually used, after resolving the random sentinel.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// The parameters after clamping, as the engine saw them.
    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    /// Human-readable provenance, always naming the seed.
    pub fn info(&self) -> String {
        format!("Generated with seed: {}\nModel: {}", self.seed, self.model)
    }
}

struct ModelHandle {
    info: ModelInfo,
    pipeline: Box<dyn Pipeline>,
}

#[derive(Debug, Clone)]
struct Status {
    phase: SessionPhase,
    model: Option<ModelInfo>,
}

pub struct SessionManager {
    loader: Box<dyn Loader>,
    locator: ArtifactLocator,
    options: SessionOptions,
    slot: Mutex<Option<ModelHandle>>,
    status: Mutex<Status>,
}

impl SessionManager {
    pub fn new(options: SessionOptions, loader: impl Loader + 'static) -> Self {
        let locator = ArtifactLocator::from_options(&options);
        Self::with_locator(options, locator, loader)
    }

    pub fn with_locator(
        options: SessionOptions,
        locator: ArtifactLocator,
        loader: impl Loader + 'static,
    ) -> Self {
        Self {
            loader: Box::new(loader),
            locator,
            options,
            slot: Mutex::new(None),
            status: Mutex::new(Status {
                phase: SessionPhase::Unloaded,
                model: None,
            }),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Current phase. Does not wait for an in-flight load or generation.
    pub fn phase(&self) -> SessionPhase {
        self.status().phase
    }

    /// The loaded model, if any. Does not wait for an in-flight call.
    pub fn current(&self) -> Option<ModelInfo> {
        self.status().model.clone()
    }

    /// Identifiers that [`SessionManager::load`] can resolve. Empty when none exist.
    pub fn list_available(&self) -> Vec<String> {
        self.locator.list()
    }

    /// Releases the current model, then loads `identifier` as `kind`.
    ///
    /// On failure the session is left unloaded.
    pub fn load(&self, identifier: &str, kind: ModelKind) -> Result<ModelInfo> {
        let mut slot = self.lock_slot();
        self.release(&mut slot);
        self.set_status(SessionPhase::Loading, None);

        tracing::info!(identifier, %kind, "loading model");
        let outcome = catch_unwind(AssertUnwindSafe(|| self.construct(identifier, kind)))
            .unwrap_or_else(|panic| Err(SessionError::LoadFailure(panic_message(panic))));

        match outcome {
            Ok(handle) => {
                let info = handle.info.clone();
                *slot = Some(handle);
                self.set_status(SessionPhase::Loaded, Some(info.clone()));
                tracing::info!(
                    identifier,
                    placement = %info.placement,
                    memory_efficient_attention = info.memory_efficient_attention,
                    "loaded model"
                );
                Ok(info)
            }
            Err(err) => {
                self.set_status(SessionPhase::Unloaded, None);
                tracing::warn!(identifier, "{err}");
                Err(err)
            }
        }
    }

    /// Releases the current model, if any.
    pub fn unload(&self) {
        let mut slot = self.lock_slot();
        self.release(&mut slot);
        self.set_status(SessionPhase::Unloaded, None);
    }

    /// Validates `request` and runs it against the loaded model.
    ///
    /// Fails with [`SessionError::NoModelLoaded`] before any engine call when
    /// nothing is loaded. Engine failures leave the model loaded.
    pub fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let mut slot = self.lock_slot();
        let Some(handle) = slot.as_mut() else {
            return Err(SessionError::NoModelLoaded);
        };

        let params = validate(request);
        let seed = resolve_seed(params.seed());
        let mut rng = StdRng::seed_from_u64(seed);
        let model = handle.info.identifier.clone();
        self.set_status(SessionPhase::Generating, Some(handle.info.clone()));

        tracing::info!(
            model = %model,
            seed,
            steps = params.steps(),
            width = params.width(),
            height = params.height(),
            "generating image"
        );
        let outcome = catch_unwind(AssertUnwindSafe(|| handle.pipeline.generate(&params, &mut rng)))
            .unwrap_or_else(|panic| Err(anyhow::anyhow!(panic_message(panic))));
        self.set_status(SessionPhase::Loaded, Some(handle.info.clone()));

        match outcome {
            Ok(image) => Ok(GenerationResult {
                image,
                seed,
                model,
                params,
            }),
            Err(err) => {
                let err = SessionError::generation(err);
                tracing::warn!(model = %model, seed, "{err}");
                Err(err)
            }
        }
    }

    fn construct(&self, identifier: &str, kind: ModelKind) -> Result<ModelHandle> {
        let artifact = self
            .locator
            .locate(identifier)
            .map_err(|err| SessionError::ArtifactNotFound(err.to_string()))?;

        let strategy = LoadStrategy::select(kind, artifact.layout).ok_or_else(|| {
            SessionError::LoadFailure(format!(
                "{} artifacts are not supported for {kind}",
                artifact.layout
            ))
        })?;
        tracing::debug!(?strategy, path = %artifact.path.display(), "selected load strategy");

        let native = match artifact.layout {
            ArtifactLayout::Repository => {
                NativeSchedule::from_repository(&artifact.path, kind).map_err(SessionError::load)?
            }
            ArtifactLayout::SingleFile => NativeSchedule::for_kind(kind),
        };
        let sampler = DpmSolverConfig::refine(&native);

        let memory = &self.options.memory;
        let device = select_best_device(self.options.device_map).map_err(SessionError::load)?;
        let dtype = select_dtype(self.options.precision, &device);
        let memory_efficient_attention = memory.memory_efficient_attention
            && self.loader.supports_memory_efficient_attention(&device, dtype);
        if memory.memory_efficient_attention && !memory_efficient_attention {
            tracing::info!("memory-efficient attention unavailable, using default attention");
        }

        let spec = LoadSpec {
            kind,
            strategy,
            layout: artifact.layout,
            weights: artifact.path.clone(),
            dtype,
            sampler,
            attention_slice_size: memory.attention_slice_size,
            vae_slicing: memory.vae_slicing,
            memory_efficient_attention,
            device: device.clone(),
        };
        let pipeline = self.loader.load(&spec).map_err(SessionError::load)?;

        Ok(ModelHandle {
            info: ModelInfo {
                identifier: artifact.identifier,
                kind,
                layout: artifact.layout,
                placement: Placement::of(&device),
                source: artifact.path,
                memory_efficient_attention,
            },
            pipeline,
        })
    }

    fn release(&self, slot: &mut Option<ModelHandle>) {
        if let Some(handle) = slot.take() {
            let identifier = handle.info.identifier.clone();
            drop(handle);
            tracing::info!(identifier, "released model");
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<ModelHandle>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, phase: SessionPhase, model: Option<ModelInfo>) {
        *self.status() = Status { phase, model };
    }
}

/// Draws a fresh seed from `[0, u32::MAX)` for the random sentinel.
fn resolve_seed(seed: Seed) -> u64 {
    match seed {
        Seed::Fixed(seed) => seed,
        Seed::Random => rand::thread_rng().gen_range(0..u32::MAX) as u64,
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("engine panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("engine panicked: {message}")
    } else {
        "engine panicked".to_string()
    }
}
