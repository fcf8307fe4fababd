use std::path::PathBuf;

use anyhow::Result;
use candle_core::{DType, Device};
use image::DynamicImage;
use rand::rngs::StdRng;

use crate::{sampler::DpmSolverConfig, ArtifactLayout, GenerationParams, LoadStrategy, ModelKind};

/// Everything an engine needs to construct a pipeline.
#[derive(Debug, Clone)]
pub struct LoadSpec {
    pub kind: ModelKind,
    pub strategy: LoadStrategy,
    pub layout: ArtifactLayout,
    /// Repository directory or checkpoint file.
    pub weights: PathBuf,
    pub dtype: DType,
    pub sampler: DpmSolverConfig,
    pub attention_slice_size: Option<usize>,
    pub vae_slicing: bool,
    /// Set only after [`Loader::supports_memory_efficient_attention`] said yes.
    pub memory_efficient_attention: bool,
    pub device: Device,
}

/// Builds pipelines. The session owns exactly one loader for its lifetime.
pub trait Loader: Send + Sync {
    /// Whether a memory-efficient attention kernel can run on `device` with `dtype`.
    fn supports_memory_efficient_attention(&self, device: &Device, dtype: DType) -> bool;

    fn load(&self, spec: &LoadSpec) -> Result<Box<dyn Pipeline>>;
}

/// A fully constructed model that turns validated parameters into an image.
pub trait Pipeline: Send {
    /// Runs one generation. `rng` is freshly seeded for this call and is the
    /// only source of randomness the pipeline may use.
    fn generate(&mut self, params: &GenerationParams, rng: &mut StdRng) -> Result<DynamicImage>;
}
