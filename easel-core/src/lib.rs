//! easel: load one Stable Diffusion model at a time and generate images from it.
//!
//! [`SessionManager`] owns the loaded model and is the only stateful piece.
//! Requests pass through [`validate`] before they reach a [`Pipeline`], and
//! models are constructed by a [`Loader`]; [`StableDiffusionLoader`] is the
//! candle-backed one.

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod config;
pub mod device_map;
pub mod error;
pub mod loader;
pub mod locator;
pub mod sampler;
pub mod session;
pub mod stable_diffusion;
pub mod strategy;
pub mod validate;
mod util;

pub use candle_core::{DType, Device};
pub use config::*;
pub use device_map::*;
pub use error::{Result, SessionError};
pub use loader::*;
pub use locator::{Artifact, ArtifactLocator, LocateError};
pub use session::{GenerationResult, ModelInfo, SessionManager, SessionPhase};
pub use stable_diffusion::StableDiffusionLoader;
pub use strategy::*;
pub use validate::{validate, GenerationParams, Seed};
pub(crate) use util::*;

use serde::{Deserialize, Serialize};

/// A caller's generation request, before validation.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    pub steps: Option<i64>,
    pub guidance: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    /// `-1` (or absent) draws a fresh random seed. Other negatives are fixed seeds.
    pub seed: Option<i64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
        self.negative_prompt = Some(negative_prompt.into());
        self
    }

    pub fn steps(mut self, steps: i64) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn guidance(mut self, guidance: f64) -> Self {
        self.guidance = Some(guidance);
        self
    }

    pub fn width(mut self, width: i64) -> Self {
        self.width = Some(width);
        self
    }

    pub fn height(mut self, height: i64) -> Self {
        self.height = Some(height);
        self
    }

    pub fn seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }
}
