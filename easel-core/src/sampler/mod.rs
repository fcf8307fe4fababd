//! Sampling-schedule configuration.
//!
//! A loaded model ships with the schedule it was trained with. Generation does
//! not use that schedule directly: [`DpmSolverConfig::refine`] keeps its noise
//! schedule and parameterization but swaps the solver for DPM-Solver++ (2M)
//! stepping along Karras sigmas.

use std::path::Path;

use anyhow::{Context, Result};
use candle_transformers::models::stable_diffusion::schedulers::{Scheduler, SchedulerConfig};
use serde::{Deserialize, Serialize};

use crate::ModelKind;

mod dpm_solver;

pub use dpm_solver::DpmSolverMultistep;

/// Location of the schedule inside a repository layout.
pub const SCHEDULER_CONFIG: &str = "scheduler/scheduler_config.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    SquaredcosCapV2,
}

/// What the denoising network predicts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    VPrediction,
    Sample,
}

/// The training-time noise schedule a model ships with.
///
/// Unknown keys in `scheduler_config.json` are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeSchedule {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub prediction_type: PredictionType,
}

impl Default for NativeSchedule {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            prediction_type: PredictionType::Epsilon,
        }
    }
}

impl NativeSchedule {
    /// The schedule a kind uses when its artifact does not carry one.
    pub fn for_kind(kind: ModelKind) -> Self {
        match kind {
            ModelKind::StandardV1 | ModelKind::ExtendedResolution => Self::default(),
            ModelKind::StandardV2 => Self {
                prediction_type: PredictionType::VPrediction,
                ..Self::default()
            },
        }
    }

    /// Reads `scheduler/scheduler_config.json` from a repository, falling back
    /// to the kind's schedule when the file is absent.
    pub fn from_repository(root: &Path, kind: ModelKind) -> Result<Self> {
        let path = root.join(SCHEDULER_CONFIG);
        if !path.is_file() {
            tracing::debug!(path = %path.display(), "no scheduler config, using {kind} defaults");
            return Ok(Self::for_kind(kind));
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))
    }
}

/// DPM-Solver++ multistep configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DpmSolverConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub prediction_type: PredictionType,
    /// 1 or 2.
    pub solver_order: usize,
    pub use_karras_sigmas: bool,
    /// Drop to first order on the last step of short schedules.
    pub lower_order_final: bool,
}

impl DpmSolverConfig {
    pub const KARRAS_RHO: f64 = 7.0;

    /// Keeps the native noise schedule and parameterization, replaces the
    /// solver with second-order DPM-Solver++ on Karras sigmas.
    pub fn refine(native: &NativeSchedule) -> Self {
        Self {
            num_train_timesteps: native.num_train_timesteps,
            beta_start: native.beta_start,
            beta_end: native.beta_end,
            beta_schedule: native.beta_schedule,
            prediction_type: native.prediction_type,
            solver_order: 2,
            use_karras_sigmas: true,
            lower_order_final: true,
        }
    }
}

impl SchedulerConfig for DpmSolverConfig {
    fn build(&self, inference_steps: usize) -> candle_core::Result<Box<dyn Scheduler>> {
        Ok(Box::new(DpmSolverMultistep::new(inference_steps, self.clone())?))
    }
}
