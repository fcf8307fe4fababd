//! Normalizes caller-supplied generation parameters.
//!
//! Out-of-range values are clamped to the nearest bound instead of rejected.
//! The only way to obtain [`GenerationParams`] is [`validate`], so nothing
//! unchecked reaches an engine.

use std::ops::RangeInclusive;

use crate::GenerationRequest;

pub const STEPS: RangeInclusive<usize> = 10..=100;
pub const GUIDANCE: RangeInclusive<f64> = 1.0..=20.0;
pub const DIMENSION: RangeInclusive<usize> = 256..=1024;
/// Width and height must be multiples of this.
pub const DIMENSION_ALIGN: usize = 64;

pub const DEFAULT_STEPS: usize = 25;
pub const DEFAULT_GUIDANCE: f64 = 7.5;
pub const DEFAULT_DIMENSION: usize = 512;
/// Seed value asking for a fresh random seed.
pub const RANDOM_SEED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seed {
    Random,
    Fixed(u64),
}

/// A request whose every field is inside the supported bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    prompt: String,
    negative_prompt: Option<String>,
    steps: usize,
    guidance_scale: f64,
    width: usize,
    height: usize,
    seed: Seed,
}

impl GenerationParams {
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// `None` means no negative conditioning.
    pub fn negative_prompt(&self) -> Option<&str> {
        self.negative_prompt.as_deref()
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn guidance_scale(&self) -> f64 {
        self.guidance_scale
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn seed(&self) -> Seed {
        self.seed
    }
}

pub fn validate(request: &GenerationRequest) -> GenerationParams {
    let steps = request.steps.map_or(DEFAULT_STEPS, |steps| non_negative("steps", steps));
    let steps = clamp_logged("steps", steps, &STEPS);
    let guidance_scale = match request.guidance {
        Some(guidance) if guidance.is_nan() => DEFAULT_GUIDANCE,
        Some(guidance) => clamp_logged("guidance", guidance, &GUIDANCE),
        None => DEFAULT_GUIDANCE,
    };
    let width = request
        .width
        .map_or(DEFAULT_DIMENSION, |width| non_negative("width", width));
    let height = request
        .height
        .map_or(DEFAULT_DIMENSION, |height| non_negative("height", height));
    let width = snap_dimension("width", width);
    let height = snap_dimension("height", height);
    // Any other value, negatives included, is a fixed seed reinterpreted as u64.
    let seed = match request.seed.unwrap_or(RANDOM_SEED) {
        RANDOM_SEED => Seed::Random,
        seed => Seed::Fixed(seed as u64),
    };
    let negative_prompt = request
        .negative_prompt
        .as_ref()
        .filter(|negative| !negative.trim().is_empty())
        .cloned();

    GenerationParams {
        prompt: request.prompt.clone(),
        negative_prompt,
        steps,
        guidance_scale,
        width,
        height,
        seed,
    }
}

/// Negative counts become zero and are then clamped like any other value.
fn non_negative(field: &str, value: i64) -> usize {
    if value < 0 {
        tracing::debug!("raised negative {field} {value} to 0");
        return 0;
    }
    usize::try_from(value).unwrap_or(usize::MAX)
}

fn clamp_logged<T: PartialOrd + Copy + std::fmt::Display>(
    field: &str,
    value: T,
    range: &RangeInclusive<T>,
) -> T {
    let clamped = if value < *range.start() {
        *range.start()
    } else if value > *range.end() {
        *range.end()
    } else {
        value
    };
    if clamped != value {
        tracing::debug!("clamped {field} from {value} to {clamped}");
    }
    clamped
}

/// Rounds to the nearest alignment multiple (ties up), then clamps.
fn snap_dimension(field: &str, value: usize) -> usize {
    let snapped = value.saturating_add(DIMENSION_ALIGN / 2) / DIMENSION_ALIGN * DIMENSION_ALIGN;
    let clamped = clamp_logged(field, snapped, &DIMENSION);
    if snapped != value && clamped == snapped {
        tracing::debug!("snapped {field} from {value} to {snapped}");
    }
    clamped
}
