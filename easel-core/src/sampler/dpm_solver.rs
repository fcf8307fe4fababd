//! DPM-Solver++ multistep scheduler (data prediction, orders 1 and 2).
//!
//! The solver walks a decreasing list of sigmas that ends at zero. Each step
//! turns the network output into a clean-sample estimate `x0`, then moves the
//! latent to the next sigma using the current estimate (first order) or the
//! current and previous estimates (second order, midpoint rule).

use candle_core::{bail, DType, Result, Tensor};
use candle_transformers::models::stable_diffusion::schedulers::Scheduler;

use super::{BetaSchedule, DpmSolverConfig, PredictionType};

pub struct DpmSolverMultistep {
    config: DpmSolverConfig,
    alphas_cumprod: Vec<f64>,
    timesteps: Vec<usize>,
    /// One more entry than `timesteps`; the last one is always zero.
    sigmas: Vec<f64>,
    step_index: usize,
    previous_x0: Option<Tensor>,
}

impl DpmSolverMultistep {
    pub fn new(inference_steps: usize, config: DpmSolverConfig) -> Result<Self> {
        let train_steps = config.num_train_timesteps;
        if inference_steps == 0 {
            bail!("dpm-solver needs at least one inference step")
        }
        if train_steps < 2 {
            bail!("dpm-solver needs at least two training timesteps, got {train_steps}")
        }
        if !(1..=2).contains(&config.solver_order) {
            bail!("unsupported dpm-solver order {}", config.solver_order)
        }

        let betas = betas(&config);
        let alphas_cumprod: Vec<f64> = betas
            .iter()
            .scan(1.0, |acc, beta| {
                *acc *= 1.0 - beta;
                Some(*acc)
            })
            .collect();
        let train_sigmas: Vec<f64> = alphas_cumprod
            .iter()
            .map(|ac| ((1.0 - ac) / ac).sqrt())
            .collect();
        let log_sigmas: Vec<f64> = train_sigmas.iter().map(|s| s.ln()).collect();

        let (timesteps, mut sigmas) = if config.use_karras_sigmas {
            let sigmas = karras_sigmas(
                train_sigmas[0],
                train_sigmas[train_steps - 1],
                inference_steps,
                DpmSolverConfig::KARRAS_RHO,
            );
            let timesteps = sigmas
                .iter()
                .map(|&sigma| sigma_to_t(sigma, &log_sigmas).round() as usize)
                .collect();
            (timesteps, sigmas)
        } else {
            let timesteps: Vec<usize> = linspace(0.0, (train_steps - 1) as f64, inference_steps + 1)
                .into_iter()
                .rev()
                .take(inference_steps)
                .map(|t| t.round() as usize)
                .collect();
            let sigmas = timesteps.iter().map(|&t| train_sigmas[t]).collect();
            (timesteps, sigmas)
        };
        sigmas.push(0.0);

        Ok(Self {
            config,
            alphas_cumprod,
            timesteps,
            sigmas,
            step_index: 0,
            previous_x0: None,
        })
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    /// Clean-sample estimate for the current step.
    fn convert_model_output(&self, model_output: &Tensor, sample: &Tensor) -> Result<Tensor> {
        let (alpha_t, sigma_t) = alpha_sigma(self.sigmas[self.step_index]);
        match self.config.prediction_type {
            PredictionType::Epsilon => (sample - (model_output * sigma_t)?)? / alpha_t,
            PredictionType::VPrediction => (sample * alpha_t)? - (model_output * sigma_t)?,
            PredictionType::Sample => Ok(model_output.clone()),
        }
    }

    fn first_order_update(&self, x0: &Tensor, sample: &Tensor) -> Result<Tensor> {
        let i = self.step_index;
        let (sigma_next, sigma_cur) = (self.sigmas[i + 1], self.sigmas[i]);
        if sigma_next == 0.0 {
            return Ok(x0.clone());
        }
        let (alpha_t, sigma_t) = alpha_sigma(sigma_next);
        let (_, sigma_s) = alpha_sigma(sigma_cur);
        let h = lambda(sigma_next) - lambda(sigma_cur);
        (sample * (sigma_t / sigma_s))? - (x0 * (alpha_t * ((-h).exp() - 1.0)))?
    }

    fn second_order_update(&self, x0: &Tensor, previous: &Tensor, sample: &Tensor) -> Result<Tensor> {
        let i = self.step_index;
        let (sigma_next, sigma_s0, sigma_s1) =
            (self.sigmas[i + 1], self.sigmas[i], self.sigmas[i - 1]);
        let (alpha_t, sigma_t) = alpha_sigma(sigma_next);
        let (_, sigma_s) = alpha_sigma(sigma_s0);
        let (lambda_t, lambda_s0, lambda_s1) =
            (lambda(sigma_next), lambda(sigma_s0), lambda(sigma_s1));
        let h = lambda_t - lambda_s0;
        let r0 = (lambda_s0 - lambda_s1) / h;
        let d1 = ((x0 - previous)? * (1.0 / r0))?;
        let coeff = alpha_t * ((-h).exp() - 1.0);
        ((sample * (sigma_t / sigma_s))? - (x0 * coeff)?)? - (d1 * (0.5 * coeff))?
    }
}

impl Scheduler for DpmSolverMultistep {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> Result<Tensor> {
        let timestep = timestep.min(self.alphas_cumprod.len() - 1);
        let alpha_cumprod = self.alphas_cumprod[timestep];
        (original * alpha_cumprod.sqrt())? + (noise * (1.0 - alpha_cumprod).sqrt())?
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn scale_model_input(&self, sample: Tensor, _timestep: usize) -> Result<Tensor> {
        Ok(sample)
    }

    fn step(&mut self, model_output: &Tensor, _timestep: usize, sample: &Tensor) -> Result<Tensor> {
        if self.step_index >= self.timesteps.len() {
            bail!("dpm-solver stepped past its {} timesteps", self.timesteps.len())
        }
        let dtype = sample.dtype();
        let sample = sample.to_dtype(DType::F32)?;
        let model_output = model_output.to_dtype(DType::F32)?;
        let x0 = self.convert_model_output(&model_output, &sample)?;

        let last = self.step_index + 1 == self.timesteps.len();
        let lower_order_final = last
            && (self.sigmas[self.step_index + 1] == 0.0
                || (self.config.lower_order_final && self.timesteps.len() < 15));
        let prev_sample = match &self.previous_x0 {
            Some(previous) if self.config.solver_order == 2 && !lower_order_final => {
                self.second_order_update(&x0, previous, &sample)?
            }
            _ => self.first_order_update(&x0, &sample)?,
        };

        self.previous_x0 = Some(x0);
        self.step_index += 1;
        prev_sample.to_dtype(dtype)
    }
}

fn betas(config: &DpmSolverConfig) -> Vec<f64> {
    let n = config.num_train_timesteps;
    match config.beta_schedule {
        BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, n),
        BetaSchedule::ScaledLinear => {
            linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n)
                .into_iter()
                .map(|b| b * b)
                .collect()
        }
        BetaSchedule::SquaredcosCapV2 => {
            let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
            (0..n)
                .map(|i| {
                    let t1 = i as f64 / n as f64;
                    let t2 = (i + 1) as f64 / n as f64;
                    (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                })
                .collect()
        }
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

/// Karras et al. (2022) schedule: evenly spaced in `sigma^(1/rho)`, high to low.
fn karras_sigmas(sigma_min: f64, sigma_max: f64, n: usize, rho: f64) -> Vec<f64> {
    let min_inv_rho = sigma_min.powf(1.0 / rho);
    let max_inv_rho = sigma_max.powf(1.0 / rho);
    linspace(0.0, 1.0, n)
        .into_iter()
        .map(|ramp| (max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(rho))
        .collect()
}

/// Maps a sigma back to a fractional training timestep by interpolating in log space.
fn sigma_to_t(sigma: f64, log_sigmas: &[f64]) -> f64 {
    let log_sigma = sigma.max(1e-10).ln();
    let low = log_sigmas
        .iter()
        .rposition(|&ls| log_sigma >= ls)
        .unwrap_or(0)
        .min(log_sigmas.len() - 2);
    let high = low + 1;
    let w = ((log_sigmas[low] - log_sigma) / (log_sigmas[low] - log_sigmas[high])).clamp(0.0, 1.0);
    (1.0 - w) * low as f64 + w * high as f64
}

fn alpha_sigma(sigma: f64) -> (f64, f64) {
    let alpha = 1.0 / (sigma * sigma + 1.0).sqrt();
    (alpha, sigma * alpha)
}

/// Half log-SNR.
fn lambda(sigma: f64) -> f64 {
    let (alpha, sigma) = alpha_sigma(sigma);
    alpha.ln() - sigma.ln()
}
