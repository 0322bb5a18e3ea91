//! DPM-Solver++ multistep scheduler.
//!
//! Works in the variance preserving formulation: for a sigma `s` of the (VE) Karras schedule
//! `alpha = 1 / sqrt(s^2 + 1)` and `sigma = s * alpha`, so the model input never needs rescaling
//! and the initial noise has unit variance.

use {
    candle::{Result, Tensor, bail},
    candle_transformers::models::stable_diffusion::schedulers::Scheduler,
};

#[derive(Debug, Clone)]
pub struct DpmSolverMultistepSchedulerConfig {
    pub beta_start: f64,
    pub beta_end: f64,
    pub train_timesteps: usize,
    /// Only orders 1 and 2 are supported.
    pub solver_order: usize,
    pub use_karras_sigmas: bool,
}

impl Default for DpmSolverMultistepSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            train_timesteps: 1000,
            solver_order: 2,
            use_karras_sigmas: true,
        }
    }
}

pub struct DpmSolverMultistepScheduler {
    timesteps: Vec<usize>,
    // one more entry than timesteps, the last one is zero
    sigmas: Vec<f64>,
    solver_order: usize,
    model_outputs: Vec<Tensor>,
    lower_order_nums: usize,
    step_index: Option<usize>,
}

impl DpmSolverMultistepScheduler {
    pub fn new(inference_steps: usize, config: DpmSolverMultistepSchedulerConfig) -> Result<Self> {
        if inference_steps == 0 {
            bail!("number of inference steps must be positive");
        }
        if config.solver_order == 0 || config.solver_order > 2 {
            bail!("unsupported solver order {}", config.solver_order);
        }
        if config.train_timesteps < 2 {
            bail!("at least two train timesteps are required");
        }

        let train_sigmas = train_sigmas(&config);
        let log_sigmas: Vec<f64> = train_sigmas.iter().map(|s| s.ln()).collect();

        let (timesteps, mut sigmas) = if config.use_karras_sigmas {
            let sigma_min = train_sigmas[0];
            let sigma_max = train_sigmas[train_sigmas.len() - 1];
            let sigmas = karras_sigmas(sigma_min, sigma_max, inference_steps);
            let timesteps = sigmas.iter()
                .map(|&sigma| sigma_to_t(sigma, &log_sigmas).round() as usize)
                .collect();
            (timesteps, sigmas)
        } else {
            let last = (config.train_timesteps - 1) as f64;
            let timesteps: Vec<usize> = (0..inference_steps)
                .map(|i| (last * (inference_steps - i) as f64 / inference_steps as f64).round() as usize)
                .collect();
            let sigmas = timesteps.iter().map(|&t| train_sigmas[t]).collect();
            (timesteps, sigmas)
        };
        sigmas.push(0.0);

        Ok(Self {
            timesteps,
            sigmas,
            solver_order: config.solver_order,
            model_outputs: Vec::with_capacity(config.solver_order),
            lower_order_nums: 0,
            step_index: None,
        })
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    fn index_for_timestep(&self, timestep: usize) -> usize {
        let positions: Vec<usize> = self.timesteps.iter()
            .enumerate()
            .filter(|(_, &t)| t == timestep)
            .map(|(i, _)| i)
            .collect();

        match positions.len() {
            0 => self.timesteps.len() - 1,
            1 => positions[0],
            _ => positions[1],
        }
    }

    fn convert_model_output(&self, model_output: &Tensor, sample: &Tensor, step_index: usize) -> Result<Tensor> {
        let (alpha_t, sigma_t) = alpha_sigma(self.sigmas[step_index]);
        sample.affine(1. / alpha_t, 0.)? - model_output.affine(sigma_t / alpha_t, 0.)?
    }

    fn first_order_update(&self, x0: &Tensor, sample: &Tensor, step_index: usize) -> Result<Tensor> {
        let sigma_next = self.sigmas[step_index + 1];
        if sigma_next == 0.0 {
            return Ok(x0.clone());
        }

        let (alpha_t, sigma_t) = alpha_sigma(sigma_next);
        let (alpha_s, sigma_s) = alpha_sigma(self.sigmas[step_index]);
        let h = lambda(alpha_t, sigma_t) - lambda(alpha_s, sigma_s);

        sample.affine(sigma_t / sigma_s, 0.)? - x0.affine(alpha_t * ((-h).exp() - 1.), 0.)?
    }

    fn second_order_update(&self, sample: &Tensor, step_index: usize) -> Result<Tensor> {
        let m0 = &self.model_outputs[self.model_outputs.len() - 1];
        let m1 = &self.model_outputs[self.model_outputs.len() - 2];

        let (alpha_t, sigma_t) = alpha_sigma(self.sigmas[step_index + 1]);
        let (alpha_s0, sigma_s0) = alpha_sigma(self.sigmas[step_index]);
        let (alpha_s1, sigma_s1) = alpha_sigma(self.sigmas[step_index - 1]);

        let lambda_t = lambda(alpha_t, sigma_t);
        let lambda_s0 = lambda(alpha_s0, sigma_s0);
        let lambda_s1 = lambda(alpha_s1, sigma_s1);

        let h = lambda_t - lambda_s0;
        let r0 = (lambda_s0 - lambda_s1) / h;

        let d1 = (m0 - m1)?.affine(1. / r0, 0.)?;
        let coefficient = alpha_t * ((-h).exp() - 1.);

        ((sample.affine(sigma_t / sigma_s0, 0.)? - m0.affine(coefficient, 0.)?)? - d1.affine(0.5 * coefficient, 0.)?)
    }
}

impl Scheduler for DpmSolverMultistepScheduler {
    fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    fn add_noise(&self, original: &Tensor, noise: Tensor, timestep: usize) -> Result<Tensor> {
        let (alpha_t, sigma_t) = alpha_sigma(self.sigmas[self.index_for_timestep(timestep)]);
        original.affine(alpha_t, 0.)? + noise.affine(sigma_t, 0.)?
    }

    fn init_noise_sigma(&self) -> f64 {
        1.
    }

    fn scale_model_input(&self, sample: Tensor, _timestep: usize) -> Result<Tensor> {
        Ok(sample)
    }

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let step_index = match self.step_index {
            Some(v) => v,
            None => self.index_for_timestep(timestep),
        };

        let x0 = self.convert_model_output(model_output, sample, step_index)?;
        if self.model_outputs.len() == self.solver_order {
            self.model_outputs.remove(0);
        }
        self.model_outputs.push(x0.clone());

        let lower_order_final = step_index + 1 == self.timesteps.len();
        let prev_sample = if self.solver_order == 1 || self.lower_order_nums < 1 || lower_order_final || step_index == 0 {
            self.first_order_update(&x0, sample, step_index)?
        } else {
            self.second_order_update(sample, step_index)?
        };

        if self.lower_order_nums < self.solver_order {
            self.lower_order_nums += 1;
        }
        self.step_index = Some(step_index + 1);

        Ok(prev_sample)
    }
}

fn train_sigmas(config: &DpmSolverMultistepSchedulerConfig) -> Vec<f64> {
    let n = config.train_timesteps;
    let start = config.beta_start.sqrt();
    let end = config.beta_end.sqrt();

    let mut alpha_cumprod = 1.;
    (0..n)
        .map(|i| {
            let beta = (start + (end - start) * i as f64 / (n - 1) as f64).powi(2);
            alpha_cumprod *= 1. - beta;
            ((1. - alpha_cumprod) / alpha_cumprod).sqrt()
        })
        .collect()
}

// Karras et al. (2022) noise schedule, descending from sigma_max to sigma_min
fn karras_sigmas(sigma_min: f64, sigma_max: f64, steps: usize) -> Vec<f64> {
    const RHO: f64 = 7.0;

    let min_inv_rho = sigma_min.powf(1. / RHO);
    let max_inv_rho = sigma_max.powf(1. / RHO);

    (0..steps)
        .map(|i| {
            let ramp = if steps == 1 { 0. } else { i as f64 / (steps - 1) as f64 };
            (max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(RHO)
        })
        .collect()
}

// log-linear interpolation of a sigma back onto the train timestep axis
fn sigma_to_t(sigma: f64, log_sigmas: &[f64]) -> f64 {
    let log_sigma = sigma.max(1e-10).ln();

    let low_idx = log_sigmas.iter()
        .rposition(|&s| log_sigma - s >= 0.)
        .unwrap_or(0)
        .min(log_sigmas.len() - 2);
    let high_idx = low_idx + 1;

    let low = log_sigmas[low_idx];
    let high = log_sigmas[high_idx];

    let w = ((low - log_sigma) / (low - high)).clamp(0., 1.);
    (1. - w) * low_idx as f64 + w * high_idx as f64
}

fn alpha_sigma(sigma: f64) -> (f64, f64) {
    let alpha = 1. / (sigma * sigma + 1.).sqrt();
    (alpha, sigma * alpha)
}

fn lambda(alpha: f64, sigma: f64) -> f64 {
    alpha.ln() - sigma.ln()
}

#[cfg(test)]
mod tests {
    use {
        candle::Device,
        super::*,
    };

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn karras_timesteps_descend_from_last_train_step() {
        let scheduler = DpmSolverMultistepScheduler::new(40, Default::default()).unwrap();

        let timesteps = scheduler.timesteps();
        assert_eq!(timesteps.len(), 40);
        assert_eq!(timesteps[0], 999);
        assert!(timesteps.windows(2).all(|w| w[0] >= w[1]));

        let sigmas = scheduler.sigmas();
        assert_eq!(sigmas.len(), 41);
        assert_eq!(sigmas[40], 0.0);
        assert!((sigmas[0] - 14.61).abs() < 0.05);
    }

    #[test]
    fn linear_timesteps_without_karras() {
        let scheduler = DpmSolverMultistepScheduler::new(4, DpmSolverMultistepSchedulerConfig {
            use_karras_sigmas: false,
            ..Default::default()
        }).unwrap();

        assert_eq!(scheduler.timesteps(), &[999, 749, 500, 250]);
    }

    #[test]
    fn rejects_zero_steps() {
        assert!(DpmSolverMultistepScheduler::new(0, Default::default()).is_err());
    }

    #[test]
    fn exact_noise_prediction_recovers_clean_sample() {
        let device = Device::Cpu;
        let clean = Tensor::new(&[[0.5f32, -0.25], [0.75, -1.0]], &device).unwrap();
        let noise = Tensor::new(&[[1.0f32, -0.5], [0.3, 0.8]], &device).unwrap();

        let mut scheduler = DpmSolverMultistepScheduler::new(20, Default::default()).unwrap();
        let timesteps = scheduler.timesteps().to_vec();

        let mut sample = scheduler.add_noise(&clean, noise.clone(), timesteps[0]).unwrap();
        for &timestep in timesteps.iter() {
            sample = scheduler.step(&noise, timestep, &sample).unwrap();
        }

        assert!(max_abs_diff(&sample, &clean) < 1e-3);
    }

    #[test]
    fn partial_schedule_from_middle_timestep() {
        let device = Device::Cpu;
        let clean = Tensor::new(&[0.2f32, -0.4, 0.6], &device).unwrap();
        let noise = Tensor::new(&[-0.7f32, 0.1, 0.9], &device).unwrap();

        let mut scheduler = DpmSolverMultistepScheduler::new(35, Default::default()).unwrap();
        let timesteps = scheduler.timesteps()[23..].to_vec();

        let mut sample = scheduler.add_noise(&clean, noise.clone(), timesteps[0]).unwrap();
        for &timestep in timesteps.iter() {
            sample = scheduler.step(&noise, timestep, &sample).unwrap();
        }

        assert!(max_abs_diff(&sample, &clean) < 1e-3);
    }
}
