use {
    serde::{Deserialize, Serialize},
    candle_transformers::models::stable_diffusion::{
        StableDiffusionConfig,
        schedulers::Scheduler,
    },
};

pub mod dpm_solver;

pub use dpm_solver::{DpmSolverMultistepScheduler, DpmSolverMultistepSchedulerConfig};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// DPM-Solver++ (2M) with Karras sigmas.
    DpmSolverMultistep,
    /// Whatever scheduler the model version ships with in candle.
    ModelDefault,
}

impl SchedulerKind {
    pub fn build(&self, sd_config: &StableDiffusionConfig, n_steps: usize) -> candle::Result<Box<dyn Scheduler>> {
        match self {
            Self::DpmSolverMultistep => Ok(Box::new(DpmSolverMultistepScheduler::new(
                n_steps,
                DpmSolverMultistepSchedulerConfig::default(),
            )?)),
            Self::ModelDefault => sd_config.build_scheduler(n_steps),
        }
    }
}
