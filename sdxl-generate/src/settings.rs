use {
    serde::{Deserialize, Serialize},
    pipeline_common::enhance::EnhanceParams,
    stable_diffusion_inference::{
        ModelFiles,
        PipelineOptions,
        SchedulerKind,
        StableDiffusionVersion,
        StorageSettings,
    },
};

pub const BASE_FILE_NAME: &str = "sdxl_base_image.png";
pub const ENHANCED_FILE_NAME: &str = "sdxl_final_enhanced.png";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Settings {
    pub output_dir: String,

    pub prompt: String,
    pub negative_prompt: String,

    pub base_width: usize,
    pub base_height: usize,
    pub base_steps: usize,
    pub base_guidance: f64,

    /// `None` leaves the generator unseeded.
    pub seed: Option<u64>,

    pub enhance: EnhanceParams,

    pub scheduler: SchedulerKind,
    pub attention_slice_size: Option<usize>,
    pub vae_tiling: bool,
    pub use_f16: bool,
    pub cpu: bool,
    pub model: Option<ModelFiles>,
    pub storage: StorageSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: ".".to_owned(),

            prompt: "a beautiful landscape with mountains and a lake, sunset, photorealistic, high quality, detailed".to_owned(),
            negative_prompt: "blurry, low quality, distorted, deformed, ugly, bad anatomy, watermark, text".to_owned(),

            base_width: 768,
            base_height: 768,
            base_steps: 30,
            base_guidance: 7.5,

            seed: None,

            enhance: EnhanceParams::sdxl(),

            scheduler: SchedulerKind::ModelDefault,
            attention_slice_size: Some(1),
            vae_tiling: false,
            use_f16: true,
            cpu: false,
            model: None,
            storage: StorageSettings::default(),
        }
    }
}

impl Settings {
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            version: StableDiffusionVersion::Xl,
            scheduler: self.scheduler,
            attention_slice_size: self.attention_slice_size,
            vae_tiling: self.vae_tiling,
            use_f16: self.use_f16,
            cpu: self.cpu,
            ..Default::default()
        }
    }

    pub fn model_files(&self) -> ModelFiles {
        self.model.clone().unwrap_or_else(|| StableDiffusionVersion::Xl.default_files(self.use_f16))
    }
}
