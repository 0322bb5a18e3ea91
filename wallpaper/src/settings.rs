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

pub const BASE_FILE_NAME: &str = "01_wallpaper_base.png";
pub const RAW_FILE_NAME: &str = "04_wallpaper_4k_raw.png";
pub const FINAL_FILE_NAME: &str = "04_wallpaper_4k_final.png";

/// One resize-and-refine pass.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RefineStage {
    pub width: u32,
    pub height: u32,
    pub steps: usize,
    pub strength: f64,
    pub file_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Settings {
    pub output_dir: String,

    pub prompt: String,
    pub negative_prompt: String,

    pub base_width: usize,
    pub base_height: usize,
    pub base_steps: usize,
    /// Used by the base generation and every refine stage.
    pub guidance: f64,

    pub refine_stages: Vec<RefineStage>,

    pub final_width: u32,
    pub final_height: u32,

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

            // CLIP only sees the first 77 tokens
            prompt: "a beautiful landscape with mountains and a lake, sunset, vibrant colors, 4k wallpaper, high quality, detailed".to_owned(),
            negative_prompt: "blurry, low quality, distorted, deformed, ugly, bad anatomy, watermark, text".to_owned(),

            base_width: 512,
            base_height: 288,
            base_steps: 30,
            guidance: 7.0,

            refine_stages: vec![
                RefineStage {
                    width: 960,
                    height: 540,
                    steps: 25,
                    strength: 0.45,
                    file_name: "02_wallpaper_960p.png".to_owned(),
                },
                RefineStage {
                    width: 1920,
                    height: 1080,
                    steps: 20,
                    strength: 0.30,
                    file_name: "03_wallpaper_1080p.png".to_owned(),
                },
            ],

            final_width: 3840,
            final_height: 2160,

            seed: None,

            enhance: EnhanceParams::wallpaper_4k(),

            scheduler: SchedulerKind::DpmSolverMultistep,
            attention_slice_size: Some(1),
            vae_tiling: true,
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
            version: StableDiffusionVersion::V1_5,
            scheduler: self.scheduler,
            attention_slice_size: self.attention_slice_size,
            vae_tiling: self.vae_tiling,
            use_f16: self.use_f16,
            cpu: self.cpu,
            ..Default::default()
        }
    }

    pub fn model_files(&self) -> ModelFiles {
        self.model.clone().unwrap_or_else(|| StableDiffusionVersion::V1_5.default_files(self.use_f16))
    }

    /// Resolutions the image passes through, from base composition to the final upscale.
    pub fn strategy(&self) -> String {
        let mut sizes = vec![format!("{}x{}", self.base_width, self.base_height)];
        sizes.extend(self.refine_stages.iter().map(|stage| format!("{}x{}", stage.width, stage.height)));
        sizes.push(format!("{}x{}", self.final_width, self.final_height));
        sizes.join(" -> ")
    }
}
