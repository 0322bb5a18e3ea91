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

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Settings {
    pub num_images: usize,
    pub output_dir: String,

    pub prompt: String,
    pub negative_prompt: String,

    pub base_width: usize,
    pub base_height: usize,
    pub base_steps: usize,
    pub base_guidance: f64,

    pub upscale_factor: f64,
    pub refiner_steps: usize,
    pub refiner_strength: f64,
    pub refiner_guidance: f64,

    /// Drop the text-to-image pipeline and load a fresh refiner instead of reusing it.
    pub reload_between_stages: bool,

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
            num_images: 10,
            output_dir: "bulk_outputs".to_owned(),

            prompt: "a beautiful landscape with mountains and a lake, sunset, photorealistic, high quality, detailed".to_owned(),
            negative_prompt: "blurry, low quality, distorted, deformed, ugly, bad anatomy, watermark, text".to_owned(),

            base_width: 512,
            base_height: 768,
            base_steps: 40,
            base_guidance: 7.0,

            upscale_factor: 1.5,
            refiner_steps: 35,
            refiner_strength: 0.35,
            refiner_guidance: 7.0,

            reload_between_stages: true,

            enhance: EnhanceParams::bulk(),

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

    /// Size the base image is resized to before refinement.
    pub fn target_size(&self) -> (u32, u32) {
        (
            (self.base_width as f64 * self.upscale_factor) as u32,
            (self.base_height as f64 * self.upscale_factor) as u32,
        )
    }
}

pub fn base_file_name(index: usize) -> String {
    format!("01_base_image_{}.png", index)
}

pub fn refined_file_name(index: usize) -> String {
    format!("02_refined_upscale_{}.png", index)
}

pub fn enhanced_file_name(index: usize) -> String {
    format!("03_final_enhanced_{}.png", index)
}

#[cfg(test)]
mod tests {
    use {
        std::fs,
        tempfile::tempdir,
        pipeline_common::utils::load_settings_from,
        super::*,
    };

    #[test]
    fn defaults_match_bulk_run() {
        let settings = Settings::default();
        assert_eq!(settings.num_images, 10);
        assert_eq!(settings.target_size(), (768, 1152));
        assert_eq!(settings.model_files().repo, "SG161222/Realistic_Vision_V6.0_B1_noVAE");
        assert_eq!(settings.pipeline_options().version, StableDiffusionVersion::V1_5);
    }

    #[test]
    fn file_names_are_numbered_per_iteration() {
        assert_eq!(base_file_name(3), "01_base_image_3.png");
        assert_eq!(refined_file_name(3), "02_refined_upscale_3.png");
        assert_eq!(enhanced_file_name(10), "03_final_enhanced_10.png");
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bulk.toml");
        fs::write(&path, r#"
num_images = 2
scheduler = "model_default"

[enhance]
sharpness = 1.3
"#).unwrap();

        let settings: Settings = load_settings_from(path.to_str().unwrap()).unwrap();

        assert_eq!(settings.num_images, 2);
        assert_eq!(settings.scheduler, SchedulerKind::ModelDefault);
        assert_eq!(settings.enhance.sharpness, 1.3);
        assert_eq!(settings.enhance.contrast, 1.05);
        assert_eq!(settings.enhance.color, 1.02);
        assert_eq!(settings.base_steps, 40);
        assert_eq!(settings.output_dir, "bulk_outputs");
    }
}
