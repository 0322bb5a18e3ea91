// most of the implementation follows the candle examples: https://github.com/huggingface/candle/tree/main/candle-examples/examples/stable-diffusion

use {
    std::sync::Arc,
    tracing::{info, warn, debug},
    serde::{Deserialize, Serialize},
    candle::{DType, Device, Tensor, Module, D},
    candle_transformers::models::stable_diffusion::{
        self,
        StableDiffusionConfig,
        clip::{self, ClipTextTransformer},
        schedulers::Scheduler,
        unet_2d::UNet2DConditionModel,
        vae::AutoEncoderKL,
    },
    tokenizers::Tokenizer,
    image::RgbImage,
    indicatif::ProgressBar,
    crate::{
        error::{Error, Result},
        schedulers::SchedulerKind,
        storage::Storage,
        tiling::{self, LATENT_TILE_SIZE, SAMPLE_TILE_SIZE},
        utils::{image_to_tensor, resize, snap_to_latent_grid, tensor_to_image},
    },
};

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StableDiffusionVersion {
    V1_5,
    Xl,
}

impl StableDiffusionVersion {
    pub fn sd_config(&self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, None, None),
            Self::Xl => StableDiffusionConfig::sdxl(sliced_attention_size, None, None),
        }
    }

    pub fn vae_scale(&self) -> f64 {
        match self {
            Self::V1_5 => 0.18215,
            Self::Xl => 0.13025,
        }
    }

    pub fn default_files(&self, use_f16: bool) -> ModelFiles {
        match self {
            // this repository ships its diffusers folders as pickled checkpoints only
            Self::V1_5 => ModelFiles {
                repo: "SG161222/Realistic_Vision_V6.0_B1_noVAE".to_owned(),
                unet: "unet/diffusion_pytorch_model.bin".to_owned(),
                text_encoder: "text_encoder/pytorch_model.bin".to_owned(),
                tokenizer_repo: "openai/clip-vit-base-patch32".to_owned(),
                tokenizer: "tokenizer.json".to_owned(),
                text_encoder_2: None,
                tokenizer_2_repo: None,
                tokenizer_2: None,
                vae_repo: "stabilityai/sd-vae-ft-mse".to_owned(),
                vae: "diffusion_pytorch_model.safetensors".to_owned(),
            },
            Self::Xl => {
                let suffix = if use_f16 { ".fp16.safetensors" } else { ".safetensors" };
                ModelFiles {
                    repo: "stabilityai/stable-diffusion-xl-base-1.0".to_owned(),
                    unet: format!("unet/diffusion_pytorch_model{}", suffix),
                    text_encoder: format!("text_encoder/model{}", suffix),
                    tokenizer_repo: "openai/clip-vit-large-patch14".to_owned(),
                    tokenizer: "tokenizer.json".to_owned(),
                    text_encoder_2: Some(format!("text_encoder_2/model{}", suffix)),
                    tokenizer_2_repo: Some("laion/CLIP-ViT-bigG-14-laion2B-39B-b160k".to_owned()),
                    tokenizer_2: Some("tokenizer.json".to_owned()),
                    // the stock sdxl autoencoder overflows in half precision
                    vae_repo: if use_f16 {
                        "madebyollin/sdxl-vae-fp16-fix".to_owned()
                    } else {
                        "stabilityai/stable-diffusion-xl-base-1.0".to_owned()
                    },
                    vae: if use_f16 {
                        "diffusion_pytorch_model.safetensors".to_owned()
                    } else {
                        "vae/diffusion_pytorch_model.safetensors".to_owned()
                    },
                }
            },
        }
    }
}

/// Where each model component lives: repository plus file path inside it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub repo: String,
    pub unet: String,
    pub text_encoder: String,
    pub tokenizer_repo: String,
    pub tokenizer: String,
    pub text_encoder_2: Option<String>,
    pub tokenizer_2_repo: Option<String>,
    pub tokenizer_2: Option<String>,
    pub vae_repo: String,
    pub vae: String,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub version: StableDiffusionVersion,
    pub scheduler: SchedulerKind,
    /// Attention is computed in slices of this size, `Some(1)` uses the least memory.
    pub attention_slice_size: Option<usize>,
    pub vae_tiling: bool,
    pub use_f16: bool,
    pub use_flash_attn: bool,
    pub cpu: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            version: StableDiffusionVersion::V1_5,
            scheduler: SchedulerKind::DpmSolverMultistep,
            attention_slice_size: Some(1),
            vae_tiling: true,
            use_f16: true,
            use_flash_attn: false,
            cpu: false,
        }
    }
}

impl PipelineOptions {
    pub fn dtype(&self) -> DType {
        if self.use_f16 {
            DType::F16
        } else {
            DType::F32
        }
    }

    pub fn device(&self) -> Result<Device> {
        let device = if self.cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available(0)?
        };
        info!("using device: {:?}", device);
        Ok(device)
    }
}

pub struct TextToImageParams<'a> {
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance_scale: f64,
}

pub struct ImageToImageParams<'a> {
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub image: &'a RgbImage,
    pub steps: usize,
    /// How far the image is pushed back into noise, `0.0` keeps it, `1.0` replaces it.
    pub strength: f64,
    pub guidance_scale: f64,
}

/// Seeds the device random generator, logging instead of failing where the backend cannot be seeded.
pub fn seed(device: &Device, seed: u64) {
    info!("using seed: {}", seed);
    if let Err(err) = device.set_seed(seed) {
        warn!("failed to seed {:?}: {}", device, err);
    }
}

pub async fn load_vae(storage: &Storage, files: &ModelFiles, options: &PipelineOptions, device: &Device) -> Result<Arc<AutoEncoderKL>> {
    let vae_weights = storage.load_weights(&files.vae_repo, &files.vae).await?;
    let sd_config = options.version.sd_config(options.attention_slice_size);

    info!("loading vae from {}", files.vae_repo);
    Ok(Arc::new(sd_config.build_vae(vae_weights, device, options.dtype())?))
}

const END_OF_TEXT: &str = "<|endoftext|>";

struct TextEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    config: clip::Config,
}

impl TextEncoder {
    async fn load(
        storage: &Storage,
        tokenizer_file: (&str, &str),
        weights_file: (&str, &str),
        config: &clip::Config,
        device: &Device,
    ) -> Result<Self> {
        let tokenizer_path = storage.load_model_file(tokenizer_file.0, tokenizer_file.1).await?;
        let weights = storage.load_weights(weights_file.0, weights_file.1).await?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|err| Error::Tokenizer { path: tokenizer_path.clone(), reason: err.to_string() })?;
        // text encoders stay in f32, embeddings are converted afterwards
        let model = stable_diffusion::build_clip_transformer(config, weights, device, DType::F32)?;

        Ok(Self {
            tokenizer,
            model,
            config: config.clone(),
        })
    }

    fn encode(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let vocab = self.tokenizer.get_vocab(true);
        let padding = self.config.pad_with.as_deref().unwrap_or(END_OF_TEXT);
        let pad_id = *vocab.get(padding)
            .ok_or_else(|| Error::Tokenize(format!("padding token {} is missing from vocabulary", padding)))?;

        let eos_id = *vocab.get(END_OF_TEXT)
            .ok_or_else(|| Error::Tokenize(format!("{} is missing from vocabulary", END_OF_TEXT)))?;

        let tokens = self.tokenizer.encode(prompt, true)
            .map_err(|err| Error::Tokenize(err.to_string()))?
            .get_ids()
            .to_vec();

        let max_len = self.config.max_position_embeddings;
        if tokens.len() > max_len {
            warn!("prompt is {} tokens long, truncating to {}", tokens.len(), max_len);
        }
        let tokens = fit_to_context(tokens, max_len, eos_id, pad_id);

        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

struct ModelComponents {
    text_encoders: Vec<TextEncoder>,
    vae: Arc<AutoEncoderKL>,
    unet: UNet2DConditionModel,
}

impl ModelComponents {
    async fn new(
        storage: &Storage,
        files: &ModelFiles,
        sd_config: &StableDiffusionConfig,
        options: &PipelineOptions,
        vae: Arc<AutoEncoderKL>,
        device: &Device,
    ) -> Result<Self> {
        let mut text_encoders = vec![
            TextEncoder::load(
                storage,
                (&files.tokenizer_repo, &files.tokenizer),
                (&files.repo, &files.text_encoder),
                &sd_config.clip,
                device,
            ).await?,
        ];

        if let Some(clip2) = &sd_config.clip2 {
            let (tokenizer_repo, tokenizer, text_encoder) = match (&files.tokenizer_2_repo, &files.tokenizer_2, &files.text_encoder_2) {
                (Some(repo), Some(tokenizer), Some(encoder)) => (repo, tokenizer, encoder),
                _ => return Err(Error::InvalidParameter {
                    name: "model".to_owned(),
                    reason: "this model version needs a second tokenizer and text encoder".to_owned(),
                }),
            };

            text_encoders.push(TextEncoder::load(
                storage,
                (tokenizer_repo, tokenizer),
                (&files.repo, text_encoder),
                clip2,
                device,
            ).await?);
        }

        let unet_weights = storage.load_weights(&files.repo, &files.unet).await?;
        let unet = sd_config.build_unet(unet_weights, device, 4, options.use_flash_attn, options.dtype())?;

        Ok(Self {
            text_encoders,
            vae,
            unet,
        })
    }
}

/// Text encoders and U-Net of one model, sharing an autoencoder that may outlive them.
pub struct DiffusionPipeline {
    device: Device,
    options: PipelineOptions,
    sd_config: StableDiffusionConfig,
    model: ModelComponents,
}

impl DiffusionPipeline {
    pub async fn load(
        storage: &Storage,
        files: &ModelFiles,
        options: &PipelineOptions,
        vae: Arc<AutoEncoderKL>,
        device: &Device,
    ) -> Result<Self> {
        info!("loading {:?} pipeline from {}", options.version, files.repo);

        let sd_config = options.version.sd_config(options.attention_slice_size);
        let model = ModelComponents::new(storage, files, &sd_config, options, vae, device).await?;

        Ok(Self {
            device: device.clone(),
            options: options.clone(),
            sd_config,
            model,
        })
    }

    pub fn text_to_image(&self, params: &TextToImageParams) -> Result<RgbImage> {
        validate_dimensions(params.width, params.height)?;
        validate_steps(params.steps)?;

        info!("generating {}x{} image, steps: {}, guidance: {}", params.width, params.height, params.steps, params.guidance_scale);

        let mut scheduler = self.options.scheduler.build(&self.sd_config, params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let text_embeddings = self.text_embeddings(params.prompt, params.negative_prompt)?;

        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, 4, params.height / 8, params.width / 8),
            &self.device,
        )?;
        let latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.options.dtype())?;

        let latents = self.denoise(scheduler.as_mut(), latents, &timesteps, &text_embeddings, params.guidance_scale)?;
        self.decode(&latents)
    }

    pub fn image_to_image(&self, params: &ImageToImageParams) -> Result<RgbImage> {
        validate_steps(params.steps)?;

        let (width, height) = snap_to_latent_grid(params.image.width(), params.image.height());
        validate_dimensions(width as usize, height as usize)?;
        if (width, height) != params.image.dimensions() {
            debug!("resizing input from {:?} to {}x{}", params.image.dimensions(), width, height);
        }
        let input = resize(params.image, width, height);

        let mut scheduler = self.options.scheduler.build(&self.sd_config, params.steps)?;
        let timesteps = refine_timesteps(scheduler.timesteps(), params.steps, params.strength)?;

        info!(
            "refining {}x{} image, steps: {} of {}, strength: {}, guidance: {}",
            width, height, timesteps.len(), params.steps, params.strength, params.guidance_scale,
        );

        let text_embeddings = self.text_embeddings(params.prompt, params.negative_prompt)?;

        let init_image = image_to_tensor(&input, &self.device, self.options.dtype())?;
        let latents = (self.encode(&init_image)? * self.options.version.vae_scale())?;
        let noise = latents.randn_like(0., 1.)?;
        let latents = scheduler.add_noise(&latents, noise, timesteps[0])?;

        let latents = self.denoise(scheduler.as_mut(), latents, &timesteps, &text_embeddings, params.guidance_scale)?;
        self.decode(&latents)
    }

    // unconditional (negative prompt) embeddings first, as expected by the guidance split
    fn text_embeddings(&self, prompt: &str, negative_prompt: &str) -> Result<Tensor> {
        let mut embeddings = Vec::with_capacity(self.model.text_encoders.len());
        for encoder in &self.model.text_encoders {
            let text_embeddings = encoder.encode(prompt, &self.device)?;
            let uncond_embeddings = encoder.encode(negative_prompt, &self.device)?;
            embeddings.push(Tensor::cat(&[uncond_embeddings, text_embeddings], 0)?);
        }

        Ok(Tensor::cat(&embeddings, D::Minus1)?.to_dtype(self.options.dtype())?)
    }

    fn denoise(
        &self,
        scheduler: &mut dyn Scheduler,
        mut latents: Tensor,
        timesteps: &[usize],
        text_embeddings: &Tensor,
        guidance_scale: f64,
    ) -> Result<Tensor> {
        let progress = ProgressBar::new(timesteps.len() as u64);

        for (timestep_index, &timestep) in timesteps.iter().enumerate() {
            debug!("running timestep index: {}", timestep_index);

            let latent_model_input = Tensor::cat(&[&latents, &latents], 0)?;

            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred = self.model.unet.forward(&latent_model_input, timestep as f64, text_embeddings)?;
            let noise_pred = noise_pred.chunk(2, 0)?;
            let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
            let noise_pred = (noise_pred_uncond + ((noise_pred_text - noise_pred_uncond)? * guidance_scale)?)?;
            latents = scheduler.step(&noise_pred, timestep, &latents)?;

            progress.inc(1);
        }
        progress.finish_and_clear();

        Ok(latents)
    }

    fn encode(&self, image: &Tensor) -> Result<Tensor> {
        let (_, _, height, width) = image.dims4()?;
        let latents = if self.options.vae_tiling && tiling::needs_tiling(height, width, SAMPLE_TILE_SIZE) {
            debug!("encoding {}x{} with tiled vae", width, height);
            tiling::tiled_encode(&self.model.vae, image)?
        } else {
            self.model.vae.encode(image)?.sample()?
        };
        Ok(latents)
    }

    fn decode(&self, latents: &Tensor) -> Result<RgbImage> {
        let latents = (latents / self.options.version.vae_scale())?;
        let (_, _, height, width) = latents.dims4()?;

        let image = if self.options.vae_tiling && tiling::needs_tiling(height, width, LATENT_TILE_SIZE) {
            debug!("decoding {}x{} latents with tiled vae", width, height);
            tiling::tiled_decode(&self.model.vae, &latents)?
        } else {
            self.model.vae.decode(&latents)?
        };

        tensor_to_image(&image)
    }
}

/// Index of the first scheduler timestep used when refining with the given strength.
pub fn image_to_image_start_step(steps: usize, strength: f64) -> usize {
    let init_timestep = ((steps as f64 * strength) as usize).min(steps);
    steps - init_timestep
}

/// Timesteps left to run when refining with the given strength.
pub fn refine_timesteps(timesteps: &[usize], steps: usize, strength: f64) -> Result<Vec<usize>> {
    if !(0.0..=1.0).contains(&strength) {
        return Err(Error::InvalidParameter {
            name: "strength".to_owned(),
            reason: format!("{} is not between 0.0 and 1.0", strength),
        });
    }

    let t_start = image_to_image_start_step(steps, strength).min(timesteps.len());
    let remaining = timesteps[t_start..].to_vec();
    if remaining.is_empty() {
        return Err(Error::InvalidParameter {
            name: "strength".to_owned(),
            reason: format!("strength {} with {} steps leaves nothing to denoise", strength, steps),
        });
    }

    Ok(remaining)
}

// the end-of-text token stays last when a prompt is cut
fn fit_to_context(mut tokens: Vec<u32>, max_len: usize, eos_id: u32, pad_id: u32) -> Vec<u32> {
    if tokens.len() > max_len {
        tokens.truncate(max_len.saturating_sub(1));
        tokens.push(eos_id);
    }
    tokens.resize(max_len, pad_id);
    tokens
}

fn validate_dimensions(width: usize, height: usize) -> Result<()> {
    if width == 0 || height == 0 || width % 8 != 0 || height % 8 != 0 {
        return Err(Error::InvalidDimensions {
            width,
            height,
            reason: "both sides must be positive multiples of 8".to_owned(),
        });
    }
    Ok(())
}

fn validate_steps(steps: usize) -> Result<()> {
    if steps == 0 {
        return Err(Error::InvalidParameter {
            name: "steps".to_owned(),
            reason: "must be greater than 0".to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_step_follows_strength() {
        assert_eq!(image_to_image_start_step(35, 0.35), 23);
        assert_eq!(image_to_image_start_step(25, 0.45), 14);
        assert_eq!(image_to_image_start_step(20, 0.30), 14);
        assert_eq!(image_to_image_start_step(20, 1.0), 0);
        assert_eq!(image_to_image_start_step(20, 0.0), 20);
    }

    fn dpm_timesteps(steps: usize) -> Vec<usize> {
        (0..steps).rev().map(|i| i * 999 / (steps - 1)).collect()
    }

    #[test]
    fn refine_timesteps_start_from_strength() {
        let timesteps = dpm_timesteps(35);
        let remaining = refine_timesteps(&timesteps, 35, 0.35).unwrap();

        assert_eq!(remaining.len(), 12);
        assert_eq!(remaining[0], timesteps[23]);
        assert_eq!(refine_timesteps(&timesteps, 35, 1.0).unwrap(), timesteps);
    }

    #[test]
    fn strength_outside_unit_range_is_rejected() {
        let timesteps = dpm_timesteps(35);
        for strength in [1.5, -0.1] {
            let result = refine_timesteps(&timesteps, 35, strength);
            assert!(matches!(result, Err(Error::InvalidParameter { ref name, .. }) if name == "strength"));
        }
    }

    #[test]
    fn strength_leaving_no_steps_is_rejected() {
        let timesteps = dpm_timesteps(35);
        let result = refine_timesteps(&timesteps, 35, 0.01);
        assert!(matches!(result, Err(Error::InvalidParameter { ref name, .. }) if name == "strength"));
    }

    #[test]
    fn long_prompts_keep_end_of_text_token() {
        let tokens: Vec<u32> = (1..=100).collect();
        let fitted = fit_to_context(tokens, 77, 49407, 0);

        assert_eq!(fitted.len(), 77);
        assert_eq!(fitted[75], 76);
        assert_eq!(fitted[76], 49407);
    }

    #[test]
    fn short_prompts_are_padded() {
        let fitted = fit_to_context(vec![49406, 320, 49407], 6, 49407, 0);
        assert_eq!(fitted, vec![49406, 320, 49407, 0, 0, 0]);
    }

    #[test]
    fn dimensions_must_fit_latent_grid() {
        assert!(validate_dimensions(512, 288).is_ok());
        assert!(validate_dimensions(960, 540).is_err());
        assert!(validate_dimensions(0, 512).is_err());
    }

    #[test]
    fn xl_files_include_second_encoder() {
        let files = StableDiffusionVersion::Xl.default_files(true);
        assert_eq!(files.text_encoder_2.as_deref(), Some("text_encoder_2/model.fp16.safetensors"));
        assert_eq!(files.vae_repo, "madebyollin/sdxl-vae-fp16-fix");

        let files = StableDiffusionVersion::V1_5.default_files(true);
        assert!(files.text_encoder_2.is_none());
        assert_eq!(files.unet, "unet/diffusion_pytorch_model.bin");
        assert_eq!(files.vae_repo, "stabilityai/sd-vae-ft-mse");
    }

    #[test]
    fn vae_scale_per_version() {
        assert_eq!(StableDiffusionVersion::V1_5.vae_scale(), 0.18215);
        assert_eq!(StableDiffusionVersion::Xl.vae_scale(), 0.13025);
    }

    #[test]
    fn options_default_to_half_precision() {
        let options = PipelineOptions::default();
        assert_eq!(options.dtype(), DType::F16);
        assert_eq!(options.scheduler, SchedulerKind::DpmSolverMultistep);
    }
}
