use {
    tracing::info,
    rand::{Rng, SeedableRng, rngs::StdRng},
    pipeline_common::{
        enhance::enhance,
        output::OutputDir,
        utils::{init_logging, load_settings},
    },
    stable_diffusion_inference::{
        DiffusionPipeline,
        ImageToImageParams,
        Storage,
        TextToImageParams,
        load_vae,
        memory::{clear_memory, release},
        model::seed,
        utils::resize,
    },
    crate::settings::{Settings, base_file_name, refined_file_name, enhanced_file_name},
};

pub mod settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let settings: Settings = load_settings()?;

    info!("{}", "=".repeat(50));
    info!("bulk image generation: {} images", settings.num_images);
    info!("{}", "=".repeat(50));

    let output = OutputDir::create(&settings.output_dir)?;
    let options = settings.pipeline_options();
    let files = settings.model_files();
    let device = options.device()?;
    let storage = Storage::new(settings.storage.clone());

    let vae = load_vae(&storage, &files, &options, &device).await?;
    let (target_width, target_height) = settings.target_size();
    let mut rng = StdRng::from_entropy();

    for i in 1..=settings.num_images {
        info!("--- generating image {}/{} ---", i, settings.num_images);
        seed(&device, rng.gen_range(0..u32::MAX as u64));

        let pipeline = DiffusionPipeline::load(&storage, &files, &options, vae.clone(), &device).await?;
        let base_image = pipeline.text_to_image(&TextToImageParams {
            prompt: &settings.prompt,
            negative_prompt: &settings.negative_prompt,
            width: settings.base_width,
            height: settings.base_height,
            steps: settings.base_steps,
            guidance_scale: settings.base_guidance,
        })?;
        output.save(&base_image, &base_file_name(i))?;

        let upscaled_input = resize(&base_image, target_width, target_height);

        let refiner = if settings.reload_between_stages {
            release(pipeline, &device);
            let refiner = DiffusionPipeline::load(&storage, &files, &options, vae.clone(), &device).await?;
            clear_memory(&device);
            refiner
        } else {
            pipeline
        };

        let refined_image = refiner.image_to_image(&ImageToImageParams {
            prompt: &settings.prompt,
            negative_prompt: &settings.negative_prompt,
            image: &upscaled_input,
            steps: settings.refiner_steps,
            strength: settings.refiner_strength,
            guidance_scale: settings.refiner_guidance,
        })?;
        output.save(&refined_image, &refined_file_name(i))?;

        let enhanced_image = enhance(&refined_image, &settings.enhance);
        output.save(&enhanced_image, &enhanced_file_name(i))?;

        release(refiner, &device);
    }

    info!("{}", "=".repeat(50));
    info!("bulk generation complete, {} images saved in '{}'", settings.num_images, settings.output_dir);
    info!("{}", "=".repeat(50));

    Ok(())
}
