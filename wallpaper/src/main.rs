use {
    tracing::info,
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
    crate::settings::{Settings, BASE_FILE_NAME, RAW_FILE_NAME, FINAL_FILE_NAME},
};

pub mod settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let settings: Settings = load_settings()?;

    let total_parts = settings.refine_stages.len() + 2;

    info!("{}", "=".repeat(60));
    info!("4k wallpaper generation");
    info!("strategy: {}", settings.strategy());
    info!("{}", "=".repeat(60));

    let output = OutputDir::create(&settings.output_dir)?;
    let options = settings.pipeline_options();
    let files = settings.model_files();
    let device = options.device()?;
    let storage = Storage::new(settings.storage.clone());
    let mut saved = Vec::new();

    info!("--- [1/{}] generating base composition ---", total_parts);
    let vae = load_vae(&storage, &files, &options, &device).await?;
    let pipeline = DiffusionPipeline::load(&storage, &files, &options, vae.clone(), &device).await?;

    if let Some(value) = settings.seed {
        seed(&device, value);
    }

    let base_image = pipeline.text_to_image(&TextToImageParams {
        prompt: &settings.prompt,
        negative_prompt: &settings.negative_prompt,
        width: settings.base_width,
        height: settings.base_height,
        steps: settings.base_steps,
        guidance_scale: settings.guidance,
    })?;
    saved.push(output.save(&base_image, BASE_FILE_NAME)?);

    let mut current = base_image;
    release(pipeline, &device);

    if !settings.refine_stages.is_empty() {
        let refiner = DiffusionPipeline::load(&storage, &files, &options, vae.clone(), &device).await?;

        for (index, stage) in settings.refine_stages.iter().enumerate() {
            info!("--- [{}/{}] refining to {}x{} ---", index + 2, total_parts, stage.width, stage.height);
            clear_memory(&device);

            let input = resize(&current, stage.width, stage.height);
            current = refiner.image_to_image(&ImageToImageParams {
                prompt: &settings.prompt,
                negative_prompt: &settings.negative_prompt,
                image: &input,
                steps: stage.steps,
                strength: stage.strength,
                guidance_scale: settings.guidance,
            })?;
            saved.push(output.save(&current, &stage.file_name)?);
        }

        release(refiner, &device);
    }
    release(vae, &device);

    info!("--- [{}/{}] upscaling to {}x{} ---", total_parts, total_parts, settings.final_width, settings.final_height);
    let wallpaper = resize(&current, settings.final_width, settings.final_height);

    info!("--- applying 4k enhancement ---");
    let enhanced = enhance(&wallpaper, &settings.enhance);
    let final_path = output.save(&enhanced, FINAL_FILE_NAME)?;
    saved.push(output.save(&wallpaper, RAW_FILE_NAME)?);
    saved.push(final_path);

    info!("{}", "=".repeat(60));
    info!("4k wallpaper generation complete");
    info!("output files:");
    for (index, path) in saved.iter().enumerate() {
        info!("  {}. {}", index + 1, path.display());
    }
    info!("{}", "=".repeat(60));

    Ok(())
}
