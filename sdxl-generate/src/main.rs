use {
    tracing::info,
    pipeline_common::{
        enhance::enhance,
        output::OutputDir,
        utils::{init_logging, load_settings},
    },
    stable_diffusion_inference::{
        DiffusionPipeline,
        Storage,
        TextToImageParams,
        load_vae,
        memory::release,
        model::seed,
    },
    crate::settings::{Settings, BASE_FILE_NAME, ENHANCED_FILE_NAME},
};

pub mod settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let settings: Settings = load_settings()?;

    info!("{}", "=".repeat(50));
    info!("sdxl image generation pipeline");
    info!("{}", "=".repeat(50));

    let output = OutputDir::create(&settings.output_dir)?;
    let options = settings.pipeline_options();
    let files = settings.model_files();
    let device = options.device()?;
    let storage = Storage::new(settings.storage.clone());

    info!("--- loading sdxl model ---");
    let vae = load_vae(&storage, &files, &options, &device).await?;
    let pipeline = DiffusionPipeline::load(&storage, &files, &options, vae, &device).await?;

    if let Some(value) = settings.seed {
        seed(&device, value);
    }

    info!("--- generating base image ({}x{}) ---", settings.base_width, settings.base_height);
    let base_image = pipeline.text_to_image(&TextToImageParams {
        prompt: &settings.prompt,
        negative_prompt: &settings.negative_prompt,
        width: settings.base_width,
        height: settings.base_height,
        steps: settings.base_steps,
        guidance_scale: settings.base_guidance,
    })?;
    let base_path = output.save(&base_image, BASE_FILE_NAME)?;

    info!("--- applying post-processing enhancements ---");
    let enhanced_image = enhance(&base_image, &settings.enhance);
    let enhanced_path = output.save(&enhanced_image, ENHANCED_FILE_NAME)?;

    release(pipeline, &device);

    info!("{}", "=".repeat(50));
    info!("sdxl generation complete");
    info!("output files:");
    info!("  1. {} - initial ({}x{})", base_path.display(), settings.base_width, settings.base_height);
    info!("  2. {} - post-processed", enhanced_path.display());
    info!("{}", "=".repeat(50));

    Ok(())
}
