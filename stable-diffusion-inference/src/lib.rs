// based on https://github.com/huggingface/candle/tree/main/candle-examples/examples/stable-diffusion

pub mod error;
pub mod memory;
pub mod model;
pub mod schedulers;
pub mod storage;
pub mod tiling;
pub mod utils;

pub use {
    error::{Error, Result},
    model::{
        DiffusionPipeline,
        ImageToImageParams,
        ModelFiles,
        PipelineOptions,
        StableDiffusionVersion,
        TextToImageParams,
        load_vae,
    },
    schedulers::SchedulerKind,
    storage::{Storage, StorageSettings},
};
