use {
    std::path::PathBuf,
    thiserror::Error,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("tensor operation failed: {0}")]
    Candle(#[from] candle::Error),

    #[error("failed to load tokenizer {path}: {reason}")]
    Tokenizer {
        path: PathBuf,
        reason: String,
    },

    #[error("failed to tokenize prompt: {0}")]
    Tokenize(String),

    #[error("failed to download {name}: {source}")]
    Download {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("unsupported image dimensions {width}x{height}: {reason}")]
    InvalidDimensions {
        width: usize,
        height: usize,
        reason: String,
    },

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter {
        name: String,
        reason: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
