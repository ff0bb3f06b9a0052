use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlateError {
    #[error("failed to load image {path:?}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Runtime(#[from] ort::Error),
    #[error("recognition failed: {0}")]
    Recognition(String),
}

pub type Result<T> = std::result::Result<T, PlateError>;
