use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF error in {path}: {source}")]
    Tiff {
        path: PathBuf,
        #[source]
        source: tiff::TiffError,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Pixel layout we do not decode (e.g. RGB or 64-bit samples).
    #[error("Unsupported pixel format in {path}: {format}")]
    UnsupportedPixels { path: PathBuf, format: String },

    #[error("Shape mismatch: mask is {mask:?}, image is {image:?}")]
    ShapeMismatch {
        mask: (usize, usize),
        image: (usize, usize),
    },

    #[error("{program} exited with code {code} for {target}")]
    ExternalTool {
        program: String,
        target: String,
        code: i32,
    },

    #[error("Segmentation failed: {0}")]
    Segmentation(String),

    #[error("{failed} of {total} {what} failed")]
    Batch {
        what: &'static str,
        failed: usize,
        total: usize,
    },

    #[error("Aborted")]
    Aborted,
}

impl Error {
    pub(crate) fn tiff(path: impl Into<PathBuf>, source: tiff::TiffError) -> Self {
        Error::Tiff {
            path: path.into(),
            source,
        }
    }
}
