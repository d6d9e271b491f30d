//! Per-request errors. The `Display` text of each variant is what the caller
//! sees in the `error` field of the response line.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid header JSON: {0}")]
    InvalidHeader(String),

    #[error("Invalid data_length: {0}")]
    InvalidDataLength(String),

    #[error("{what} of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        what: &'static str,
        size: u64,
        limit: u64,
    },

    #[error("Line exceeds limit of {0} bytes")]
    LineTooLong(usize),

    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] serde_json::Error),

    #[error("Unknown command type: {0}")]
    UnknownCommand(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Missing image data")]
    MissingImage,

    #[error("Empty image data")]
    EmptyImage,

    #[error("Base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("crop_info and roi_info are mutually exclusive")]
    ConflictingCrop,

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Failed to load model: {0:#}")]
    ModelLoad(anyhow::Error),

    #[error("Processing error: {0:#}")]
    Processing(anyhow::Error),
}

pub type WorkerResult<T> = Result<T, WorkerError>;
