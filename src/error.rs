use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("compute device `{0}` is not available")]
    DeviceUnavailable(String),

    #[error("checkpoint storage: {0}")]
    Storage(#[from] std::io::Error),

    #[error("checkpoint record: {0}")]
    Record(#[from] burn::record::RecorderError),

    #[error("config: {0}")]
    Config(#[from] burn::config::ConfigError),

    #[error("image decode: {0}")]
    Image(#[from] image::ImageError),

    #[error("checkpoint metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("incompatible model and run configuration: {0}")]
    Incompatible(String),
}

pub type Result<T> = std::result::Result<T, Error>;
