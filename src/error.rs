use thiserror::Error;

/// Result alias for the capture/storage layer.
pub type Result<T> = std::result::Result<T, HomewatchError>;

/// Errors surfaced by the source, probe and storage components.
///
/// The pipeline controller maps these onto its closed set of outcome
/// codes; everything above the controller uses `anyhow`.
#[derive(Error, Debug)]
pub enum HomewatchError {
    #[error("failed to open video source: {0}")]
    OpenFailed(String),

    #[error("frame read failed on {0} — source may have dropped")]
    ReadFailed(String),

    #[error("unsupported transport protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("no stored network device with index {0}")]
    UnknownStoredIndex(i64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
}
