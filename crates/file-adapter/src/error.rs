//! Error taxonomy for the file-based backend, following the same
//! `thiserror` layering as every other crate in this workspace.

#[derive(Debug, thiserror::Error)]
pub enum FileAdapterError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    HttpStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("document changed underneath a compare-and-swap write after {attempts} retries")]
    CasExhausted { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, FileAdapterError>;
