//! Error taxonomy shared by the pipeline, the store and the query service.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed fact or offset. Builders recover from these locally.
    #[error("parse error: {0}")]
    Parse(String),

    /// A requested top-level entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store is missing its table marker or uses an unknown layout.
    #[error("format error: {0}")]
    Format(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request cancelled")]
    Cancelled,
}

impl Error {
    /// Stable error code reported to RPC clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidRequest(_) | Self::Parse(_) | Self::Json(_) => "invalid_request",
            Self::Cancelled => "cancelled",
            Self::Format(_) => "format",
            Self::Storage(_) | Self::Pool(_) | Self::Io(_) | Self::Codec(_) => "internal",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_separate_missing_entities_from_storage_faults() {
        assert_eq!(Error::NotFound("kythe:#x".into()).code(), "not_found");
        assert_eq!(
            Error::Io(std::io::Error::other("disk gone")).code(),
            "internal"
        );
        assert_eq!(Error::Format("no marker".into()).code(), "format");
        assert!(Error::NotFound(String::new()).is_not_found());
        assert!(!Error::Cancelled.is_not_found());
    }
}
