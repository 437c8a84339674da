// =============================================================================
// Error taxonomy shared by the client, store and ingestion layers
// =============================================================================

use std::path::PathBuf;

use thiserror::Error;

/// Failures talking to the upstream market-data source. Never fatal for a
/// batch: the affected instrument is skipped.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network error, timeout or non-2xx status.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Payload decoded but lacks required blocks or columns.
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::MalformedResponse(e.to_string())
        } else {
            Self::UpstreamUnavailable(e.to_string())
        }
    }
}

/// Failures of the persisted candle files. Fatal for the operation on that
/// instrument.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store CSV error on {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        Self::Csv {
            path: path.into(),
            source,
        }
    }
}
