use crate::message::ParseError;
use crate::types::ScanId;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by the scan engine. A timeout is not one of them: it is
/// recorded as [`crate::types::ScanState::TimedOut`] on the scan itself.
#[derive(Debug, Error)]
pub enum Error {
    #[error("scan {0} not found")]
    NotFound(ScanId),

    #[error("template result {result_id} not found in scan {scan_id}")]
    ResultNotFound { scan_id: ScanId, result_id: u64 },

    #[error("invalid target: {reason}")]
    InvalidTarget {
        reason: String,
        #[source]
        source: Option<ParseError>,
    },

    #[error("scan {0} is running")]
    ScanBusy(ScanId),

    #[error("scan {id} failed: {message}")]
    WorkerFailure { id: ScanId, message: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn missing_request() -> Self {
        Error::InvalidTarget {
            reason: "target has no request".into(),
            source: None,
        }
    }

    pub(crate) fn unparseable_request(err: ParseError) -> Self {
        Error::InvalidTarget {
            reason: format!("request does not parse ({err})"),
            source: Some(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::ResultNotFound { .. })
    }
}
