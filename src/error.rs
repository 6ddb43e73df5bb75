use http::StatusCode;

/// Errors produced while loading, probing, or transforming an image.
///
/// The gateway service is the only place these become HTTP responses; every
/// other component bubbles them up through its return value.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input grammar violation: size string, dppx, save-data, trim-border.
    #[error("{0}")]
    BadRequest(String),

    /// The origin answered the source fetch with a non-200 status.
    #[error("expected 200 but got code {status}. Error '{reason}'")]
    LoadNon200 {
        /// Status the origin returned.
        status: StatusCode,
        /// The origin's reason phrase.
        reason: String,
    },

    /// Network or transport failure while fetching the source.
    #[error(transparent)]
    LoadIo(#[from] reqwest::Error),

    /// The identify subprocess failed.
    #[error("error executing identify command: {stderr}")]
    ProbeFailed {
        /// Captured stderr of the identify run.
        stderr: String,
    },

    /// The convert subprocess failed.
    #[error("error executing convert command: {stderr}")]
    EngineFailed {
        /// Captured stderr of the convert run.
        stderr: String,
    },

    /// A loader-supplied status and message, mapped to the response verbatim.
    #[error("{message}")]
    Http {
        /// Status to answer with.
        status: StatusCode,
        /// Plain-text response body.
        message: String,
    },

    /// The worker count was not positive at startup.
    #[error("worker count must be positive")]
    PoolMisconfigured,

    /// A worker went away before completing the job.
    #[error("worker terminated before completing the transformation")]
    WorkerLost,

    /// The engine binaries could not be resolved at startup.
    #[error("{0}")]
    EngineInit(String),
}

impl Error {
    /// The HTTP status the gateway answers with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Http { status, .. } => *status,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
