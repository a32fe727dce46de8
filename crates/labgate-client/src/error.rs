use labgate_core::machine::MachineId;
use labgate_core::pagination::PageError;
use labgate_core::time::Revision;

/// Failures from the REST transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    /// The request never produced a response (connect, DNS, TLS, reset).
    #[error("HTTP request failed: {0}")]
    Network(String),

    #[error("HTTP request timed out")]
    Timeout,

    /// The server answered with a non-2xx status. `message` is the body's
    /// `message` field when it had one.
    #[error("server returned HTTP {status}")]
    Status {
        status: u16,
        message: Option<String>,
    },

    /// A 2xx response whose body was not JSON.
    #[error("response body is not JSON: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for HttpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Error taxonomy of the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Network or HTTP failure. Nothing was written to the mirror.
    #[error("transport failure: {0}")]
    Transport(HttpError),

    /// The server rejected the submitted data (HTTP 422).
    #[error("{message}")]
    Validation { message: String },

    /// The response did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// The request succeeded but not every requested machine was unlocked.
    #[error("{unlocked} of {requested} machines unlocked, {failed} failed")]
    PartialOutcome {
        requested: usize,
        unlocked: usize,
        failed: usize,
    },

    /// A write lost the revision race. Never shown to the operator.
    #[error("stale write to machine {machine} rejected: {incoming} is older than {stored}")]
    StaleWriteRejected {
        machine: MachineId,
        stored: Revision,
        incoming: Revision,
    },

    #[error(transparent)]
    Page(#[from] PageError),
}

const GENERIC_VALIDATION: &str = "The submitted data was rejected by the server.";

impl From<HttpError> for SyncError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Status {
                status: 422,
                message,
            } => Self::Validation {
                message: message.unwrap_or_else(|| GENERIC_VALIDATION.to_string()),
            },
            HttpError::Decode(msg) => Self::Decode(msg),
            other => Self::Transport(other),
        }
    }
}

impl SyncError {
    /// Text suitable for a notification. Server-provided messages are passed
    /// through verbatim.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(HttpError::Status {
                message: Some(m), ..
            }) => m.clone(),
            Self::Transport(HttpError::Status {
                status,
                message: None,
            }) => format!("Request failed (HTTP {status})."),
            Self::Transport(HttpError::Timeout) => "The server did not respond in time.".to_string(),
            Self::Transport(_) => "Unable to reach the server.".to_string(),
            Self::Decode(_) => "Unexpected response from the server.".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether the operator should hear about this error.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, Self::StaleWriteRejected { .. })
    }
}
