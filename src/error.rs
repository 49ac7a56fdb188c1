use thiserror::Error;

/// Startup configuration problems. Always fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Failure of the refresh-token exchange.
///
/// `Clone` so that a single in-flight refresh can hand the same failure to
/// every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Token exchange rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Token exchange request failed: {0}")]
    Request(String),

    #[error("Token exchange timed out")]
    Timeout,

    #[error("Invalid token response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AuthError::Timeout
        } else if err.is_decode() {
            AuthError::InvalidResponse(err.to_string())
        } else {
            AuthError::Request(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    /// Worth retrying on the next cycle (timeouts, 5xx, rate limiting).
    #[error("Transient fetch failure: {0}")]
    Transient(String),

    /// Retrying will not help (unexpected status, malformed payload).
    #[error("Permanent fetch failure: {0}")]
    Permanent(String),

    #[error("Status request still unauthorized after a token refresh")]
    Unauthorized,

    #[error("Could not obtain a credential: {0}")]
    Auth(#[from] AuthError),
}

impl FetchError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::Permanent(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Permanent(err.to_string())
        } else {
            FetchError::Transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Permanent(format!("Malformed playback payload: {}", err))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// The message (or its channel) no longer exists.
    #[error("Message or channel not found")]
    NotFound,

    #[error("Messaging request failed: {0}")]
    Other(String),
}

impl From<reqwest::Error> for MessagingError {
    fn from(err: reqwest::Error) -> Self {
        MessagingError::Other(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Control request rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Control request failed: {0}")]
    Request(String),

    #[error("Control request timed out")]
    Timeout,

    #[error("Could not obtain a credential: {0}")]
    Auth(#[from] AuthError),
}

impl From<reqwest::Error> for ControlError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ControlError::Timeout
        } else {
            ControlError::Request(err.to_string())
        }
    }
}

/// Errors surfaced by the engine lifecycle.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Poll task panicked or cancelled")]
    TaskJoin(#[from] tokio::task::JoinError),
}
