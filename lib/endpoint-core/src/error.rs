use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unknown endpoint prefix '{0}'")]
    InvalidPrefix(String),

    #[error("endpoint identifier not supported")]
    UnsupportedId,

    #[error("invalid endpoint ID: {0}")]
    InvalidEndpointId(String),

    #[error("unable to reuse endpoint ID: {0}")]
    IdReuse(String),

    #[error("no more endpoint IDs available")]
    IdPoolExhausted,

    #[error("unable to release endpoint ID {0}")]
    IdRelease(u16),

    #[error("endpoint ID is already set to {0}")]
    IdAlreadySet(u16),

    #[error("context cancelled")]
    Cancelled,

    #[error("proxy updates failed: {0}")]
    ProxyUpdate(String),

    #[error("completion failed: {0}")]
    Completion(String),

    #[error("unable to build notification: {0}")]
    Notification(String),

    #[error("endpoint error: {0}")]
    Endpoint(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Notification(err.to_string())
    }
}
