use thiserror::Error;

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("empty resource identifier")]
    EmptyResource,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json decode error at line {line}: {source}")]
    JsonLine {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("redis error: {0}")]
    Redis(Box<redis::RedisError>),
    #[error("redis is not connected")]
    QueueUnavailable,
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, std::time::Duration),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(Box::new(err))
    }
}

impl Error {
    /// Whether retrying the failed operation could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Redis(err) => {
                err.is_connection_dropped()
                    || err.is_connection_refusal()
                    || err.is_timeout()
                    || err.is_io_error()
            }
            Error::Io(_) | Error::Timeout(..) => true,
            _ => false,
        }
    }
}
