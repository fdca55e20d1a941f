use thiserror::Error;

/// Errors produced by the tunnel protocol layer.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("unknown frame type: {0}")]
    UnknownFrameType(String),

    #[error("invalid subdomain: {0}")]
    InvalidSubdomain(String),

    #[error("subdomain taken: {0}")]
    SubdomainTaken(String),

    #[error("subdomain reserved: {0}")]
    ReservedSubdomain(String),

    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("registration timed out")]
    RegistrationTimeout,

    #[error("request timed out")]
    Timeout,

    #[error("session closed")]
    SessionClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("local service error: {0}")]
    LocalService(String),

    #[error("no free port in range {0}-{1}")]
    PortExhausted(u16, u16),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for TunnelError {
    fn from(e: serde_json::Error) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
