use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Unexpected response: {0}")]
    Protocol(String),

    #[error("Obfuscation error: {0}")]
    Obfuscation(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification surfaced to the host alongside the sticky error flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, connection resets, 500/502/503/504.
    Transient,
    /// Expired or invalid credentials.
    Authentication,
    /// Quota, validation and other non-success responses.
    Rejected,
    /// Local filesystem failures.
    Local,
    Configuration,
}

impl Error {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Error::Http {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Local,
            Error::Config(_) | Error::Obfuscation(_) => ErrorKind::Configuration,
            Error::Unauthorized(_) => ErrorKind::Authentication,
            Error::Http { status, .. } => match *status {
                401 | 403 => ErrorKind::Authentication,
                408 | 429 | 500 | 502 | 503 | 504 => ErrorKind::Transient,
                _ => ErrorKind::Rejected,
            },
            Error::Network(_) | Error::NotConnected(_) => ErrorKind::Transient,
            Error::Serialization(_)
            | Error::Protocol(_)
            | Error::Backend(_)
            | Error::Other(_) => ErrorKind::Rejected,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert_eq!(Error::http(401, "expired").kind(), ErrorKind::Authentication);
        assert_eq!(Error::http(503, "busy").kind(), ErrorKind::Transient);
        assert_eq!(Error::http(429, "slow down").kind(), ErrorKind::Transient);
        assert_eq!(Error::http(409, "conflict").kind(), ErrorKind::Rejected);
        assert_eq!(Error::http(504, "gateway").status(), Some(504));
    }

    #[test]
    fn test_permanent_server_errors_are_rejected() {
        assert_eq!(Error::http(500, "oops").kind(), ErrorKind::Transient);
        assert_eq!(Error::http(502, "bad gateway").kind(), ErrorKind::Transient);
        assert_eq!(Error::http(504, "gateway").kind(), ErrorKind::Transient);
        assert_eq!(Error::http(501, "not implemented").kind(), ErrorKind::Rejected);
        assert_eq!(Error::http(505, "version").kind(), ErrorKind::Rejected);
        assert_eq!(Error::http(507, "insufficient storage").kind(), ErrorKind::Rejected);
        assert_eq!(Error::Network("reset".into()).status(), None);
    }
}
