use thiserror::Error;

/// Errors that can occur across the pool controller and the SSH broker.
///
/// Every variant is a *kind*, not a wrapper around an implementation type:
/// callers branch on the kind (idempotent deletes tolerate `NotFound`, lease
/// acquisition retries on `Conflict`) without knowing which cloud produced it.
#[derive(Error, Debug)]
pub enum Error {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("conflict on {0}")]
    Conflict(String),

    #[error("dependency unavailable: {0}")]
    Unavailable(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("remote command failed: {0}")]
    Remote(String),

    #[error("cloud request failed: {0}")]
    Cloud(String),
}

impl Error {
    /// Short kind label used in structured log lines and user-visible
    /// diagnostics (`Error connecting to box: <kind>`).
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Unavailable(_) => "unavailable",
            Error::Timeout(_) => "timeout",
            Error::Invalid(_) => "invalid",
            Error::Remote(_) => "remote",
            Error::Cloud(_) => "cloud",
        }
    }

    /// Whether a bounded retry is worth attempting. Conflicts are not
    /// retried blindly: losing a tag race means re-reading state first,
    /// which is the caller's job.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Cloud(_) | Error::Timeout(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Cloud(err.to_string())
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Remote(err.to_string())
    }
}

impl From<ssh2::Error> for Error {
    fn from(err: ssh2::Error) -> Self {
        Error::Remote(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(Error::NotFound("x".into()).kind(), "not_found");
        assert_eq!(Error::Conflict("x".into()).kind(), "conflict");
        assert_eq!(Error::Unavailable("x".into()).kind(), "unavailable");
        assert_eq!(Error::Timeout("x".into()).kind(), "timeout");
        assert_eq!(Error::Invalid("x".into()).kind(), "invalid");
        assert_eq!(Error::Remote("x".into()).kind(), "remote");
        assert_eq!(Error::Cloud("x".into()).kind(), "cloud");
    }

    #[test]
    fn transient_classification() {
        assert!(Error::Cloud("throttled".into()).is_transient());
        assert!(Error::Timeout("poller".into()).is_transient());
        assert!(!Error::Conflict("tag race".into()).is_transient());
        assert!(!Error::Invalid("empty suffix".into()).is_transient());
        assert!(!Error::NotFound("gone".into()).is_transient());
    }
}
