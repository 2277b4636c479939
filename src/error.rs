use std::io;

/// Everything that can go wrong, funneled into one channel so the CLI
/// adapter can print a single line and exit non-zero.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    BadInput(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("missing claim: {0}")]
    MissingClaim(&'static str),

    #[error("token expiry is missing, not a number, or not in the future")]
    ExpInvalid,

    #[error("invalid public key: {0}")]
    BadKey(String),

    #[error("crypto failure: {0}")]
    CryptoFail(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Only transport failures and 5xx responses are worth another attempt,
    /// everything else is surfaced as-is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Self::CryptoFail(err.to_string())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(err) => Self::Io(err),
            other => Self::Io(io::Error::other(other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
