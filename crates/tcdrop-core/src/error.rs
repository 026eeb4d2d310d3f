use thiserror::Error;

pub type TcdropResult<T> = Result<T, TcdropError>;

#[derive(Debug, Error)]
pub enum TcdropError {
    /// Malformed or unsupported header, tag, length, or field value
    #[error("format error: {0}")]
    Format(String),

    /// The input does not start with the container magic
    #[error("unrecognized format: not a tcdrop container")]
    UnrecognizedFormat,

    #[error("authentication failed: ciphertext or tag was modified")]
    Authentication,

    #[error("password required")]
    PasswordRequired,

    #[error("password incorrect")]
    PasswordIncorrect,

    #[error("key-wrapping oracle failed: {0}")]
    Oracle(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// API misuse by the caller, never caused by input data
    #[error("usage error: {0}")]
    Usage(String),

    #[error("range mismatch: expected {expected} bytes, got {got}")]
    RangeMismatch { expected: u64, got: u64 },

    #[error("truncated container: {0}")]
    Truncated(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What the user should be told, independent of the internal cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    /// The link is malformed, expired, or points at something that is not a container
    InvalidLink,
    WrongPassword,
    NetworkFailure,
    /// The container was modified or damaged in storage
    Corrupted,
    Internal,
}

impl TcdropError {
    pub fn reason(&self) -> ReasonCode {
        match self {
            TcdropError::Format(_) | TcdropError::UnrecognizedFormat => ReasonCode::InvalidLink,
            TcdropError::PasswordRequired | TcdropError::PasswordIncorrect => {
                ReasonCode::WrongPassword
            }
            TcdropError::Oracle(_) | TcdropError::Transport(_) | TcdropError::Io(_) => {
                ReasonCode::NetworkFailure
            }
            TcdropError::Authentication
            | TcdropError::Truncated(_)
            | TcdropError::RangeMismatch { .. } => ReasonCode::Corrupted,
            TcdropError::Usage(_) | TcdropError::Config(_) | TcdropError::Other(_) => {
                ReasonCode::Internal
            }
        }
    }

    /// True for failures the caller may retry without changing the input
    /// (re-prompting for a password counts).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TcdropError::PasswordRequired | TcdropError::PasswordIncorrect
        )
    }
}
