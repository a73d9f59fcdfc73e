use std::fmt;

/// Classification of every failure the tool can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidTargetUri,
    InvalidStoreAddress,
    Config,
    Acquire,
    VerificationSetup,
    Restore,
    VerificationFailed,
    UnsupportedProvider,
    UploadExhausted,
    Cancelled,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidTargetUri => "invalid_target_uri",
            Self::InvalidStoreAddress => "invalid_store_address",
            Self::Config => "config",
            Self::Acquire => "acquire",
            Self::VerificationSetup => "verification_setup",
            Self::Restore => "restore",
            Self::VerificationFailed => "verification_failed",
            Self::UnsupportedProvider => "unsupported_provider",
            Self::UploadExhausted => "upload_exhausted",
            Self::Cancelled => "cancelled",
            Self::Io => "io",
        }
    }

    /// Process exit status for a run that ended with this kind of error.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Io => 1,
            Self::InvalidTargetUri => 2,
            Self::InvalidStoreAddress => 3,
            Self::Config => 4,
            Self::Acquire => 5,
            Self::VerificationSetup => 6,
            Self::Restore => 7,
            Self::VerificationFailed => 8,
            Self::UnsupportedProvider => 9,
            Self::UploadExhausted => 10,
            Self::Cancelled => 130,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Re-classify while keeping the message, prefixed with `context`.
    pub fn context(self, kind: ErrorKind, context: &str) -> Self {
        Self::new(kind, format!("{context}: {}", self.msg))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::new(ErrorKind::Config, err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
