use std::io;
use thiserror::Error;

/// Failure class of a pipeline error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Provisioning,
    Compilation,
    Assembly,
    External,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Provisioning => "provisioning",
            ErrorKind::Compilation => "compilation",
            ErrorKind::Assembly => "assembly",
            ErrorKind::External => "external",
            ErrorKind::Io => "io",
        }
    }
}

#[derive(Error, Debug)]
pub enum StagehandError {
    #[error("Unsupported architecture: '{0}' (supported: amd64, arm64)")]
    UnsupportedArchitecture(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Failed to fetch {url}: {reason}")]
    FetchError { url: String, reason: String },
    #[error("Installer checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("Toolchain installer error: {0}")]
    InstallerError(String),
    #[error("Compilation failed: {0}")]
    CompilationError(String),
    #[error("Assembly error: {0}")]
    AssemblyError(String),
    #[error("Container runtime error: {0}")]
    RuntimeError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl StagehandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StagehandError::UnsupportedArchitecture(_)
            | StagehandError::ConfigError(_)
            | StagehandError::TomlError(_) => ErrorKind::Configuration,
            StagehandError::FetchError { .. }
            | StagehandError::ChecksumMismatch { .. }
            | StagehandError::InstallerError(_) => ErrorKind::Provisioning,
            StagehandError::CompilationError(_) => ErrorKind::Compilation,
            StagehandError::AssemblyError(_) => ErrorKind::Assembly,
            StagehandError::RuntimeError(_) | StagehandError::NotFound(_) => ErrorKind::External,
            StagehandError::IoError(_) | StagehandError::JsonError(_) => ErrorKind::Io,
        }
    }

    /// Only network fetches are worth retrying; everything else is deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StagehandError::FetchError { .. })
    }
}
