//! Target architecture table.
//!
//! The set of supported machines is closed: adding one means adding a
//! variant here, and every `match` over [`Architecture`] stops compiling
//! until it is handled.

use crate::core::error::StagehandError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    pub const ALL: [Architecture; 2] = [Architecture::Amd64, Architecture::Arm64];

    /// Canonical container-platform name (`TARGETARCH` in a Dockerfile).
    pub fn as_str(self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
        }
    }

    /// Host triple of the toolchain distribution built for this machine.
    pub fn rust_triple(self) -> &'static str {
        match self {
            Architecture::Amd64 => "x86_64-unknown-linux-gnu",
            Architecture::Arm64 => "aarch64-unknown-linux-gnu",
        }
    }

    pub fn platform(self) -> String {
        format!("linux/{}", self.as_str())
    }

    /// Resolve a machine identifier as reported by `uname -m` or a container
    /// runtime's `TARGETARCH`.
    pub fn from_identifier(identifier: &str) -> Result<Self, StagehandError> {
        match identifier.trim().to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" | "x86-64" => Ok(Architecture::Amd64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            _ => Err(StagehandError::UnsupportedArchitecture(
                identifier.trim().to_string(),
            )),
        }
    }

    pub fn host() -> Result<Self, StagehandError> {
        Self::from_identifier(std::env::consts::ARCH)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = StagehandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_identifier(s)
    }
}
