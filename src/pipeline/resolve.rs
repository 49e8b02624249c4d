//! Architecture resolver.
//!
//! Pure: maps a machine identifier to the installer locator without touching
//! the network or the filesystem.

use crate::core::arch::Architecture;
use crate::core::config::{BuildConfig, ToolchainConfig};
use crate::core::error::StagehandError;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallerLocator {
    pub arch: Architecture,
    pub triple: String,
    pub url: String,
    pub sha256: Option<String>,
}

pub fn installer_url(arch: Architecture, toolchain: &ToolchainConfig) -> String {
    format!(
        "{}/rustup/dist/{}/rustup-init",
        toolchain.dist_server.trim_end_matches('/'),
        arch.rust_triple()
    )
}

pub fn locate(arch: Architecture, toolchain: &ToolchainConfig) -> Result<InstallerLocator, StagehandError> {
    let server = toolchain.dist_server.trim();
    if !["https://", "http://", "file://"]
        .iter()
        .any(|scheme| server.starts_with(scheme))
    {
        return Err(StagehandError::ConfigError(format!(
            "toolchain.dist_server '{}' must be an https://, http:// or file:// URL",
            server
        )));
    }
    Ok(InstallerLocator {
        arch,
        triple: arch.rust_triple().to_string(),
        url: installer_url(arch, toolchain),
        sha256: toolchain
            .installer_sha256
            .get(arch.as_str())
            .map(|s| s.trim().to_ascii_lowercase()),
    })
}

/// Resolve a raw identifier straight to its locator.
pub fn resolve(identifier: &str, toolchain: &ToolchainConfig) -> Result<InstallerLocator, StagehandError> {
    let arch = Architecture::from_identifier(identifier)?;
    locate(arch, toolchain)
}

pub fn resolve_config(config: &BuildConfig) -> Result<InstallerLocator, StagehandError> {
    resolve(&config.target, &config.toolchain)
}
