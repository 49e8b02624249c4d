//! Entrypoint contract.
//!
//! The pipeline places the script and names it as the only startup command.
//! What the script does at container start is its own business.

use crate::core::config::BuildConfig;
use crate::core::error::StagehandError;
use crate::pipeline::assemble::RuntimeLayout;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// The container command: the entrypoint alone, no arguments.
pub fn startup_command(config: &BuildConfig) -> Vec<String> {
    vec![config.image_entrypoint()]
}

pub fn is_executable_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

pub fn verify(config: &BuildConfig, layout: &RuntimeLayout) -> Result<(), StagehandError> {
    if !is_executable_file(&layout.entrypoint) {
        return Err(StagehandError::AssemblyError(format!(
            "entrypoint {} is missing or not executable",
            config.image_entrypoint()
        )));
    }
    let expected = startup_command(config);
    if layout.manifest.cmd != expected {
        return Err(StagehandError::AssemblyError(format!(
            "startup command {:?} does not match entrypoint {:?}",
            layout.manifest.cmd, expected
        )));
    }
    Ok(())
}
