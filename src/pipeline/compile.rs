//! Compiler step: copy the source tree into the builder stage and produce one
//! release binary with the provisioned toolchain.

use crate::core::arch::Architecture;
use crate::core::config::{BuildConfig, STATE_DIR, stage_path};
use crate::core::error::StagehandError;
use crate::core::exec::{CommandRunner, CommandSpec};
use crate::core::fetch::sha256_file;
use crate::core::output::tail_lines;
use crate::pipeline::provision::Toolchain;
use serde::Serialize;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Top-level entries of the source tree never copied into the builder stage.
const SKIPPED: &[&str] = &["target", ".git", STATE_DIR];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledBinary {
    pub arch: Architecture,
    pub name: String,
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

pub fn compile(
    config: &BuildConfig,
    toolchain: &Toolchain,
    runner: &dyn CommandRunner,
) -> Result<CompiledBinary, StagehandError> {
    let workdir = stage_source(config)?;
    let artifact = stage_path(&config.builder_root, &config.image_release_binary());
    if artifact.exists() {
        fs::remove_file(&artifact)?;
    }

    // Host RUSTC, RUSTFLAGS and CARGO_BUILD_* must not steer this build.
    let mut spec = CommandSpec::new(toolchain.tool("cargo"))
        .args(["build", "--release"])
        .cwd(&workdir)
        .envs(&toolchain.env())
        .env("CARGO_TARGET_DIR", workdir.join("target").display().to_string())
        .isolated_env();
    if config.build.locked {
        spec = spec.arg("--locked");
    }
    if !config.build.features.is_empty() {
        spec = spec.arg("--features").arg(config.build.features.join(","));
    }

    let out = runner
        .run(&spec)
        .map_err(|e| StagehandError::CompilationError(e.to_string()))?;
    if !out.success() {
        return Err(StagehandError::CompilationError(format!(
            "cargo build exited with {:?}\n{}",
            out.code,
            tail_lines(&out.stderr, 30)
        )));
    }

    let meta = fs::metadata(&artifact).map_err(|_| {
        StagehandError::CompilationError(format!(
            "cargo build succeeded but produced no binary at {}",
            artifact.display()
        ))
    })?;
    if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
        return Err(StagehandError::CompilationError(format!(
            "{} is not an executable file",
            artifact.display()
        )));
    }

    Ok(CompiledBinary {
        arch: toolchain.arch,
        name: config.build.binary.clone(),
        sha256: sha256_file(&artifact)?,
        size: meta.len(),
        path: artifact,
    })
}

/// Replace the builder-stage working directory with a fresh copy of the source.
pub fn stage_source(config: &BuildConfig) -> Result<PathBuf, StagehandError> {
    if !config.source_dir.is_dir() {
        return Err(StagehandError::CompilationError(format!(
            "source tree {} does not exist",
            config.source_dir.display()
        )));
    }
    let workdir = stage_path(&config.builder_root, &config.build.workdir);
    if workdir.exists() {
        fs::remove_dir_all(&workdir)?;
    }
    fs::create_dir_all(&workdir)?;
    // Stage roots may live under a state_dir inside the source tree; copying
    // them would recurse into the workdir itself.
    let excluded = [
        config.state_dir.clone(),
        config.builder_root.clone(),
        config.runtime_root.clone(),
    ];
    for entry in fs::read_dir(&config.source_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if SKIPPED.iter().any(|s| name == *s) {
            continue;
        }
        copy_tree(&entry.path(), &workdir.join(&name), &excluded)?;
    }
    Ok(workdir)
}

fn copy_tree(src: &Path, dst: &Path, excluded: &[PathBuf]) -> Result<(), StagehandError> {
    if excluded.iter().any(|e| e == src) {
        return Ok(());
    }
    let meta = fs::symlink_metadata(src)?;
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        std::os::unix::fs::symlink(fs::read_link(src)?, dst)?;
    } else if file_type.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()), excluded)?;
        }
    } else {
        fs::copy(src, dst)?;
    }
    Ok(())
}
