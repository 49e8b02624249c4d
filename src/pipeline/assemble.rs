//! Runtime image assembler.
//!
//! Works on a pristine runtime root and copies in only what the builder
//! stage handed over: the binary and the entrypoint script. Order inside
//! [`assemble`] is part of the contract: the data directory exists and is
//! writable before the home alias is linked to it, and the alias exists
//! before anything that could read it is placed in the image.

use crate::core::arch::Architecture;
use crate::core::config::{BuildConfig, stage_path};
use crate::core::error::StagehandError;
use crate::core::fetch::sha256_file;
use crate::core::packages::{self, PackageManager};
use crate::pipeline::compile::CompiledBinary;
use crate::pipeline::entrypoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Directory inside a stage root holding stagehand's own bookkeeping.
pub const META_DIR: &str = ".stagehand";
pub const STAGE_MARKER: &str = ".stagehand/stage";
pub const MANIFEST: &str = ".stagehand/image.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub arch: Architecture,
    pub volumes: Vec<String>,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub binary: String,
    pub binary_sha256: String,
    pub home_alias: String,
    pub packages: Vec<String>,
}

impl ImageManifest {
    pub fn load(root: &Path) -> Result<Self, StagehandError> {
        let raw = fs::read_to_string(root.join(MANIFEST))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeLayout {
    pub root: PathBuf,
    pub binary: PathBuf,
    pub entrypoint: PathBuf,
    pub data_dir: PathBuf,
    pub home_alias: PathBuf,
    pub manifest: ImageManifest,
}

pub fn assemble(
    config: &BuildConfig,
    binary: &CompiledBinary,
    packages: &dyn PackageManager,
) -> Result<RuntimeLayout, StagehandError> {
    let root = &config.runtime_root;
    prepare_root(root)?;

    install_runtime_packages(config, packages)?;

    for image_dir in [&config.toolchain.rustup_home, &config.toolchain.cargo_home] {
        if stage_path(root, image_dir).exists() {
            return Err(StagehandError::AssemblyError(format!(
                "toolchain directory {} is present in the runtime image",
                image_dir
            )));
        }
    }

    let bin_dir = stage_path(root, &config.image_bin_dir());
    let data_dir = stage_path(root, &config.image_data_dir());
    fs::create_dir_all(&bin_dir)?;
    fs::create_dir_all(&data_dir)?;
    check_writable(&data_dir)?;

    let home_alias = stage_path(root, &config.runtime.home_alias);
    link_home_alias(&config.image_data_dir(), &home_alias)?;

    let binary_dest = stage_path(root, &config.image_binary());
    copy_artifact(&binary.path, &binary_dest, "compiled binary")?;
    let copied = sha256_file(&binary_dest)?;
    if copied != binary.sha256 {
        return Err(StagehandError::AssemblyError(format!(
            "binary digest changed during copy: expected {}, got {}",
            binary.sha256, copied
        )));
    }

    let entry_src = stage_path(&config.builder_root, &config.image_entrypoint_source());
    let entry_dest = stage_path(root, &config.image_entrypoint());
    copy_artifact(&entry_src, &entry_dest, "entrypoint script")?;

    let manifest = ImageManifest {
        arch: binary.arch,
        volumes: vec![config.image_data_dir()],
        cmd: entrypoint::startup_command(config),
        env: BTreeMap::from([(
            "DEBIAN_FRONTEND".to_string(),
            "noninteractive".to_string(),
        )]),
        binary: config.image_binary(),
        binary_sha256: binary.sha256.clone(),
        home_alias: config.runtime.home_alias.clone(),
        packages: config.runtime.packages.clone(),
    };
    fs::write(
        root.join(MANIFEST),
        format!("{}\n", serde_json::to_string_pretty(&manifest)?),
    )?;

    Ok(RuntimeLayout {
        root: root.clone(),
        binary: binary_dest,
        entrypoint: entry_dest,
        data_dir,
        home_alias,
        manifest,
    })
}

/// Accept a missing or empty root, or one a previous run produced (which is
/// cleared). Anything else is somebody's data and is left alone.
pub fn prepare_root(root: &Path) -> Result<(), StagehandError> {
    if root.parent().is_none() {
        return Err(StagehandError::AssemblyError(format!(
            "runtime root {} is a filesystem root",
            root.display()
        )));
    }
    if root.exists() {
        let empty = fs::read_dir(root)?.next().is_none();
        if !empty {
            if !root.join(STAGE_MARKER).is_file() {
                return Err(StagehandError::AssemblyError(format!(
                    "runtime root {} is not empty and was not produced by stagehand",
                    root.display()
                )));
            }
            fs::remove_dir_all(root)?;
        }
    }
    fs::create_dir_all(root.join(META_DIR))?;
    fs::write(root.join(STAGE_MARKER), "runtime\n")?;
    Ok(())
}

fn install_runtime_packages(
    config: &BuildConfig,
    pm: &dyn PackageManager,
) -> Result<(), StagehandError> {
    let root = &config.runtime_root;
    let as_assembly = |e: StagehandError| match e {
        StagehandError::RuntimeError(msg) => {
            StagehandError::AssemblyError(format!("runtime packages: {}", msg))
        }
        other => other,
    };

    let baseline = pm.manual(root).map_err(as_assembly)?;
    pm.upgrade(root).map_err(as_assembly)?;
    pm.install(root, &config.runtime.packages).map_err(as_assembly)?;
    pm.purge_unrequested(root).map_err(as_assembly)?;
    pm.clean(root).map_err(as_assembly)?;

    let report = packages::audit(
        &baseline,
        &pm.manual(root).map_err(as_assembly)?,
        &pm.installed(root).map_err(as_assembly)?,
        &config.runtime.packages,
    );
    if !report.is_clean() {
        return Err(StagehandError::AssemblyError(format!(
            "runtime package audit failed ({})",
            report.summary()
        )));
    }
    Ok(())
}

fn check_writable(dir: &Path) -> Result<(), StagehandError> {
    let scratch = dir.join(".stagehand-write-check");
    fs::write(&scratch, b"")
        .and_then(|_| fs::remove_file(&scratch))
        .map_err(|e| {
            StagehandError::AssemblyError(format!(
                "data directory {} is not writable: {}",
                dir.display(),
                e
            ))
        })
}

fn link_home_alias(image_target: &str, alias: &Path) -> Result<(), StagehandError> {
    if let Some(parent) = alias.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::symlink_metadata(alias).is_ok() {
        return Err(StagehandError::AssemblyError(format!(
            "home alias {} already exists",
            alias.display()
        )));
    }
    std::os::unix::fs::symlink(image_target, alias)?;
    Ok(())
}

fn copy_artifact(src: &Path, dest: &Path, what: &str) -> Result<(), StagehandError> {
    if !src.is_file() {
        return Err(StagehandError::AssemblyError(format!(
            "{} missing at copy time: {}",
            what,
            src.display()
        )));
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dest)?;
    fs::set_permissions(dest, fs::Permissions::from_mode(0o755))?;
    Ok(())
}
