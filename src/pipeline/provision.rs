//! Toolchain provisioner.
//!
//! Installs builder packages, downloads `rustup-init` for the resolved
//! architecture, runs it unattended into the builder stage, and discards the
//! installer whether or not the install succeeded.

use crate::core::arch::Architecture;
use crate::core::config::{BuildConfig, stage_path};
use crate::core::error::StagehandError;
use crate::core::exec::{CommandRunner, CommandSpec};
use crate::core::fetch::{Fetcher, fetch_with_retry, sha256_file};
use crate::core::output::tail_lines;
use crate::core::packages::PackageManager;
use crate::pipeline::resolve::InstallerLocator;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub const INSTALLER_PATH: &str = "/tmp/rustup-init";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toolchain {
    pub arch: Architecture,
    pub rustup_home: PathBuf,
    pub cargo_home: PathBuf,
    pub bin_dir: PathBuf,
    pub channel: String,
    /// First line of `<tool> --version` for rustup, cargo and rustc.
    pub versions: BTreeMap<String, String>,
    pub fetch_attempts: u32,
    #[serde(skip)]
    system_path: String,
}

impl Toolchain {
    pub fn tool(&self, name: &str) -> PathBuf {
        self.bin_dir.join(name)
    }

    /// Environment for any process that must use this toolchain and no other.
    pub fn env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "RUSTUP_HOME".to_string(),
                self.rustup_home.display().to_string(),
            ),
            (
                "CARGO_HOME".to_string(),
                self.cargo_home.display().to_string(),
            ),
            (
                "PATH".to_string(),
                format!("{}:{}", self.bin_dir.display(), self.system_path),
            ),
            ("RUSTUP_TOOLCHAIN".to_string(), self.channel.clone()),
        ])
    }
}

pub fn provision(
    config: &BuildConfig,
    locator: &InstallerLocator,
    fetcher: &dyn Fetcher,
    runner: &dyn CommandRunner,
    packages: &dyn PackageManager,
) -> Result<Toolchain, StagehandError> {
    let root = &config.builder_root;
    fs::create_dir_all(root)?;

    packages
        .upgrade(root)
        .and_then(|_| packages.install(root, &config.build.packages))
        .map_err(|e| match e {
            StagehandError::RuntimeError(msg) => {
                StagehandError::InstallerError(format!("builder packages: {}", msg))
            }
            other => other,
        })?;

    let installer = stage_path(root, INSTALLER_PATH);
    if let Some(parent) = installer.parent() {
        fs::create_dir_all(parent)?;
    }
    let report = fetch_with_retry(fetcher, &locator.url, &installer, &config.fetch)?;

    let rustup_home = stage_path(root, &config.toolchain.rustup_home);
    let cargo_home = stage_path(root, &config.toolchain.cargo_home);
    let installed = verify_and_run_installer(config, locator, &installer, &rustup_home, &cargo_home, runner);
    discard(&installer)?;
    installed?;

    make_world_writable(&rustup_home)?;
    make_world_writable(&cargo_home)?;

    let mut toolchain = Toolchain {
        arch: locator.arch,
        bin_dir: cargo_home.join("bin"),
        rustup_home,
        cargo_home,
        channel: config.toolchain.channel.clone(),
        versions: BTreeMap::new(),
        fetch_attempts: report.attempts,
        system_path: config.system_path.clone(),
    };
    for tool in ["rustup", "cargo", "rustc"] {
        let out = runner.run(
            &CommandSpec::new(toolchain.tool(tool))
                .arg("--version")
                .envs(&toolchain.env())
                .isolated_env(),
        )?;
        if !out.success() {
            return Err(StagehandError::InstallerError(format!(
                "{} --version failed after install: {}",
                tool,
                tail_lines(&out.stderr, 5)
            )));
        }
        let version = out.stdout.lines().next().unwrap_or("").trim().to_string();
        toolchain.versions.insert(tool.to_string(), version);
    }
    Ok(toolchain)
}

fn verify_and_run_installer(
    config: &BuildConfig,
    locator: &InstallerLocator,
    installer: &Path,
    rustup_home: &Path,
    cargo_home: &Path,
    runner: &dyn CommandRunner,
) -> Result<(), StagehandError> {
    if let Some(expected) = &locator.sha256 {
        let actual = sha256_file(installer)?;
        if &actual != expected {
            return Err(StagehandError::ChecksumMismatch {
                expected: expected.clone(),
                actual,
            });
        }
    }

    fs::set_permissions(installer, fs::Permissions::from_mode(0o755))?;
    let mode = fs::metadata(installer)?.permissions().mode();
    if mode & 0o111 == 0 {
        return Err(StagehandError::InstallerError(format!(
            "{} is not executable (mode {:o})",
            installer.display(),
            mode
        )));
    }

    let spec = CommandSpec::new(installer)
        .args([
            "-y",
            "--no-modify-path",
            "--profile",
            config.toolchain.profile.as_str(),
            "--default-toolchain",
            config.toolchain.channel.as_str(),
        ])
        .env("RUSTUP_HOME", rustup_home.display().to_string())
        .env("CARGO_HOME", cargo_home.display().to_string())
        .env("PATH", config.system_path.clone())
        .isolated_env();
    let out = runner
        .run(&spec)
        .map_err(|e| StagehandError::InstallerError(e.to_string()))?;
    if !out.success() {
        return Err(StagehandError::InstallerError(format!(
            "rustup-init exited with {:?}\n{}",
            out.code,
            tail_lines(&out.stderr, 20)
        )));
    }
    Ok(())
}

fn discard(installer: &Path) -> Result<(), StagehandError> {
    if installer.exists() {
        fs::remove_file(installer)?;
    }
    Ok(())
}

/// Grant write access to everyone, recursively, so later steps running as a
/// different user can still update the toolchain (registry cache, targets).
pub fn make_world_writable(path: &Path) -> Result<(), StagehandError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    let mode = meta.permissions().mode();
    fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o222))?;
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            make_world_writable(&entry?.path())?;
        }
    }
    Ok(())
}
