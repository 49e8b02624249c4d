//! Runtime layout inspection.
//!
//! [`inspect_layout`] checks an assembled runtime root against the layout
//! contract. [`layout_digest`] fingerprints the tree so two clean runs can be
//! compared: entries are sorted by path, each becomes a leaf hash over
//! (path, kind, mode, content), and the leaves fold into a merkle root.
//! Timestamps and ownership are not part of the digest.

use crate::core::config::{BuildConfig, stage_path};
use crate::core::error::StagehandError;
use crate::core::fetch::sha256_file;
use crate::core::packages::{PackageManager, is_build_tooling};
use crate::pipeline::assemble::{ImageManifest, META_DIR};
use crate::pipeline::entrypoint::{is_executable_file, startup_command};
use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const EMPTY_ROOT: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutReport {
    pub root: PathBuf,
    pub checks: Vec<LayoutCheck>,
    pub digest: String,
}

impl LayoutReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> Vec<&LayoutCheck> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }
}

fn check(name: &'static str, passed: bool, detail: impl Into<String>) -> LayoutCheck {
    LayoutCheck {
        name,
        passed,
        detail: detail.into(),
    }
}

pub fn inspect_layout(
    config: &BuildConfig,
    packages: &dyn PackageManager,
) -> Result<LayoutReport, StagehandError> {
    let root = &config.runtime_root;
    if !root.is_dir() {
        return Err(StagehandError::NotFound(format!(
            "runtime root {} does not exist",
            root.display()
        )));
    }
    let mut checks = Vec::new();

    let binary = stage_path(root, &config.image_binary());
    checks.push(check(
        "binary",
        is_executable_file(&binary),
        config.image_binary(),
    ));

    let executables = executables_in(&stage_path(root, &config.image_bin_dir()))?;
    checks.push(check(
        "single_executable",
        executables == [config.build.binary.clone()],
        format!("{}: {}", config.image_bin_dir(), executables.join(", ")),
    ));

    checks.push(check(
        "entrypoint",
        is_executable_file(&stage_path(root, &config.image_entrypoint())),
        config.image_entrypoint(),
    ));

    let manifest = ImageManifest::load(root).ok();
    let data_dir = stage_path(root, &config.image_data_dir());
    let declared = manifest
        .as_ref()
        .map(|m| m.volumes.contains(&config.image_data_dir()))
        .unwrap_or(false);
    checks.push(check(
        "data_volume",
        data_dir.is_dir() && declared,
        config.image_data_dir(),
    ));

    let alias = stage_path(root, &config.runtime.home_alias);
    let alias_target = fs::read_link(&alias).ok();
    let resolves = alias_target
        .as_ref()
        .map(|t| resolve_in_root(root, &alias, t) == data_dir)
        .unwrap_or(false);
    checks.push(check(
        "home_alias",
        resolves,
        format!(
            "{} -> {}",
            config.runtime.home_alias,
            alias_target
                .map(|t| t.display().to_string())
                .unwrap_or_else(|| "(missing)".to_string())
        ),
    ));

    let leftovers: Vec<&String> = [&config.toolchain.rustup_home, &config.toolchain.cargo_home]
        .into_iter()
        .filter(|p| stage_path(root, p).exists())
        .collect();
    checks.push(check(
        "no_toolchain",
        leftovers.is_empty(),
        format!("{:?}", leftovers),
    ));

    let installed = packages.installed(root)?;
    let tooling: Vec<&String> = installed.iter().filter(|p| is_build_tooling(p)).collect();
    let missing: Vec<&String> = config
        .runtime
        .packages
        .iter()
        .filter(|p| !installed.contains(*p))
        .collect();
    checks.push(check(
        "packages",
        tooling.is_empty() && missing.is_empty(),
        format!("build tooling: {:?}; missing: {:?}", tooling, missing),
    ));

    let expected_cmd = startup_command(config);
    checks.push(check(
        "startup_command",
        manifest.as_ref().map(|m| m.cmd == expected_cmd).unwrap_or(false),
        expected_cmd.join(" "),
    ));

    Ok(LayoutReport {
        root: root.clone(),
        checks,
        digest: layout_digest(root)?,
    })
}

fn executables_in(dir: &Path) -> Result<Vec<String>, StagehandError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if is_executable_file(&entry.path()) {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Resolve a link the way it would resolve inside the image.
fn resolve_in_root(root: &Path, link: &Path, target: &Path) -> PathBuf {
    match target.to_str() {
        Some(t) if target.is_absolute() => stage_path(root, t),
        _ => link.parent().unwrap_or(root).join(target),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutEntry {
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub content_hash: String,
}

pub fn collect_entries(root: &Path) -> Result<Vec<LayoutEntry>, StagehandError> {
    let mut pending = Vec::new();
    walk(root, root, &mut pending)?;
    pending.sort_by(|a, b| a.0.cmp(&b.0));

    pending
        .into_par_iter()
        .map(|(path, abs, kind, mode)| -> Result<LayoutEntry, StagehandError> {
            let content_hash = match kind {
                EntryKind::File => sha256_file(&abs)?,
                EntryKind::Symlink => {
                    let target = fs::read_link(&abs)?;
                    let mut hasher = Sha256::new();
                    hasher.update(target.to_string_lossy().as_bytes());
                    format!("{:x}", hasher.finalize())
                }
                EntryKind::Dir => String::new(),
            };
            Ok(LayoutEntry {
                path,
                kind,
                mode,
                content_hash,
            })
        })
        .collect()
}

type PendingEntry = (String, PathBuf, EntryKind, u32);

fn walk(root: &Path, dir: &Path, out: &mut Vec<PendingEntry>) -> Result<(), StagehandError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let abs = entry.path();
        let rel = abs
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        if rel == META_DIR {
            continue;
        }
        let meta = fs::symlink_metadata(&abs)?;
        let mode = meta.permissions().mode() & 0o7777;
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            out.push((rel, abs, EntryKind::Symlink, 0));
        } else if file_type.is_dir() {
            out.push((rel, abs.clone(), EntryKind::Dir, mode));
            walk(root, &abs, out)?;
        } else {
            out.push((rel, abs, EntryKind::File, mode));
        }
    }
    Ok(())
}

fn leaf_hash(entry: &LayoutEntry) -> String {
    let kind = match entry.kind {
        EntryKind::File => "file",
        EntryKind::Dir => "dir",
        EntryKind::Symlink => "symlink",
    };
    let mode = format!("{:o}", entry.mode);
    let mut hasher = Sha256::new();
    for part in [entry.path.as_str(), kind, mode.as_str(), entry.content_hash.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

pub fn merkle_root(entries: &[LayoutEntry]) -> String {
    let mut level: Vec<String> = entries.iter().map(leaf_hash).collect();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().cloned() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut hasher = Sha256::new();
                hasher.update(pair[0].as_bytes());
                hasher.update(pair[1].as_bytes());
                format!("{:x}", hasher.finalize())
            })
            .collect();
    }
    level.pop().unwrap_or_else(|| EMPTY_ROOT.to_string())
}

pub fn layout_digest(root: &Path) -> Result<String, StagehandError> {
    Ok(merkle_root(&collect_entries(root)?))
}
