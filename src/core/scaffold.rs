//! Project scaffolding for `stagehand init`.
//!
//! Writes a starter `stagehand.toml` and an `entrypoint.sh` that execs the
//! compiled binary. Templates are embedded in the binary. Existing files are
//! never replaced unless `force` is set.

use crate::core::config::{BuildConfig, CONFIG_FILE};
use crate::core::error::StagehandError;
use serde::Serialize;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const CONFIG_TEMPLATE: &str = include_str!("../../templates/stagehand.toml");
const ENTRYPOINT_TEMPLATE: &str = include_str!("../../templates/entrypoint.sh");

pub struct ScaffoldOptions {
    pub target_dir: PathBuf,
    pub force: bool,
    /// Report what would happen without writing.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaffoldAction {
    Wrote,
    WouldWrite,
    WouldSkip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScaffoldEntry {
    pub path: PathBuf,
    pub action: ScaffoldAction,
}

fn render(template: &str, config: &BuildConfig) -> String {
    template
        .replace("{{binary}}", &config.build.binary)
        .replace("{{binary_path}}", &config.image_binary())
        .replace("{{install_root}}", &config.runtime.install_root)
        .replace("{{home_alias}}", &config.runtime.home_alias)
}

fn write_file(
    opts: &ScaffoldOptions,
    rel_path: &Path,
    content: &str,
    mode: u32,
) -> Result<ScaffoldEntry, StagehandError> {
    let dest = opts.target_dir.join(rel_path);

    if dest.exists() && !opts.force {
        if opts.dry_run {
            return Ok(ScaffoldEntry {
                path: dest,
                action: ScaffoldAction::WouldSkip,
            });
        }
        return Err(StagehandError::ConfigError(format!(
            "Refusing to overwrite existing path without --force: {}",
            dest.display()
        )));
    }

    if opts.dry_run {
        return Ok(ScaffoldEntry {
            path: dest,
            action: ScaffoldAction::WouldWrite,
        });
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&dest, content)?;
    fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
    Ok(ScaffoldEntry {
        path: dest,
        action: ScaffoldAction::Wrote,
    })
}

pub fn scaffold_project(
    opts: &ScaffoldOptions,
    config: &BuildConfig,
) -> Result<Vec<ScaffoldEntry>, StagehandError> {
    // Check both before writing either, so a refusal leaves nothing half done.
    if !opts.force && !opts.dry_run {
        for rel in [Path::new(CONFIG_FILE), config.runtime.entrypoint_source.as_path()] {
            let dest = opts.target_dir.join(rel);
            if dest.exists() {
                return Err(StagehandError::ConfigError(format!(
                    "Refusing to overwrite existing path without --force: {}",
                    dest.display()
                )));
            }
        }
    }
    Ok(vec![
        write_file(
            opts,
            Path::new(CONFIG_FILE),
            &render(CONFIG_TEMPLATE, config),
            0o644,
        )?,
        write_file(
            opts,
            &config.runtime.entrypoint_source,
            &render(ENTRYPOINT_TEMPLATE, config),
            0o755,
        )?,
    ])
}
