//! OS package management, treated as an opaque capability.
//!
//! The pipeline only ever asks a stage to upgrade, install a named set,
//! purge what was pulled in automatically, clear caches, and report what is
//! installed. How that happens is the backend's business.

use crate::core::error::StagehandError;
use crate::core::exec::{CommandRunner, CommandSpec};
use crate::core::output::compact_line;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// Package names that must never reach a runtime image.
pub const BUILD_TOOLING: &[&str] = &[
    "build-essential",
    "cargo",
    "clang",
    "g++",
    "gcc",
    "libssl-dev",
    "llvm",
    "make",
    "pkg-config",
    "rustc",
];

const TOOLING_PREFIXES: &[&str] = &["gcc-", "g++-", "clang-", "llvm-", "rustc-"];

pub fn is_build_tooling(package: &str) -> bool {
    BUILD_TOOLING.contains(&package) || TOOLING_PREFIXES.iter().any(|p| package.starts_with(p))
}

pub trait PackageManager {
    fn name(&self) -> &'static str;
    fn upgrade(&self, root: &Path) -> Result<(), StagehandError>;
    /// Install exactly `packages`, without recommended extras.
    fn install(&self, root: &Path, packages: &[String]) -> Result<(), StagehandError>;
    fn purge_unrequested(&self, root: &Path) -> Result<(), StagehandError>;
    fn clean(&self, root: &Path) -> Result<(), StagehandError>;
    /// Packages explicitly requested, as opposed to pulled in as dependencies.
    fn manual(&self, root: &Path) -> Result<BTreeSet<String>, StagehandError>;
    fn installed(&self, root: &Path) -> Result<BTreeSet<String>, StagehandError>;
}

/// Records package sets inside the stage root.
///
/// Used by the local executor: the host is never modified, and the
/// resulting ledger is what the runtime audit inspects.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerPackages;

impl LedgerPackages {
    pub const LEDGER: &'static str = "var/lib/stagehand/packages";
    pub const CACHE: &'static str = "var/cache/stagehand";

    fn read(root: &Path) -> Result<BTreeSet<String>, StagehandError> {
        let path = root.join(Self::LEDGER);
        if !path.exists() {
            return Ok(BTreeSet::new());
        }
        Ok(fs::read_to_string(path)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn write(root: &Path, set: &BTreeSet<String>) -> Result<(), StagehandError> {
        let path = root.join(Self::LEDGER);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut body = set.iter().cloned().collect::<Vec<_>>().join("\n");
        body.push('\n');
        fs::write(path, body)?;
        Ok(())
    }
}

impl PackageManager for LedgerPackages {
    fn name(&self) -> &'static str {
        "ledger"
    }

    fn upgrade(&self, root: &Path) -> Result<(), StagehandError> {
        fs::create_dir_all(root.join(Self::CACHE))?;
        Ok(())
    }

    fn install(&self, root: &Path, packages: &[String]) -> Result<(), StagehandError> {
        let mut set = Self::read(root)?;
        for p in packages {
            let p = p.trim();
            if p.is_empty() {
                continue;
            }
            set.insert(p.to_string());
            fs::create_dir_all(root.join(Self::CACHE))?;
            fs::write(root.join(Self::CACHE).join(format!("{}.deb", p)), b"")?;
        }
        Self::write(root, &set)
    }

    fn purge_unrequested(&self, _root: &Path) -> Result<(), StagehandError> {
        // The ledger never pulls dependencies.
        Ok(())
    }

    fn clean(&self, root: &Path) -> Result<(), StagehandError> {
        let cache = root.join(Self::CACHE);
        if cache.exists() {
            fs::remove_dir_all(cache)?;
        }
        Ok(())
    }

    fn manual(&self, root: &Path) -> Result<BTreeSet<String>, StagehandError> {
        Self::read(root)
    }

    fn installed(&self, root: &Path) -> Result<BTreeSet<String>, StagehandError> {
        Self::read(root)
    }
}

/// Drives `apt-get` on the running system. The stage root must be `/`,
/// which is the case when stagehand itself runs inside the stage.
pub struct AptPackages<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> AptPackages<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    fn ensure_system_root(root: &Path) -> Result<(), StagehandError> {
        if root != Path::new("/") {
            return Err(StagehandError::ConfigError(format!(
                "apt backend requires the stage root to be /, got {}",
                root.display()
            )));
        }
        Ok(())
    }

    fn apt(&self, program: &str, args: &[&str]) -> Result<String, StagehandError> {
        let spec = CommandSpec::new(program)
            .args(args.iter().copied())
            .env("DEBIAN_FRONTEND", "noninteractive");
        let out = self.runner.run(&spec)?;
        if !out.success() {
            return Err(StagehandError::RuntimeError(format!(
                "{} failed (exit {:?}): {}",
                spec.display(),
                out.code,
                compact_line(&out.stderr, 300)
            )));
        }
        Ok(out.stdout)
    }
}

fn parse_names(raw: &str) -> BTreeSet<String> {
    raw.lines()
        .map(|l| l.trim().split(':').next().unwrap_or("").to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

impl PackageManager for AptPackages<'_> {
    fn name(&self) -> &'static str {
        "apt"
    }

    fn upgrade(&self, root: &Path) -> Result<(), StagehandError> {
        Self::ensure_system_root(root)?;
        self.apt("apt-get", &["update"])?;
        self.apt(
            "apt-get",
            &["dist-upgrade", "-y", "-o", "DPkg::Options::=--force-confold"],
        )?;
        Ok(())
    }

    fn install(&self, root: &Path, packages: &[String]) -> Result<(), StagehandError> {
        Self::ensure_system_root(root)?;
        if packages.is_empty() {
            return Ok(());
        }
        let mut args = vec!["install", "-y", "--no-install-recommends"];
        args.extend(packages.iter().map(String::as_str));
        self.apt("apt-get", &args)?;
        Ok(())
    }

    fn purge_unrequested(&self, root: &Path) -> Result<(), StagehandError> {
        Self::ensure_system_root(root)?;
        self.apt("apt-get", &["autoremove", "--purge", "-y"])?;
        Ok(())
    }

    fn clean(&self, root: &Path) -> Result<(), StagehandError> {
        Self::ensure_system_root(root)?;
        self.apt("apt-get", &["clean"])?;
        let lists = Path::new("/var/lib/apt/lists");
        if lists.exists() {
            for entry in fs::read_dir(lists)? {
                let path = entry?.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    fn manual(&self, root: &Path) -> Result<BTreeSet<String>, StagehandError> {
        Self::ensure_system_root(root)?;
        Ok(parse_names(&self.apt("apt-mark", &["showmanual"])?))
    }

    fn installed(&self, root: &Path) -> Result<BTreeSet<String>, StagehandError> {
        Self::ensure_system_root(root)?;
        Ok(parse_names(
            &self.apt("dpkg-query", &["-W", "-f=${Package}\n"])?,
        ))
    }
}

/// Outcome of comparing a runtime stage's packages with what it may hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageAudit {
    /// Explicitly installed but neither base nor required.
    pub unexpected: Vec<String>,
    /// Required but not installed.
    pub missing: Vec<String>,
    pub build_tooling: Vec<String>,
}

impl PackageAudit {
    pub fn is_clean(&self) -> bool {
        self.unexpected.is_empty() && self.missing.is_empty() && self.build_tooling.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.unexpected.is_empty() {
            parts.push(format!("unexpected: {}", self.unexpected.join(", ")));
        }
        if !self.missing.is_empty() {
            parts.push(format!("missing: {}", self.missing.join(", ")));
        }
        if !self.build_tooling.is_empty() {
            parts.push(format!("build tooling: {}", self.build_tooling.join(", ")));
        }
        parts.join("; ")
    }
}

pub fn audit(
    baseline: &BTreeSet<String>,
    manual: &BTreeSet<String>,
    installed: &BTreeSet<String>,
    required: &[String],
) -> PackageAudit {
    let required: BTreeSet<String> = required.iter().map(|s| s.trim().to_string()).collect();
    PackageAudit {
        unexpected: manual
            .iter()
            .filter(|p| !baseline.contains(*p) && !required.contains(*p))
            .cloned()
            .collect(),
        missing: required
            .iter()
            .filter(|p| !installed.contains(*p))
            .cloned()
            .collect(),
        build_tooling: installed
            .iter()
            .filter(|p| is_build_tooling(p))
            .cloned()
            .collect(),
    }
}
