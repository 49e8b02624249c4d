//! Build configuration.
//!
//! A [`BuildConfig`] is resolved once per invocation and then handed by
//! reference to every pipeline step. Steps never read the process
//! environment themselves; the toolchain environment they need is derived
//! from this struct.
//!
//! Precedence, lowest first: built-in defaults, `stagehand.toml`,
//! `STAGEHAND_*` environment variables, command-line overrides.

use crate::core::arch::Architecture;
use crate::core::error::StagehandError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

pub const CONFIG_FILE: &str = "stagehand.toml";
pub const STATE_DIR: &str = ".stagehand";
pub const DEFAULT_SYSTEM_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolchainConfig {
    pub rustup_home: String,
    pub cargo_home: String,
    pub channel: String,
    pub profile: String,
    pub dist_server: String,
    /// Expected sha256 of `rustup-init`, keyed by architecture name.
    pub installer_sha256: BTreeMap<String, String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            rustup_home: "/usr/local/rustup".to_string(),
            cargo_home: "/usr/local/cargo".to_string(),
            channel: "stable".to_string(),
            profile: "minimal".to_string(),
            dist_server: "https://static.rust-lang.org".to_string(),
            installer_sha256: BTreeMap::new(),
        }
    }
}

impl ToolchainConfig {
    pub fn bin_dir(&self) -> String {
        format!("{}/bin", self.cargo_home.trim_end_matches('/'))
    }
}

/// Network policy for the installer download.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FetchPolicy {
    pub attempts: u32,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub backoff_ms: u64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout_secs: 300,
            connect_timeout_secs: 30,
            backoff_ms: 2_000,
        }
    }
}

impl FetchPolicy {
    const MAX_BACKOFF_MS: u64 = 60_000;

    /// Delay before retry number `retry` (1-based), doubling each time.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor).min(Self::MAX_BACKOFF_MS))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuildSection {
    pub image: String,
    pub workdir: String,
    pub binary: Option<String>,
    pub locked: bool,
    pub features: Vec<String>,
    pub packages: Vec<String>,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            image: "ubuntu:22.04".to_string(),
            workdir: "/usr/src/app".to_string(),
            binary: None,
            locked: false,
            features: Vec::new(),
            packages: [
                "build-essential",
                "ca-certificates",
                "clang",
                "curl",
                "libssl-dev",
                "pkg-config",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeSection {
    pub image: String,
    pub install_root: String,
    pub data_dir: String,
    pub entrypoint: String,
    /// Entrypoint script, relative to the source tree.
    pub entrypoint_source: PathBuf,
    /// Defaults to `/root/.<binary>`.
    pub home_alias: Option<String>,
    pub packages: Vec<String>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            image: "ubuntu:22.04".to_string(),
            install_root: "/app".to_string(),
            data_dir: "data".to_string(),
            entrypoint: "entrypoint.sh".to_string(),
            entrypoint_source: PathBuf::from("entrypoint.sh"),
            home_alias: None,
            packages: vec!["ca-certificates".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PackageBackend {
    /// Record package sets inside the stage root; never touches the host.
    #[default]
    Ledger,
    /// Drive `apt-get` directly; only valid when the stage root is `/`.
    Apt,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PackagesSection {
    pub backend: PackageBackend,
}

/// On-disk shape of `stagehand.toml`. Every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub arch: Option<String>,
    pub builder_root: Option<PathBuf>,
    pub runtime_root: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub toolchain: ToolchainConfig,
    pub fetch: FetchPolicy,
    pub build: BuildSection,
    pub runtime: RuntimeSection,
    pub packages: PackagesSection,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, StagehandError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            StagehandError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Load `<source>/stagehand.toml` when present, defaults otherwise.
    pub fn discover(source_dir: &Path) -> Result<Self, StagehandError> {
        let path = source_dir.join(CONFIG_FILE);
        if path.is_file() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Command-line values that win over the file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub arch: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub builder_root: Option<PathBuf>,
    pub runtime_root: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub binary: Option<String>,
    pub dist_server: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileSettings {
    pub image: String,
    pub workdir: String,
    pub binary: String,
    pub locked: bool,
    pub features: Vec<String>,
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub image: String,
    pub install_root: String,
    pub data_dir: String,
    pub entrypoint: String,
    pub entrypoint_source: PathBuf,
    pub home_alias: String,
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    /// Machine identifier as given; see [`BuildConfig::arch`].
    pub target: String,
    /// `PATH` of the invoking environment, appended after the toolchain.
    pub system_path: String,
    pub source_dir: PathBuf,
    pub builder_root: PathBuf,
    pub runtime_root: PathBuf,
    pub state_dir: PathBuf,
    pub toolchain: ToolchainConfig,
    pub fetch: FetchPolicy,
    pub build: CompileSettings,
    pub runtime: RuntimeSettings,
    pub package_backend: PackageBackend,
}

/// The slice of the process environment configuration reads.
pub fn process_env() -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("STAGEHAND_") || k == "PATH")
        .collect()
}

/// Target identifier by precedence: CLI, `STAGEHAND_ARCH`, file, host.
/// Kept verbatim; the resolver step is what rejects unknown machines.
pub fn select_target(
    cli: Option<String>,
    env: &BTreeMap<String, String>,
    file: Option<String>,
) -> String {
    cli.or_else(|| env.get("STAGEHAND_ARCH").cloned())
        .or(file)
        .unwrap_or_else(|| std::env::consts::ARCH.to_string())
}

/// Apply the CLI or `STAGEHAND_DIST_SERVER` mirror, CLI first.
pub fn apply_dist_server(
    toolchain: &mut ToolchainConfig,
    cli: Option<String>,
    env: &BTreeMap<String, String>,
) {
    if let Some(server) = cli.or_else(|| env.get("STAGEHAND_DIST_SERVER").cloned()) {
        toolchain.dist_server = server;
    }
}

impl BuildConfig {
    /// Resolve from the process environment.
    pub fn resolve(file: ConfigFile, overrides: Overrides) -> Result<Self, StagehandError> {
        Self::resolve_with_env(file, overrides, &process_env())
    }

    pub fn resolve_with_env(
        file: ConfigFile,
        overrides: Overrides,
        env: &BTreeMap<String, String>,
    ) -> Result<Self, StagehandError> {
        let cwd = std::env::current_dir()?;
        let source_dir = absolutize(
            &cwd,
            &overrides.source_dir.clone().unwrap_or_else(|| PathBuf::from(".")),
        );

        let target = select_target(overrides.arch, env, file.arch);
        let system_path = env
            .get("PATH")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PATH.to_string());

        let state_dir = absolutize(
            &source_dir,
            &overrides
                .state_dir
                .or(file.state_dir)
                .unwrap_or_else(|| PathBuf::from(STATE_DIR)),
        );
        let builder_root = absolutize(
            &source_dir,
            &overrides
                .builder_root
                .or(file.builder_root)
                .unwrap_or_else(|| state_dir.join("stages").join("builder")),
        );
        let runtime_root = absolutize(
            &source_dir,
            &overrides
                .runtime_root
                .or(file.runtime_root)
                .unwrap_or_else(|| state_dir.join("stages").join("runtime")),
        );

        let mut toolchain = file.toolchain;
        apply_dist_server(&mut toolchain, overrides.dist_server, env);

        let binary = match overrides.binary.or(file.build.binary) {
            Some(name) => name,
            None => package_name(&source_dir)?,
        };
        let home_alias = file
            .runtime
            .home_alias
            .unwrap_or_else(|| format!("/root/.{}", binary));

        let config = BuildConfig {
            target,
            system_path,
            builder_root,
            runtime_root,
            state_dir,
            toolchain,
            fetch: file.fetch,
            build: CompileSettings {
                image: file.build.image,
                workdir: file.build.workdir,
                binary,
                locked: file.build.locked,
                features: file.build.features,
                packages: file.build.packages,
            },
            runtime: RuntimeSettings {
                image: file.runtime.image,
                install_root: file.runtime.install_root.trim_end_matches('/').to_string(),
                data_dir: file.runtime.data_dir,
                entrypoint: file.runtime.entrypoint,
                entrypoint_source: file.runtime.entrypoint_source,
                home_alias,
                packages: file.runtime.packages,
            },
            package_backend: file.packages.backend,
            source_dir,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StagehandError> {
        for (what, name) in [
            ("build.binary", self.build.binary.as_str()),
            ("runtime.entrypoint", self.runtime.entrypoint.as_str()),
            ("runtime.data_dir", self.runtime.data_dir.as_str()),
        ] {
            if !NAME_PATTERN.is_match(name) {
                return Err(StagehandError::ConfigError(format!(
                    "{} '{}' must be a single file name",
                    what, name
                )));
            }
        }
        let rt = &self.runtime;
        if rt.data_dir == "bin" || rt.entrypoint == "bin" || rt.entrypoint == rt.data_dir {
            return Err(StagehandError::ConfigError(format!(
                "runtime.entrypoint '{}', runtime.data_dir '{}' and the bin directory must be distinct entries of {}",
                rt.entrypoint, rt.data_dir, rt.install_root
            )));
        }
        for (what, path) in [
            ("toolchain.rustup_home", self.toolchain.rustup_home.as_str()),
            ("toolchain.cargo_home", self.toolchain.cargo_home.as_str()),
            ("build.workdir", self.build.workdir.as_str()),
            ("runtime.install_root", self.runtime.install_root.as_str()),
            ("runtime.home_alias", self.runtime.home_alias.as_str()),
        ] {
            if !path.starts_with('/') || path.len() < 2 {
                return Err(StagehandError::ConfigError(format!(
                    "{} '{}' must be an absolute path below /",
                    what, path
                )));
            }
        }
        let entry = &self.runtime.entrypoint_source;
        if entry.as_os_str().is_empty()
            || entry
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StagehandError::ConfigError(format!(
                "runtime.entrypoint_source '{}' must be a relative path inside the source tree",
                entry.display()
            )));
        }
        if self.fetch.attempts == 0 {
            return Err(StagehandError::ConfigError(
                "fetch.attempts must be at least 1".to_string(),
            ));
        }
        if self.toolchain.channel.trim().is_empty() {
            return Err(StagehandError::ConfigError(
                "toolchain.channel must not be empty".to_string(),
            ));
        }
        // A builder root of `/` is the running system: stagehand executing
        // inside the builder container. It is exempt from the nesting rules.
        let system = Path::new("/");
        if self.runtime_root == system {
            return Err(StagehandError::ConfigError(
                "runtime_root cannot be /: the runtime stage is always assembled into a fresh directory"
                    .to_string(),
            ));
        }
        if self.builder_root == self.runtime_root
            || (self.builder_root != system && nests(&self.builder_root, &self.runtime_root))
        {
            return Err(StagehandError::ConfigError(format!(
                "stage roots must be disjoint: {} and {}",
                self.builder_root.display(),
                self.runtime_root.display()
            )));
        }
        let state = &self.state_dir;
        for root in [&self.builder_root, &self.runtime_root] {
            if root.as_path() == system {
                continue;
            }
            if root.starts_with(&self.source_dir) && !root.starts_with(state) {
                return Err(StagehandError::ConfigError(format!(
                    "stage root {} lies inside the source tree; place it under {}",
                    root.display(),
                    state.display()
                )));
            }
            if self.source_dir.starts_with(root) {
                return Err(StagehandError::ConfigError(format!(
                    "source tree {} lies inside stage root {}",
                    self.source_dir.display(),
                    root.display()
                )));
            }
        }
        Ok(())
    }

    /// `state_dir` relative to the source tree, when it lives inside it.
    /// Staging and the image build context both leave it out.
    pub fn state_dir_in_source(&self) -> Option<PathBuf> {
        self.state_dir
            .strip_prefix(&self.source_dir)
            .ok()
            .filter(|rel| !rel.as_os_str().is_empty())
            .map(Path::to_path_buf)
    }

    pub fn image_bin_dir(&self) -> String {
        format!("{}/bin", self.runtime.install_root)
    }

    pub fn image_binary(&self) -> String {
        format!("{}/{}", self.image_bin_dir(), self.build.binary)
    }

    pub fn image_entrypoint(&self) -> String {
        format!("{}/{}", self.runtime.install_root, self.runtime.entrypoint)
    }

    pub fn image_data_dir(&self) -> String {
        format!("{}/{}", self.runtime.install_root, self.runtime.data_dir)
    }

    /// Release artifact path inside the builder stage.
    pub fn image_release_binary(&self) -> String {
        format!(
            "{}/target/release/{}",
            self.build.workdir.trim_end_matches('/'),
            self.build.binary
        )
    }

    pub fn arch(&self) -> Result<Architecture, StagehandError> {
        Architecture::from_identifier(&self.target)
    }

    /// Entrypoint script as copied into the builder stage.
    pub fn image_entrypoint_source(&self) -> String {
        format!(
            "{}/{}",
            self.build.workdir.trim_end_matches('/'),
            self.runtime.entrypoint_source.display()
        )
    }
}

/// Map an image-absolute path onto a stage root on the host.
pub fn stage_path(root: &Path, image_path: &str) -> PathBuf {
    root.join(image_path.trim_start_matches('/'))
}

fn package_name(source_dir: &Path) -> Result<String, StagehandError> {
    let manifest = source_dir.join("Cargo.toml");
    let raw = fs::read_to_string(&manifest).map_err(|_| {
        StagehandError::ConfigError(format!(
            "build.binary is not set and {} is unreadable",
            manifest.display()
        ))
    })?;
    let table: toml::Table = toml::from_str(&raw)?;
    table
        .get("package")
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            StagehandError::ConfigError(format!(
                "build.binary is not set and {} has no [package] name",
                manifest.display()
            ))
        })
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn nests(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}
