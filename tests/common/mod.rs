#![allow(dead_code)]

use stagehand::core::config::{BuildConfig, ConfigFile, FetchPolicy, Overrides};
use stagehand::core::error::StagehandError;
use stagehand::core::exec::{CommandOutput, CommandRunner, CommandSpec};
use stagehand::core::fetch::Fetcher;
use stagehand::core::journal::Journal;
use stagehand::core::output::Reporter;
use stagehand::core::packages::LedgerPackages;
use stagehand::pipeline::{Collaborators, Pipeline, RunOutcome};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub const BINARY: &str = "node";
pub const INSTALLER_BYTES: &[u8] = b"#!/bin/sh\n# rustup-init stand-in\n";

/// Records every URL and writes a fixed installer, optionally failing the
/// first `failures` attempts.
#[derive(Default)]
pub struct FakeFetcher {
    pub calls: RefCell<Vec<String>>,
    pub failures: Cell<u32>,
}

impl FakeFetcher {
    pub fn failing(failures: u32) -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            failures: Cell::new(failures),
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch_once(
        &self,
        url: &str,
        dest: &Path,
        _policy: &FetchPolicy,
    ) -> Result<(), StagehandError> {
        self.calls.borrow_mut().push(url.to_string());
        if self.failures.get() > 0 {
            self.failures.set(self.failures.get() - 1);
            // Leave a truncated download behind, as a real client might.
            fs::write(dest, b"#!/bin/")?;
            return Err(StagehandError::FetchError {
                url: url.to_string(),
                reason: "connection reset by peer".to_string(),
            });
        }
        fs::write(dest, INSTALLER_BYTES)?;
        Ok(())
    }
}

/// Plays the part of rustup-init and cargo against the builder stage root.
#[derive(Default)]
pub struct ScriptedRunner {
    pub calls: RefCell<Vec<CommandSpec>>,
    pub installer_fails: bool,
    pub compile_fails: bool,
}

impl ScriptedRunner {
    pub fn programs(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.program_name()).collect()
    }

    fn install_toolchain(&self, spec: &CommandSpec) -> Result<CommandOutput, StagehandError> {
        if self.installer_fails {
            return Ok(CommandOutput::failed(
                1,
                "info: downloading installer\nerror: could not download component 'rustc'",
            ));
        }
        let cargo_home = PathBuf::from(&spec.env["CARGO_HOME"]);
        let rustup_home = PathBuf::from(&spec.env["RUSTUP_HOME"]);
        fs::create_dir_all(cargo_home.join("bin"))?;
        fs::create_dir_all(rustup_home.join("toolchains/stable-x86_64-unknown-linux-gnu"))?;
        for tool in ["rustup", "cargo", "rustc"] {
            let path = cargo_home.join("bin").join(tool);
            fs::write(&path, format!("#!/bin/sh\necho {}\n", tool))?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }
        Ok(CommandOutput::ok("stable installed - rustc 1.90.0\n"))
    }

    fn cargo_build(&self, spec: &CommandSpec) -> Result<CommandOutput, StagehandError> {
        if self.compile_fails {
            return Ok(CommandOutput::failed(
                101,
                "   Compiling node v0.1.0\nerror[E0425]: cannot find value `peers` in this scope\nerror: could not compile `node` (bin \"node\") due to 1 previous error",
            ));
        }
        let release = PathBuf::from(&spec.env["CARGO_TARGET_DIR"]).join("release");
        fs::create_dir_all(&release)?;
        let artifact = release.join(BINARY);
        fs::write(&artifact, b"\x7fELF node release build")?;
        fs::set_permissions(&artifact, fs::Permissions::from_mode(0o755))?;
        Ok(CommandOutput::ok(""))
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, StagehandError> {
        self.calls.borrow_mut().push(spec.clone());
        let name = spec.program_name();
        let first = spec.args.first().map(String::as_str);
        match (name.as_str(), first) {
            ("rustup-init", _) => self.install_toolchain(spec),
            ("rustup" | "cargo" | "rustc", Some("--version")) => {
                Ok(CommandOutput::ok(&format!("{} 1.90.0 (stagehand test)\n", name)))
            }
            ("cargo", Some("build")) => self.cargo_build(spec),
            _ => Ok(CommandOutput::failed(127, "command not found")),
        }
    }
}

/// A minimal crate with an entrypoint script.
pub fn project(dir: &Path) -> PathBuf {
    let src = dir.join("project");
    fs::create_dir_all(src.join("src")).unwrap();
    fs::write(
        src.join("Cargo.toml"),
        format!("[package]\nname = \"{}\"\nversion = \"0.1.0\"\nedition = \"2021\"\n", BINARY),
    )
    .unwrap();
    fs::write(src.join("src/main.rs"), "fn main() {}\n").unwrap();
    fs::write(
        src.join("entrypoint.sh"),
        format!("#!/bin/sh\nexec /app/bin/{} \"$@\"\n", BINARY),
    )
    .unwrap();
    fs::set_permissions(src.join("entrypoint.sh"), fs::Permissions::from_mode(0o755)).unwrap();
    src
}

pub fn config_for(source: &Path, arch: &str) -> BuildConfig {
    let mut config = BuildConfig::resolve_with_env(
        ConfigFile::default(),
        Overrides {
            arch: Some(arch.to_string()),
            source_dir: Some(source.to_path_buf()),
            ..Overrides::default()
        },
        &BTreeMap::new(),
    )
    .unwrap();
    config.fetch.backoff_ms = 1;
    config
}

pub fn run_pipeline(
    config: &BuildConfig,
    fetcher: &FakeFetcher,
    runner: &ScriptedRunner,
) -> RunOutcome {
    let packages = LedgerPackages;
    let deps = Collaborators {
        fetcher,
        runner,
        builder_packages: &packages,
        runtime_packages: &packages,
    };
    let journal = Journal::open(&config.state_dir).unwrap();
    Pipeline::new(config, deps, journal, Reporter::new(true)).run()
}
