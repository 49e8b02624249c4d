//! stagehand: a two-stage container build pipeline.
//!
//! A builder stage gets a pinned Rust toolchain and compiles the project in
//! release mode. A runtime stage starts from a clean base, installs the
//! minimum package set, and receives exactly two artifacts from the builder:
//! the binary and its entrypoint script. A persisted data volume and a home
//! alias pointing at it complete the image.
//!
//! # Surfaces
//!
//! - `stagehand run`: the pipeline executed locally, with host directories
//!   standing in for the two stage filesystems.
//! - `stagehand render`: the same pipeline expressed as a Dockerfile.
//! - `stagehand image build`: the rendered Dockerfile built by docker or podman.
//!
//! # Outputs
//!
//! Commands print a JSON envelope on stdout and progress on stderr. Every
//! pipeline transition is appended to `<state_dir>/build.events.jsonl`.

pub mod core;
pub mod pipeline;
pub mod plugins;

mod cli;

use crate::cli::{Cli, Command, GlobalArgs, ImageCommand};
use crate::core::config::{
    BuildConfig, ConfigFile, Overrides, PackageBackend, apply_dist_server, process_env,
    select_target,
};
use crate::core::error::StagehandError;
use crate::core::exec::{CommandRunner, SystemRunner};
use crate::core::fetch::CurlFetcher;
use crate::core::journal::{Journal, command_envelope};
use crate::core::output::Reporter;
use crate::core::packages::{AptPackages, LedgerPackages, PackageManager};
use crate::core::scaffold::{ScaffoldOptions, scaffold_project};
use crate::pipeline::inspect::{inspect_layout, layout_digest};
use crate::pipeline::{BuildState, Collaborators, Pipeline, RunOutcome, resolve};
use crate::plugins::container;
use clap::Parser;
use serde_json::json;
use std::path::{Path, PathBuf};

fn print_json(value: &serde_json::Value) -> Result<(), StagehandError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn source_dir(global: &GlobalArgs) -> PathBuf {
    global.source.clone().unwrap_or_else(|| PathBuf::from("."))
}

fn load_file(global: &GlobalArgs) -> Result<ConfigFile, StagehandError> {
    match &global.config {
        Some(path) => ConfigFile::load(path),
        None => ConfigFile::discover(&source_dir(global)),
    }
}

fn load_config(global: &GlobalArgs, overrides: Overrides) -> Result<BuildConfig, StagehandError> {
    let overrides = Overrides {
        arch: global.arch.clone(),
        source_dir: global.source.clone(),
        ..overrides
    };
    BuildConfig::resolve(load_file(global)?, overrides)
}

/// apt-get can only act on the system it runs on, so a stage rooted
/// anywhere other than `/` is kept in the ledger.
fn package_manager<'a>(
    backend: PackageBackend,
    root: &Path,
    runner: &'a dyn CommandRunner,
    reporter: Reporter,
) -> Box<dyn PackageManager + 'a> {
    match backend {
        PackageBackend::Apt if root == Path::new("/") => Box::new(AptPackages::new(runner)),
        PackageBackend::Apt => {
            reporter.warn(
                "packages",
                &format!("{} is not the system root; using the ledger", root.display()),
            );
            Box::new(LedgerPackages)
        }
        PackageBackend::Ledger => Box::new(LedgerPackages),
    }
}

fn run_resolve(global: &GlobalArgs) -> Result<(), StagehandError> {
    let file = load_file(global)?;
    let env = process_env();
    let identifier = select_target(global.arch.clone(), &env, file.arch);
    let mut toolchain = file.toolchain;
    apply_dist_server(&mut toolchain, None, &env);
    let locator = resolve::resolve(&identifier, &toolchain)?;
    print_json(&command_envelope(
        "resolve",
        "ok",
        json!({ "identifier": identifier, "locator": locator }),
    ))
}

fn run_pipeline(global: &GlobalArgs, args: cli::RunCli) -> Result<(), StagehandError> {
    let config = load_config(
        global,
        Overrides {
            builder_root: args.builder_root,
            runtime_root: args.runtime_root,
            state_dir: args.state_dir,
            binary: args.binary,
            dist_server: args.dist_server,
            ..Overrides::default()
        },
    )?;
    let reporter = Reporter::new(global.quiet);
    let journal = Journal::open(&config.state_dir)?;

    let runner = SystemRunner;
    let fetcher = CurlFetcher::new(&runner);
    let builder_packages =
        package_manager(config.package_backend, &config.builder_root, &runner, reporter);
    let runtime_packages =
        package_manager(config.package_backend, &config.runtime_root, &runner, reporter);
    let deps = Collaborators {
        fetcher: &fetcher,
        runner: &runner,
        builder_packages: builder_packages.as_ref(),
        runtime_packages: runtime_packages.as_ref(),
    };

    reporter.step(
        "run",
        &format!("{} for {}", config.build.binary, config.target),
    );
    let RunOutcome {
        build_id,
        trail,
        state,
    } = Pipeline::new(&config, deps, journal, reporter).run();

    match state {
        BuildState::Ready(layout) => {
            let digest = layout_digest(&layout.root)?;
            print_json(&command_envelope(
                "run",
                "ok",
                json!({
                    "build_id": build_id,
                    "trail": trail,
                    "runtime_root": layout.root,
                    "layout_digest": digest,
                    "manifest": layout.manifest,
                }),
            ))
        }
        BuildState::Failed { step, error } => {
            print_json(&command_envelope(
                "run",
                "error",
                json!({
                    "build_id": build_id,
                    "trail": trail,
                    "failed_step": step.as_str(),
                    "kind": error.kind().as_str(),
                    "error": error.to_string(),
                }),
            ))?;
            Err(error)
        }
        other => Err(StagehandError::AssemblyError(format!(
            "pipeline stopped in non-terminal state {}",
            other.name()
        ))),
    }
}

fn run_inspect(
    global: &GlobalArgs,
    runtime_root: Option<PathBuf>,
    binary: Option<String>,
) -> Result<(), StagehandError> {
    let config = load_config(
        global,
        Overrides {
            runtime_root,
            binary,
            ..Overrides::default()
        },
    )?;
    let runner = SystemRunner;
    let packages = package_manager(
        config.package_backend,
        &config.runtime_root,
        &runner,
        Reporter::new(global.quiet),
    );
    let report = inspect_layout(&config, packages.as_ref())?;
    let status = if report.passed() { "ok" } else { "error" };
    print_json(&command_envelope("inspect", status, json!({ "report": report })))?;
    if report.passed() {
        return Ok(());
    }
    let failed: Vec<&str> = report.failures().iter().map(|c| c.name).collect();
    Err(StagehandError::AssemblyError(format!(
        "runtime layout failed checks: {}",
        failed.join(", ")
    )))
}

pub fn run() -> Result<(), StagehandError> {
    let cli = Cli::parse();
    let global = &cli.global;

    match cli.command {
        Command::Version => {
            println!("v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Schema => print_json(&container::schema()),
        Command::Resolve => run_resolve(global),
        Command::Render { write, binary } => {
            let config = load_config(
                global,
                Overrides {
                    binary,
                    ..Overrides::default()
                },
            )?;
            if write {
                let path = container::write_dockerfile(&config)?;
                Reporter::new(global.quiet).ok("render", &path.display().to_string());
            }
            print!("{}", container::render_dockerfile(&config));
            Ok(())
        }
        Command::Run(args) => run_pipeline(global, args),
        Command::Inspect {
            runtime_root,
            binary,
        } => run_inspect(global, runtime_root, binary),
        Command::Image(image) => match image.command {
            ImageCommand::Build {
                tag,
                runtime,
                timeout_seconds,
                binary,
            } => {
                let config = load_config(
                    global,
                    Overrides {
                        binary,
                        ..Overrides::default()
                    },
                )?;
                let reporter = Reporter::new(global.quiet);
                reporter.step("image", &format!("building {}", config.build.binary));
                let summary = container::build_image(
                    &config,
                    &container::ImageBuildRequest {
                        tag,
                        runtime,
                        timeout_seconds,
                    },
                    &SystemRunner,
                )?;
                reporter.ok("image", summary["image"].as_str().unwrap_or_default());
                print_json(&command_envelope("image.build", "ok", summary))
            }
        },
        Command::Init {
            force,
            dry_run,
            binary,
        } => {
            let config = load_config(
                global,
                Overrides {
                    binary,
                    ..Overrides::default()
                },
            )?;
            let entries = scaffold_project(
                &ScaffoldOptions {
                    target_dir: config.source_dir.clone(),
                    force,
                    dry_run,
                },
                &config,
            )?;
            print_json(&command_envelope(
                "init",
                "ok",
                json!({ "dry_run": dry_run, "files": entries }),
            ))
        }
    }
}
