//! CLI struct definitions for the stagehand command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "stagehand",
    version = env!("CARGO_PKG_VERSION"),
    about = "Two-stage build pipeline: provision a Rust toolchain, compile a release binary, and assemble a minimal runtime image around it.",
    disable_version_flag = true
)]
pub(crate) struct Cli {
    #[clap(flatten)]
    pub global: GlobalArgs,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug)]
pub(crate) struct GlobalArgs {
    /// Configuration file (default: <source>/stagehand.toml when present).
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    /// Source tree to build (default: current directory).
    #[clap(long, global = true)]
    pub source: Option<PathBuf>,
    /// Target architecture identifier, e.g. amd64 or arm64.
    #[clap(long, global = true)]
    pub arch: Option<String>,
    /// Suppress progress lines on stderr. The journal is still written.
    #[clap(long, short = 'q', global = true)]
    pub quiet: bool,
}

#[derive(clap::Args, Debug)]
pub(crate) struct RunCli {
    /// Host directory standing in for the builder stage filesystem.
    #[clap(long)]
    pub builder_root: Option<PathBuf>,
    /// Host directory receiving the runtime image layout.
    #[clap(long)]
    pub runtime_root: Option<PathBuf>,
    /// Directory for the journal and generated files.
    #[clap(long)]
    pub state_dir: Option<PathBuf>,
    /// Binary name (default: [package] name from Cargo.toml).
    #[clap(long)]
    pub binary: Option<String>,
    /// Toolchain distribution server.
    #[clap(long)]
    pub dist_server: Option<String>,
}

#[derive(clap::Args, Debug)]
pub(crate) struct ImageCli {
    #[clap(subcommand)]
    pub command: ImageCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ImageCommand {
    /// Render the Dockerfile and build it with docker or podman
    Build {
        /// Image tag (default: <binary>:latest)
        #[clap(long)]
        tag: Option<String>,
        /// Container runtime to use instead of auto-detection
        #[clap(long)]
        runtime: Option<String>,
        /// Build timeout in seconds
        #[clap(long, default_value_t = 3600)]
        timeout_seconds: u64,
        /// Binary name (default: [package] name from Cargo.toml)
        #[clap(long)]
        binary: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Map an architecture identifier to its toolchain installer
    Resolve,
    /// Print the two-stage Dockerfile for this project
    Render {
        /// Also write it to <state_dir>/generated/Dockerfile
        #[clap(long)]
        write: bool,
        /// Binary name (default: [package] name from Cargo.toml)
        #[clap(long)]
        binary: Option<String>,
    },
    /// Run the pipeline locally against stage directories
    Run(RunCli),
    /// Check an assembled runtime root against the layout contract
    Inspect {
        #[clap(long)]
        runtime_root: Option<PathBuf>,
        #[clap(long)]
        binary: Option<String>,
    },
    /// Container image operations
    Image(ImageCli),
    /// Write a starter stagehand.toml and entrypoint.sh
    Init {
        /// Overwrite existing files
        #[clap(long)]
        force: bool,
        /// Show what would be written
        #[clap(long)]
        dry_run: bool,
        #[clap(long)]
        binary: Option<String>,
    },
    /// Print the machine-readable command schema
    Schema,
    /// Print the version
    Version,
}
