//! The two-stage build pipeline.
//!
//! ```text
//! Start -> ToolchainResolved -> ToolchainInstalled -> SourceCompiled
//!       -> RuntimeAssembled -> Ready
//! ```
//!
//! Each arrow is one step function taking the previous state's payload and
//! returning the next payload or a typed error. Any error moves the run to
//! the terminal [`BuildState::Failed`]. Nothing is retried or rolled back
//! here: recovery is a fresh run.

pub mod assemble;
pub mod compile;
pub mod entrypoint;
pub mod inspect;
pub mod provision;
pub mod resolve;

use crate::core::config::BuildConfig;
use crate::core::error::StagehandError;
use crate::core::exec::CommandRunner;
use crate::core::fetch::Fetcher;
use crate::core::journal::Journal;
use crate::core::output::Reporter;
use crate::core::packages::PackageManager;
use assemble::RuntimeLayout;
use compile::CompiledBinary;
use provision::Toolchain;
use resolve::InstallerLocator;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Resolve,
    Provision,
    Compile,
    Assemble,
    Entrypoint,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Resolve => "resolve",
            Step::Provision => "provision",
            Step::Compile => "compile",
            Step::Assemble => "assemble",
            Step::Entrypoint => "entrypoint",
        }
    }
}

#[derive(Debug)]
pub enum BuildState {
    Start,
    ToolchainResolved(InstallerLocator),
    ToolchainInstalled(Toolchain),
    SourceCompiled(CompiledBinary),
    RuntimeAssembled(RuntimeLayout),
    Ready(RuntimeLayout),
    Failed { step: Step, error: StagehandError },
}

impl BuildState {
    pub fn name(&self) -> &'static str {
        match self {
            BuildState::Start => "start",
            BuildState::ToolchainResolved(_) => "toolchain_resolved",
            BuildState::ToolchainInstalled(_) => "toolchain_installed",
            BuildState::SourceCompiled(_) => "source_compiled",
            BuildState::RuntimeAssembled(_) => "runtime_assembled",
            BuildState::Ready(_) => "ready",
            BuildState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildState::Ready(_) | BuildState::Failed { .. })
    }
}

/// Everything the pipeline talks to outside its own process.
pub struct Collaborators<'a> {
    pub fetcher: &'a dyn Fetcher,
    pub runner: &'a dyn CommandRunner,
    pub builder_packages: &'a dyn PackageManager,
    pub runtime_packages: &'a dyn PackageManager,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub build_id: String,
    /// State names in the order they were entered, `start` first.
    pub trail: Vec<&'static str>,
    pub state: BuildState,
}

impl RunOutcome {
    pub fn into_result(self) -> Result<RuntimeLayout, StagehandError> {
        match self.state {
            BuildState::Ready(layout) => Ok(layout),
            BuildState::Failed { error, .. } => Err(error),
            other => Err(StagehandError::AssemblyError(format!(
                "pipeline stopped in non-terminal state {}",
                other.name()
            ))),
        }
    }
}

pub struct Pipeline<'a> {
    config: &'a BuildConfig,
    deps: Collaborators<'a>,
    journal: Journal,
    reporter: Reporter,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a BuildConfig,
        deps: Collaborators<'a>,
        journal: Journal,
        reporter: Reporter,
    ) -> Self {
        Self {
            config,
            deps,
            journal,
            reporter,
        }
    }

    pub fn build_id(&self) -> &str {
        self.journal.build_id()
    }

    /// Perform the single transition out of `state`. Terminal states are
    /// returned unchanged.
    pub fn advance(&self, state: BuildState) -> BuildState {
        let cfg = self.config;
        let deps = &self.deps;
        match state {
            BuildState::Start => self.step(Step::Resolve, || {
                resolve::resolve_config(cfg).map(BuildState::ToolchainResolved)
            }),
            BuildState::ToolchainResolved(locator) => self.step(Step::Provision, || {
                provision::provision(
                    cfg,
                    &locator,
                    deps.fetcher,
                    deps.runner,
                    deps.builder_packages,
                )
                .map(BuildState::ToolchainInstalled)
            }),
            BuildState::ToolchainInstalled(toolchain) => self.step(Step::Compile, || {
                compile::compile(cfg, &toolchain, deps.runner).map(BuildState::SourceCompiled)
            }),
            BuildState::SourceCompiled(binary) => self.step(Step::Assemble, || {
                assemble::assemble(cfg, &binary, deps.runtime_packages)
                    .map(BuildState::RuntimeAssembled)
            }),
            BuildState::RuntimeAssembled(layout) => self.step(Step::Entrypoint, || {
                entrypoint::verify(cfg, &layout).map(|_| BuildState::Ready(layout.clone()))
            }),
            terminal => terminal,
        }
    }

    pub fn run(&self) -> RunOutcome {
        let mut state = BuildState::Start;
        let mut trail = vec![state.name()];
        self.record(state.name(), "ok", json!({ "target": self.config.target }));
        while !state.is_terminal() {
            state = self.advance(state);
            trail.push(state.name());
        }
        RunOutcome {
            build_id: self.journal.build_id().to_string(),
            trail,
            state,
        }
    }

    fn step<F>(&self, step: Step, f: F) -> BuildState
    where
        F: FnOnce() -> Result<BuildState, StagehandError>,
    {
        self.reporter.step(step.as_str(), "");
        match f() {
            Ok(next) => {
                self.reporter.ok(step.as_str(), next.name());
                self.record(next.name(), "ok", detail_for(&next));
                next
            }
            Err(error) => {
                self.reporter.failed(step.as_str(), &error.to_string());
                self.record(
                    "failed",
                    "error",
                    json!({
                        "step": step.as_str(),
                        "kind": error.kind().as_str(),
                        "retryable": error.is_retryable(),
                        "error": error.to_string(),
                    }),
                );
                BuildState::Failed { step, error }
            }
        }
    }

    fn record(&self, phase: &str, status: &str, detail: serde_json::Value) {
        if let Err(e) = self.journal.record(phase, status, detail) {
            self.reporter
                .warn("journal", &format!("could not append event: {}", e));
        }
    }
}

fn detail_for(state: &BuildState) -> serde_json::Value {
    match state {
        BuildState::ToolchainResolved(loc) => json!({
            "arch": loc.arch,
            "triple": loc.triple,
            "url": loc.url,
            "pinned": loc.sha256.is_some(),
        }),
        BuildState::ToolchainInstalled(tc) => json!({
            "channel": tc.channel,
            "versions": tc.versions,
            "fetch_attempts": tc.fetch_attempts,
        }),
        BuildState::SourceCompiled(bin) => json!({
            "binary": bin.name,
            "sha256": bin.sha256,
            "size": bin.size,
        }),
        BuildState::RuntimeAssembled(layout) | BuildState::Ready(layout) => json!({
            "root": layout.root,
            "cmd": layout.manifest.cmd,
            "volumes": layout.manifest.volumes,
        }),
        _ => json!({}),
    }
}
