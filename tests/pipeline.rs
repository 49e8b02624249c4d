mod common;

use common::{BINARY, FakeFetcher, ScriptedRunner, config_for, project, run_pipeline};
use stagehand::core::config::stage_path;
use stagehand::core::error::StagehandError;
use stagehand::core::journal::{JOURNAL_FILE, Journal};
use stagehand::core::packages::LedgerPackages;
use stagehand::pipeline::assemble::ImageManifest;
use stagehand::pipeline::inspect::{inspect_layout, layout_digest};
use stagehand::pipeline::provision::INSTALLER_PATH;
use stagehand::pipeline::{BuildState, Step};
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tempfile::tempdir;

const FULL_TRAIL: [&str; 6] = [
    "start",
    "toolchain_resolved",
    "toolchain_installed",
    "source_compiled",
    "runtime_assembled",
    "ready",
];

fn ledger(root: &std::path::Path) -> BTreeSet<String> {
    fs::read_to_string(root.join(LedgerPackages::LEDGER))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn unsupported_architecture_fails_before_any_side_effect() {
    let dir = tempdir().unwrap();
    let config = config_for(&project(dir.path()), "riscv64");
    let fetcher = FakeFetcher::default();
    let runner = ScriptedRunner::default();

    let outcome = run_pipeline(&config, &fetcher, &runner);

    assert_eq!(outcome.trail, vec!["start", "failed"]);
    match &outcome.state {
        BuildState::Failed { step, error } => {
            assert_eq!(*step, Step::Resolve);
            assert!(matches!(error, StagehandError::UnsupportedArchitecture(v) if v == "riscv64"));
            assert!(error.to_string().contains("riscv64"));
        }
        other => panic!("expected failure, got {}", other.name()),
    }
    assert!(fetcher.urls().is_empty());
    assert!(runner.programs().is_empty());
    assert!(!config.builder_root.exists());
    assert!(!config.runtime_root.exists());
}

#[test]
fn amd64_build_produces_the_contract_layout() {
    let dir = tempdir().unwrap();
    let config = config_for(&project(dir.path()), "amd64");
    let fetcher = FakeFetcher::default();
    let runner = ScriptedRunner::default();

    let outcome = run_pipeline(&config, &fetcher, &runner);
    assert_eq!(outcome.trail, FULL_TRAIL.to_vec());
    let layout = outcome.into_result().unwrap();

    assert_eq!(
        fetcher.urls(),
        vec!["https://static.rust-lang.org/rustup/dist/x86_64-unknown-linux-gnu/rustup-init"]
    );

    let root = &config.runtime_root;
    let binary = root.join("app/bin").join(BINARY);
    assert!(binary.is_file());
    assert_ne!(fs::metadata(&binary).unwrap().permissions().mode() & 0o111, 0);
    assert_eq!(
        fs::read_dir(root.join("app/bin")).unwrap().count(),
        1,
        "bin/ holds exactly one executable"
    );
    let entrypoint = root.join("app/entrypoint.sh");
    assert_ne!(fs::metadata(&entrypoint).unwrap().permissions().mode() & 0o111, 0);
    assert!(root.join("app/data").is_dir());
    assert_eq!(
        fs::read_link(root.join("root/.node")).unwrap(),
        PathBuf::from("/app/data")
    );

    // Nothing from the toolchain crosses into the runtime stage.
    assert!(!root.join("usr/local/cargo").exists());
    assert!(!root.join("usr/local/rustup").exists());
    assert!(!root.join("usr/src/app").exists());

    let manifest = ImageManifest::load(root).unwrap();
    assert_eq!(manifest.cmd, vec!["/app/entrypoint.sh".to_string()]);
    assert_eq!(manifest.volumes, vec!["/app/data".to_string()]);
    assert_eq!(layout.manifest, manifest);

    let report = inspect_layout(&config, &LedgerPackages).unwrap();
    assert!(report.passed(), "failed checks: {:?}", report.failures());
}

#[test]
fn arm64_fetches_the_aarch64_installer() {
    let dir = tempdir().unwrap();
    let config = config_for(&project(dir.path()), "aarch64");
    let fetcher = FakeFetcher::default();
    let runner = ScriptedRunner::default();

    let outcome = run_pipeline(&config, &fetcher, &runner);
    assert_eq!(outcome.trail, FULL_TRAIL.to_vec());
    assert_eq!(
        fetcher.urls(),
        vec!["https://static.rust-lang.org/rustup/dist/aarch64-unknown-linux-gnu/rustup-init"]
    );
}

#[test]
fn installer_is_discarded_and_toolchain_left_writable() {
    let dir = tempdir().unwrap();
    let config = config_for(&project(dir.path()), "amd64");
    let outcome = run_pipeline(&config, &FakeFetcher::default(), &ScriptedRunner::default());
    assert!(outcome.into_result().is_ok());

    assert!(!stage_path(&config.builder_root, INSTALLER_PATH).exists());
    let cargo = stage_path(&config.builder_root, "/usr/local/cargo/bin/cargo");
    assert_eq!(fs::metadata(&cargo).unwrap().permissions().mode() & 0o222, 0o222);
    let rustup_home = stage_path(&config.builder_root, "/usr/local/rustup");
    assert_eq!(
        fs::metadata(&rustup_home).unwrap().permissions().mode() & 0o222,
        0o222
    );
}

#[test]
fn compile_failure_never_reaches_the_assembler() {
    let dir = tempdir().unwrap();
    let config = config_for(&project(dir.path()), "amd64");
    let runner = ScriptedRunner {
        compile_fails: true,
        ..ScriptedRunner::default()
    };

    let outcome = run_pipeline(&config, &FakeFetcher::default(), &runner);

    assert_eq!(
        outcome.trail,
        vec!["start", "toolchain_resolved", "toolchain_installed", "failed"]
    );
    match outcome.state {
        BuildState::Failed { step, error } => {
            assert_eq!(step, Step::Compile);
            assert!(matches!(error, StagehandError::CompilationError(_)));
            assert!(error.to_string().contains("could not compile `node`"));
        }
        other => panic!("expected failure, got {}", other.name()),
    }
    assert!(!config.runtime_root.exists());
}

#[test]
fn installer_failure_still_removes_the_installer() {
    let dir = tempdir().unwrap();
    let config = config_for(&project(dir.path()), "amd64");
    let runner = ScriptedRunner {
        installer_fails: true,
        ..ScriptedRunner::default()
    };

    let outcome = run_pipeline(&config, &FakeFetcher::default(), &runner);

    match outcome.state {
        BuildState::Failed { step, error } => {
            assert_eq!(step, Step::Provision);
            assert!(error.to_string().contains("could not download component"));
        }
        other => panic!("expected failure, got {}", other.name()),
    }
    assert!(!stage_path(&config.builder_root, INSTALLER_PATH).exists());
    assert!(!runner.programs().iter().any(|p| p == "cargo"));
}

#[test]
fn transient_fetch_failures_are_retried_within_policy() {
    let dir = tempdir().unwrap();
    let config = config_for(&project(dir.path()), "amd64");
    let fetcher = FakeFetcher::failing(2);

    let outcome = run_pipeline(&config, &fetcher, &ScriptedRunner::default());
    let build_id = outcome.build_id.clone();
    assert!(outcome.into_result().is_ok());
    assert_eq!(fetcher.urls().len(), 3);

    let events = Journal::read_build(&config.state_dir.join(JOURNAL_FILE), &build_id).unwrap();
    let installed = events
        .iter()
        .find(|e| e.phase == "toolchain_installed")
        .unwrap();
    assert_eq!(installed.detail["fetch_attempts"], 3);
}

#[test]
fn single_attempt_policy_fails_immediately() {
    let dir = tempdir().unwrap();
    let mut config = config_for(&project(dir.path()), "amd64");
    config.fetch.attempts = 1;
    let fetcher = FakeFetcher::failing(1);
    let runner = ScriptedRunner::default();

    let outcome = run_pipeline(&config, &fetcher, &runner);

    match outcome.state {
        BuildState::Failed { step, error } => {
            assert_eq!(step, Step::Provision);
            assert!(error.is_retryable());
        }
        other => panic!("expected failure, got {}", other.name()),
    }
    assert_eq!(fetcher.urls().len(), 1);
    assert!(!stage_path(&config.builder_root, INSTALLER_PATH).exists());
    assert!(!runner.programs().iter().any(|p| p == "rustup-init"));
}

#[test]
fn checksum_mismatch_stops_before_running_the_installer() {
    let dir = tempdir().unwrap();
    let mut config = config_for(&project(dir.path()), "amd64");
    config
        .toolchain
        .installer_sha256
        .insert("amd64".to_string(), "00".repeat(32));
    let runner = ScriptedRunner::default();

    let outcome = run_pipeline(&config, &FakeFetcher::default(), &runner);

    match outcome.state {
        BuildState::Failed { step, error } => {
            assert_eq!(step, Step::Provision);
            assert!(matches!(error, StagehandError::ChecksumMismatch { .. }));
        }
        other => panic!("expected failure, got {}", other.name()),
    }
    assert!(runner.programs().is_empty());
    assert!(!stage_path(&config.builder_root, INSTALLER_PATH).exists());
}

#[test]
fn two_clean_runs_yield_identical_layouts() {
    let dir = tempdir().unwrap();
    let config = config_for(&project(dir.path()), "amd64");

    let first = run_pipeline(&config, &FakeFetcher::default(), &ScriptedRunner::default());
    assert!(first.into_result().is_ok());
    let first_digest = layout_digest(&config.runtime_root).unwrap();

    let second = run_pipeline(&config, &FakeFetcher::default(), &ScriptedRunner::default());
    assert!(second.into_result().is_ok());
    assert_eq!(first_digest, layout_digest(&config.runtime_root).unwrap());
}

#[test]
fn runtime_packages_are_minimal_and_builder_keeps_tooling() {
    let dir = tempdir().unwrap();
    let config = config_for(&project(dir.path()), "amd64");
    let outcome = run_pipeline(&config, &FakeFetcher::default(), &ScriptedRunner::default());
    assert!(outcome.into_result().is_ok());

    let runtime = ledger(&config.runtime_root);
    assert_eq!(runtime, BTreeSet::from(["ca-certificates".to_string()]));
    assert!(!config.runtime_root.join(LedgerPackages::CACHE).exists());

    let builder = ledger(&config.builder_root);
    assert!(builder.contains("build-essential"));
    assert!(builder.contains("libssl-dev"));
}

#[test]
fn build_tooling_in_the_runtime_set_fails_assembly() {
    let dir = tempdir().unwrap();
    let mut config = config_for(&project(dir.path()), "amd64");
    config.runtime.packages.push("gcc".to_string());

    let outcome = run_pipeline(&config, &FakeFetcher::default(), &ScriptedRunner::default());

    match outcome.state {
        BuildState::Failed { step, error } => {
            assert_eq!(step, Step::Assemble);
            assert!(error.to_string().contains("build tooling: gcc"));
        }
        other => panic!("expected failure, got {}", other.name()),
    }
}

#[test]
fn home_alias_resolves_to_an_existing_data_directory() {
    let dir = tempdir().unwrap();
    let config = config_for(&project(dir.path()), "amd64");
    let outcome = run_pipeline(&config, &FakeFetcher::default(), &ScriptedRunner::default());
    let layout = outcome.into_result().unwrap();

    let target = fs::read_link(&layout.home_alias).unwrap();
    let resolved = stage_path(&config.runtime_root, target.to_str().unwrap());
    assert_eq!(resolved, layout.data_dir);
    assert!(resolved.is_dir());
    assert_ne!(fs::metadata(&resolved).unwrap().permissions().mode() & 0o200, 0);
}

#[test]
fn foreign_runtime_root_is_left_untouched() {
    let dir = tempdir().unwrap();
    let config = config_for(&project(dir.path()), "amd64");
    fs::create_dir_all(&config.runtime_root).unwrap();
    fs::write(config.runtime_root.join("notes.txt"), "keep me").unwrap();

    let outcome = run_pipeline(&config, &FakeFetcher::default(), &ScriptedRunner::default());

    match outcome.state {
        BuildState::Failed { step, .. } => assert_eq!(step, Step::Assemble),
        other => panic!("expected failure, got {}", other.name()),
    }
    assert_eq!(
        fs::read_to_string(config.runtime_root.join("notes.txt")).unwrap(),
        "keep me"
    );
}

#[test]
fn journal_records_every_transition_of_a_build() {
    let dir = tempdir().unwrap();
    let config = config_for(&project(dir.path()), "amd64");
    let outcome = run_pipeline(&config, &FakeFetcher::default(), &ScriptedRunner::default());

    let events =
        Journal::read_build(&config.state_dir.join(JOURNAL_FILE), &outcome.build_id).unwrap();
    let phases: Vec<&str> = events.iter().map(|e| e.phase.as_str()).collect();
    assert_eq!(phases, outcome.trail);
    assert!(events.iter().all(|e| e.status == "ok"));
    let ids: BTreeSet<&str> = events.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids.len(), events.len());
}

#[test]
fn host_compiler_overrides_never_reach_the_toolchain() {
    // SAFETY: no test in this binary reads these variables.
    unsafe {
        std::env::set_var("RUSTC", "/opt/other/rustc");
        std::env::set_var("RUSTFLAGS", "-C target-cpu=native");
    }
    let dir = tempdir().unwrap();
    let config = config_for(&project(dir.path()), "amd64");
    let runner = ScriptedRunner::default();
    let outcome = run_pipeline(&config, &FakeFetcher::default(), &runner);
    assert!(outcome.into_result().is_ok());

    let calls = runner.calls.borrow();
    let build = calls
        .iter()
        .find(|c| c.program_name() == "cargo" && c.args.first().map(String::as_str) == Some("build"))
        .expect("cargo build spec");
    assert!(build.env_clear);
    assert!(!build.env.contains_key("RUSTC"));
    assert!(!build.env.contains_key("RUSTFLAGS"));
    let cargo_bin = stage_path(&config.builder_root, "/usr/local/cargo/bin");
    assert!(build.env["PATH"].starts_with(&cargo_bin.display().to_string()));

    let installer = calls
        .iter()
        .find(|c| c.program_name() == "rustup-init")
        .expect("installer spec");
    assert!(installer.env_clear);
    assert_eq!(installer.env["PATH"], config.system_path);
    assert!(!installer.env.contains_key("RUSTC"));
}
