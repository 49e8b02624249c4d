use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn stagehand(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stagehand"))
        .current_dir(dir)
        .env_remove("STAGEHAND_ARCH")
        .env_remove("STAGEHAND_DIST_SERVER")
        .args(args)
        .output()
        .expect("failed to execute stagehand")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

fn crate_dir(dir: &Path) {
    fs::create_dir_all(dir.join("src")).unwrap();
    fs::write(
        dir.join("Cargo.toml"),
        "[package]\nname = \"node\"\nversion = \"0.1.0\"\nedition = \"2021\"\n",
    )
    .unwrap();
    fs::write(dir.join("src/main.rs"), "fn main() {}\n").unwrap();
}

#[test]
fn resolve_prints_the_installer_locator() {
    let dir = tempdir().unwrap();
    let out = stagehand(dir.path(), &["resolve", "--arch", "arm64"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let json = stdout_json(&out);
    assert_eq!(json["envelope_version"], "1.0.0");
    assert_eq!(json["cmd"], "resolve");
    assert_eq!(json["status"], "ok");
    assert_eq!(json["locator"]["arch"], "arm64");
    assert_eq!(json["locator"]["triple"], "aarch64-unknown-linux-gnu");
}

#[test]
fn resolve_rejects_unsupported_architectures() {
    let dir = tempdir().unwrap();
    let out = stagehand(dir.path(), &["resolve", "--arch", "riscv64"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("riscv64"), "{stderr}");
}

#[test]
fn resolve_follows_the_configuration_precedence() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("stagehand.toml"), "arch = \"amd64\"\n").unwrap();
    let with_env = |args: &[&str]| {
        Command::new(env!("CARGO_BIN_EXE_stagehand"))
            .current_dir(dir.path())
            .env("STAGEHAND_ARCH", "aarch64")
            .env("STAGEHAND_DIST_SERVER", "http://mirror.internal")
            .args(args)
            .output()
            .expect("failed to execute stagehand")
    };

    let json = stdout_json(&stagehand(dir.path(), &["resolve"]));
    assert_eq!(json["locator"]["arch"], "amd64");

    let json = stdout_json(&with_env(&["resolve"]));
    assert_eq!(json["identifier"], "aarch64");
    assert_eq!(json["locator"]["arch"], "arm64");
    assert_eq!(
        json["locator"]["url"],
        "http://mirror.internal/rustup/dist/aarch64-unknown-linux-gnu/rustup-init"
    );

    let json = stdout_json(&with_env(&["resolve", "--arch", "x86_64"]));
    assert_eq!(json["locator"]["arch"], "amd64");
}

#[test]
fn render_emits_both_stages() {
    let dir = tempdir().unwrap();
    crate_dir(dir.path());
    let out = stagehand(dir.path(), &["render"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let dockerfile = String::from_utf8_lossy(&out.stdout);
    assert!(dockerfile.contains("AS builder"));
    assert!(dockerfile.contains("case \"${TARGETARCH}\" in"));
    assert!(dockerfile.contains("COPY --from=builder /usr/src/app/target/release/node /app/bin/"));
    assert!(dockerfile.contains("CMD [\"/app/entrypoint.sh\"]"));
}

#[test]
fn render_write_places_the_dockerfile_under_state_dir() {
    let dir = tempdir().unwrap();
    crate_dir(dir.path());
    let out = stagehand(dir.path(), &["--quiet", "render", "--write"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(dir.path().join(".stagehand/generated/Dockerfile").is_file());
}

#[test]
fn init_scaffolds_once_and_refuses_to_overwrite() {
    let dir = tempdir().unwrap();
    crate_dir(dir.path());

    let first = stagehand(dir.path(), &["init"]);
    assert!(first.status.success(), "{}", String::from_utf8_lossy(&first.stderr));
    assert_eq!(stdout_json(&first)["cmd"], "init");
    assert!(dir.path().join("stagehand.toml").is_file());
    assert!(dir.path().join("entrypoint.sh").is_file());

    let second = stagehand(dir.path(), &["init"]);
    assert!(!second.status.success());
    assert!(String::from_utf8_lossy(&second.stderr).contains("--force"));

    let forced = stagehand(dir.path(), &["init", "--force"]);
    assert!(forced.status.success());
}

#[test]
fn invalid_config_file_is_reported() {
    let dir = tempdir().unwrap();
    crate_dir(dir.path());
    fs::write(dir.path().join("stagehand.toml"), "[fetch]\nattempts = 0\n").unwrap();
    let out = stagehand(dir.path(), &["render"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("attempts"));
}

#[test]
fn run_with_unsupported_arch_fails_with_an_error_envelope() {
    let dir = tempdir().unwrap();
    crate_dir(dir.path());
    let out = stagehand(dir.path(), &["--quiet", "run", "--arch", "riscv64"]);
    assert!(!out.status.success());
    let json = stdout_json(&out);
    assert_eq!(json["cmd"], "run");
    assert_eq!(json["status"], "error");
    assert_eq!(json["failed_step"], "resolve");
    assert_eq!(json["kind"], "configuration");
    assert_eq!(json["trail"], serde_json::json!(["start", "failed"]));
    assert!(dir.path().join(".stagehand/build.events.jsonl").is_file());
}

#[test]
fn schema_and_version_are_machine_readable() {
    let dir = tempdir().unwrap();
    let schema = stagehand(dir.path(), &["schema"]);
    assert!(schema.status.success());
    let json = stdout_json(&schema);
    assert_eq!(json["name"], "stagehand");
    assert_eq!(json["architectures"].as_array().unwrap().len(), 2);

    let version = stagehand(dir.path(), &["version"]);
    let text = String::from_utf8_lossy(&version.stdout);
    assert_eq!(text.trim(), format!("v{}", env!("CARGO_PKG_VERSION")));
}
