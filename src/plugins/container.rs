//! Container surface: render the pipeline as a two-stage Dockerfile and
//! build it with docker or podman.

use crate::core::arch::Architecture;
use crate::core::config::{BuildConfig, STATE_DIR};
use crate::core::error::StagehandError;
use crate::core::exec::{CommandRunner, CommandSpec, find_container_runtime};
use crate::core::output::tail_lines;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub const GENERATED_DIR: &str = "generated";

fn shell_escape(s: &str) -> String {
    let escaped = s.replace('\'', "'\"'\"'");
    format!("'{}'", escaped)
}

pub fn sanitize_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches(|c| c == '-' || c == '.' || c == '_')
        .to_string()
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn arch_case_arms(config: &BuildConfig) -> String {
    let mut arms = String::new();
    for arch in Architecture::ALL {
        let pin = config
            .toolchain
            .installer_sha256
            .get(arch.as_str())
            .map(|s| s.trim().to_ascii_lowercase())
            .unwrap_or_default();
        arms.push_str(&format!(
            "        {}) rustArch='{}'; rustupSha256='{}' ;; \\\n",
            arch.as_str(),
            arch.rust_triple(),
            pin
        ));
    }
    arms
}

pub fn render_dockerfile(config: &BuildConfig) -> String {
    let tc = &config.toolchain;
    let build = &config.build;
    let rt = &config.runtime;

    let mut cargo_flags = String::new();
    if build.locked {
        cargo_flags.push_str(" --locked");
    }
    if !build.features.is_empty() {
        cargo_flags.push_str(&format!(" --features {}", shell_escape(&build.features.join(","))));
    }

    // --proto '=https' rejects http:// and file:// mirrors.
    let tls_flags = if tc.dist_server.starts_with("https://") {
        "--proto '=https' --tlsv1.2 "
    } else {
        ""
    };
    let retries = config.fetch.attempts.saturating_sub(1);
    let retry_delay = (config.fetch.backoff_ms / 1000).max(1);

    let mut out = String::new();
    out.push_str(&format!(
        "# Generated by stagehand {}\n\
         # Path: {}/{}/Dockerfile\n\
         # Regenerate via: stagehand render --write\n\n",
        env!("CARGO_PKG_VERSION"),
        STATE_DIR,
        GENERATED_DIR
    ));

    // Builder stage.
    out.push_str(&format!(
        "FROM {} AS builder\n\
         ENV DEBIAN_FRONTEND=noninteractive\n\
         ARG TARGETARCH\n\
         ENV RUSTUP_HOME={} \\\n    CARGO_HOME={} \\\n    PATH={}:$PATH\n",
        build.image,
        tc.rustup_home,
        tc.cargo_home,
        tc.bin_dir()
    ));
    out.push_str(&format!(
        "RUN set -eux; \\\n    apt-get update; \\\n    \
         apt-get dist-upgrade -y -o DPkg::Options::=--force-confold; \\\n    \
         apt-get install -y --no-install-recommends {}\n",
        build.packages.join(" ")
    ));
    out.push_str("RUN set -eux; \\\n    case \"${TARGETARCH}\" in \\\n");
    out.push_str(&arch_case_arms(config));
    out.push_str(
        "        *) echo >&2 \"unsupported architecture: ${TARGETARCH}\"; exit 1 ;; \\\n    \
         esac; \\\n",
    );
    out.push_str(&format!(
        "    url=\"{}/rustup/dist/${{rustArch}}/rustup-init\"; \\\n    \
         curl {}-sSfL --retry {} --retry-delay {} \
         --connect-timeout {} --max-time {} -o rustup-init \"$url\"; \\\n    \
         if [ -n \"${{rustupSha256}}\" ]; then echo \"${{rustupSha256}} *rustup-init\" | sha256sum -c -; fi; \\\n    \
         chmod +x rustup-init; \\\n    \
         ./rustup-init -y --no-modify-path --profile {} --default-toolchain {}; \\\n    \
         rm rustup-init; \\\n    \
         chmod -R a+w \"$RUSTUP_HOME\" \"$CARGO_HOME\"; \\\n    \
         rustup --version; \\\n    \
         cargo --version; \\\n    \
         rustc --version\n",
        tc.dist_server.trim_end_matches('/'),
        tls_flags,
        retries,
        retry_delay,
        config.fetch.connect_timeout_secs,
        config.fetch.timeout_secs,
        tc.profile,
        tc.channel
    ));
    out.push_str(&format!(
        "WORKDIR {}\n\
         COPY . .\n\
         RUN cargo build --release{}\n\n",
        build.workdir, cargo_flags
    ));

    // Runtime stage.
    let data = config.image_data_dir();
    out.push_str(&format!(
        "FROM {}\n\
         ENV DEBIAN_FRONTEND=noninteractive\n\
         RUN set -ex && \\\n    \
         apt-get update && \\\n    \
         apt-get dist-upgrade -y -o DPkg::Options::=--force-confold && \\\n    \
         apt-get install -y --no-install-recommends {} && \\\n    \
         apt-get autoremove --purge -y && \\\n    \
         apt-get clean && \\\n    \
         rm -rf /var/lib/apt/lists/* && \\\n    \
         mkdir -p {} {} {} && \\\n    \
         ln -s {} {}\n",
        rt.image,
        rt.packages.join(" "),
        config.image_bin_dir(),
        data,
        parent_dir(&rt.home_alias),
        data,
        rt.home_alias
    ));
    out.push_str(&format!(
        "COPY --from=builder {} {}/\n\
         COPY --from=builder {} {}\n\
         RUN chmod 0755 {} {}\n\
         VOLUME [\"{}\"]\n\
         CMD [\"{}\"]\n",
        config.image_release_binary(),
        config.image_bin_dir(),
        config.image_entrypoint_source(),
        config.image_entrypoint(),
        config.image_binary(),
        config.image_entrypoint(),
        data,
        config.image_entrypoint()
    ));
    out
}

/// Context exclusions, read by BuildKit from `<Dockerfile>.dockerignore`.
pub fn render_dockerignore(config: &BuildConfig) -> String {
    let mut out = format!("target\n.git\n{}\n", STATE_DIR);
    if let Some(rel) = config.state_dir_in_source() {
        if rel != std::path::Path::new(STATE_DIR) {
            out.push_str(&format!("{}\n", rel.display()));
        }
    }
    out
}

pub fn generated_dockerfile_path(config: &BuildConfig) -> PathBuf {
    config.state_dir.join(GENERATED_DIR).join("Dockerfile")
}

pub fn write_dockerfile(config: &BuildConfig) -> Result<PathBuf, StagehandError> {
    let path = generated_dockerfile_path(config);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, render_dockerfile(config))?;
    fs::write(
        path.with_file_name("Dockerfile.dockerignore"),
        render_dockerignore(config),
    )?;
    Ok(path)
}

#[derive(Debug, Clone)]
pub struct ImageBuildRequest {
    pub tag: Option<String>,
    pub runtime: Option<String>,
    pub timeout_seconds: u64,
}

pub fn default_tag(config: &BuildConfig) -> String {
    let name = sanitize_name(&config.build.binary);
    format!("{}:latest", if name.is_empty() { "stagehand-image" } else { &name })
}

pub fn image_build_args(
    config: &BuildConfig,
    arch: Architecture,
    dockerfile: &std::path::Path,
    tag: &str,
) -> Vec<String> {
    vec![
        "build".to_string(),
        "--platform".to_string(),
        arch.platform(),
        "-f".to_string(),
        dockerfile.display().to_string(),
        "-t".to_string(),
        tag.to_string(),
        config.source_dir.display().to_string(),
    ]
}

pub fn build_image(
    config: &BuildConfig,
    request: &ImageBuildRequest,
    runner: &dyn CommandRunner,
) -> Result<serde_json::Value, StagehandError> {
    // Resolve before touching the runtime: an unknown machine never reaches docker.
    let arch = config.arch()?;
    let runtime = match &request.runtime {
        Some(r) => r.clone(),
        None => find_container_runtime(runner)?,
    };
    if runtime != "docker" && runtime != "podman" {
        return Err(StagehandError::ConfigError(format!(
            "Unsupported container runtime '{}'",
            runtime
        )));
    }
    let tag = request.tag.clone().unwrap_or_else(|| default_tag(config));
    let dockerfile = write_dockerfile(config)?;
    let spec = CommandSpec::new(&runtime)
        .args(image_build_args(config, arch, &dockerfile, &tag))
        .timeout(Duration::from_secs(request.timeout_seconds));

    let start = Instant::now();
    let out = runner.run(&spec)?;
    let elapsed = start.elapsed().as_secs();
    if !out.success() {
        return Err(StagehandError::RuntimeError(format!(
            "{} build failed (exit {:?})\n{}",
            runtime,
            out.code,
            tail_lines(&out.stderr, 30)
        )));
    }
    Ok(json!({
        "runtime": runtime,
        "image": tag,
        "platform": arch.platform(),
        "dockerfile": dockerfile,
        "elapsed_seconds": elapsed,
        "cmd": [config.image_entrypoint()],
        "volumes": [config.image_data_dir()],
    }))
}

pub fn schema() -> serde_json::Value {
    json!({
        "name": "stagehand",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Two-stage build pipeline: toolchain provisioning, release compilation, minimal runtime image with a persisted data volume",
        "commands": [
            { "name": "resolve", "parameters": ["arch"] },
            { "name": "render", "parameters": ["write"] },
            { "name": "run", "parameters": ["builder_root", "runtime_root", "quiet"] },
            { "name": "inspect", "parameters": ["runtime_root"] },
            { "name": "image build", "parameters": ["tag", "runtime", "timeout_seconds"] },
            { "name": "init", "parameters": ["force", "dry_run"] }
        ],
        "architectures": Architecture::ALL
            .iter()
            .map(|a| json!({ "name": a.as_str(), "triple": a.rust_triple() }))
            .collect::<Vec<_>>(),
        "states": ["start", "toolchain_resolved", "toolchain_installed", "source_compiled", "runtime_assembled", "ready", "failed"],
        "package_backends": ["ledger", "apt"]
    })
}
