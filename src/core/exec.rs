//! External process execution.
//!
//! Every tool the pipeline drives (installer, cargo, apt-get, curl, the
//! container runtime) goes through [`CommandRunner`], so tests can swap in a
//! scripted runner and observe exactly which commands a step issued.

use crate::core::error::StagehandError;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Host variables an isolated command still sees. PATH is not among them:
/// callers set it to the toolchain's own search path.
pub const PASSTHROUGH_ENV: [&str; 2] = ["HOME", "TERM"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Start from an empty environment instead of inheriting the host's.
    pub env_clear: bool,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            env_clear: false,
            cwd: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        for (k, v) in vars {
            self.env.insert(k.clone(), v.clone());
        }
        self
    }

    /// Drop the inherited environment, keeping only [`PASSTHROUGH_ENV`]
    /// from the host. Variables set on the spec still apply.
    pub fn isolated_env(mut self) -> Self {
        self.env_clear = true;
        for key in PASSTHROUGH_ENV {
            if let Ok(value) = std::env::var(key) {
                self.env.entry(key.to_string()).or_insert(value);
            }
        }
        self
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// File name of the program, for matching and diagnostics.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub trait CommandRunner {
    /// Run to completion. A non-zero exit is reported through
    /// [`CommandOutput::code`], not as an error; errors mean the process
    /// could not be started or was killed.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, StagehandError>;
}

/// Runs commands on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, StagehandError> {
        let mut command = Command::new(&spec.program);
        if spec.env_clear {
            command.env_clear();
        }
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(|e| {
            StagehandError::NotFound(format!("cannot start {}: {}", spec.program.display(), e))
        })?;

        // Drain both pipes concurrently so a chatty tool cannot block on a full pipe.
        let stdout_reader = child.stdout.take().map(drain);
        let stderr_reader = child.stderr.take().map(drain);

        let start = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if let Some(limit) = spec.timeout {
                if start.elapsed() > limit {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(StagehandError::RuntimeError(format!(
                        "{} timed out after {}s",
                        spec.program_name(),
                        limit.as_secs()
                    )));
                }
            }
            thread::sleep(Duration::from_millis(100));
        };

        Ok(CommandOutput {
            code: status.code(),
            stdout: stdout_reader.map(join_reader).unwrap_or_default(),
            stderr: stderr_reader.map(join_reader).unwrap_or_default(),
        })
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).to_string()
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

pub fn command_exists(runner: &dyn CommandRunner, cmd: &str) -> bool {
    runner
        .run(&CommandSpec::new(cmd).arg("--version"))
        .map(|out| out.success())
        .unwrap_or(false)
}

/// First available container runtime, docker preferred.
pub fn find_container_runtime(runner: &dyn CommandRunner) -> Result<String, StagehandError> {
    for candidate in ["docker", "podman"] {
        if command_exists(runner, candidate) {
            return Ok(candidate.to_string());
        }
    }
    Err(StagehandError::NotFound(
        "No container runtime found (docker/podman)".to_string(),
    ))
}
