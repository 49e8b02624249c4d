//! Installer download.
//!
//! A [`Fetcher`] performs exactly one attempt. The retry loop lives in
//! [`fetch_with_retry`] and is driven by [`FetchPolicy`]; only errors that
//! report [`StagehandError::is_retryable`] are retried.

use crate::core::config::FetchPolicy;
use crate::core::error::StagehandError;
use crate::core::exec::{CommandRunner, CommandSpec};
use crate::core::output::compact_line;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::thread;
use std::time::Duration;

pub trait Fetcher {
    fn fetch_once(&self, url: &str, dest: &Path, policy: &FetchPolicy)
    -> Result<(), StagehandError>;
}

/// Downloads with `curl`, restricted to HTTPS for remote URLs.
pub struct CurlFetcher<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> CurlFetcher<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl Fetcher for CurlFetcher<'_> {
    fn fetch_once(
        &self,
        url: &str,
        dest: &Path,
        policy: &FetchPolicy,
    ) -> Result<(), StagehandError> {
        let dest_str = dest
            .to_str()
            .ok_or_else(|| StagehandError::ConfigError("invalid download path".to_string()))?;
        let mut spec = CommandSpec::new("curl").args(["--fail", "--silent", "--show-error", "--location"]);
        if url.starts_with("https://") {
            spec = spec.args(["--proto", "=https", "--tlsv1.2"]);
        }
        spec = spec
            .arg("--connect-timeout")
            .arg(policy.connect_timeout_secs.to_string())
            .arg("--max-time")
            .arg(policy.timeout_secs.to_string())
            .arg("--output")
            .arg(dest_str)
            .arg(url)
            .timeout(Duration::from_secs(policy.timeout_secs + 5));

        let output = self.runner.run(&spec).map_err(|e| StagehandError::FetchError {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !output.success() {
            return Err(StagehandError::FetchError {
                url: url.to_string(),
                reason: format!(
                    "curl exit {:?}: {}",
                    output.code,
                    compact_line(&output.stderr, 300)
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchReport {
    pub attempts: u32,
}

pub fn fetch_with_retry(
    fetcher: &dyn Fetcher,
    url: &str,
    dest: &Path,
    policy: &FetchPolicy,
) -> Result<FetchReport, StagehandError> {
    let mut attempt = 1;
    loop {
        match fetcher.fetch_once(url, dest, policy) {
            Ok(()) => return Ok(FetchReport { attempts: attempt }),
            Err(err) => {
                // A failed attempt may leave a truncated file behind.
                if dest.exists() {
                    fs::remove_file(dest)?;
                }
                if !err.is_retryable() || attempt >= policy.attempts {
                    return Err(err);
                }
                thread::sleep(policy.backoff(attempt));
                attempt += 1;
            }
        }
    }
}

pub fn sha256_file(path: &Path) -> Result<String, StagehandError> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
