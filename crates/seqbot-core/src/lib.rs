use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Fixed attempt bound shared by every retryable remote operation.
pub const RETRY_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command `{command}` exited with {status}: {stderr_tail}")]
    CommandFailed {
        command: String,
        status: String,
        stderr_tail: String,
    },
    #[error("couldn't {what} {target} after {attempts} attempts")]
    RetriesExhausted {
        what: String,
        target: String,
        attempts: u32,
    },
}

/// Seam for external command invocation so retry counts and invocation
/// ordering are observable in tests.
pub trait CommandRunner {
    /// Run `argv`, returning captured stdout on a zero exit status.
    fn run(&mut self, argv: &[String]) -> Result<String>;
}

/// Production runner over `std::process::Command`.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&mut self, argv: &[String]) -> Result<String> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty command"))?;
        let output = Command::new(program)
            .args(rest)
            .output()
            .with_context(|| format!("failed to spawn {}", program))?;
        if !output.status.success() {
            let stderr_tail = String::from_utf8_lossy(&output.stderr)
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("")
                .to_string();
            return Err(ExecError::CommandFailed {
                command: shell_join(argv),
                status: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr_tail,
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Log the command line at INFO, run it, log captured output at DEBUG.
pub fn log_command(runner: &mut dyn CommandRunner, argv: &[String]) -> Result<String> {
    info!("{}", shell_join(argv));
    let output = runner.run(argv)?;
    let trimmed = output.trim_end();
    if !trimmed.is_empty() {
        debug!("{}", trimmed);
    }
    Ok(output)
}

/// Run `argv` up to [`RETRY_ATTEMPTS`] times with no delay between
/// attempts. Exhaustion escalates to an error naming the operation and
/// the target path it was acting on.
pub fn retry_command(
    runner: &mut dyn CommandRunner,
    argv: &[String],
    what: &str,
    target: &str,
) -> Result<String> {
    for attempt in 1..=RETRY_ATTEMPTS {
        match log_command(runner, argv) {
            Ok(output) => return Ok(output),
            Err(err) => {
                debug!("attempt {} failed: {:#}", attempt, err);
                if attempt < RETRY_ATTEMPTS {
                    info!("retrying {}", what);
                }
            }
        }
    }
    Err(ExecError::RetriesExhausted {
        what: what.to_string(),
        target: target.to_string(),
        attempts: RETRY_ATTEMPTS,
    }
    .into())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))?;
    Ok(())
}

/// Join `s3://` URI segments, trimming stray slashes.
pub fn s3_join(base: &str, segments: &[&str]) -> String {
    let mut uri = base.trim_end_matches('/').to_string();
    for seg in segments {
        let seg = seg.trim_matches('/');
        if !seg.is_empty() {
            uri.push('/');
            uri.push_str(seg);
        }
    }
    uri
}

/// Split `bucket/prefix/...` (with or without a leading `s3://`) into
/// bucket and key prefix.
pub fn split_bucket_key(path: &str) -> Result<(String, String)> {
    let trimmed = path.trim_start_matches("s3://").trim_matches('/');
    let mut parts = trimmed.splitn(2, '/');
    let bucket = parts
        .next()
        .filter(|b| !b.is_empty())
        .ok_or_else(|| anyhow!("invalid s3 path: {}", path))?;
    let prefix = parts.next().unwrap_or("").to_string();
    Ok((bucket.to_string(), prefix))
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Configure the global subscriber: stderr at INFO (DEBUG with `debug`),
/// plus an optional DEBUG-level file sink. `RUST_LOG` overrides the
/// stderr level when set.
pub fn init_logging(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let stderr_level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let stderr_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(stderr_level.into()));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    let file_layer = match log_file {
        Some(path) => {
            let file = fs::File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}
