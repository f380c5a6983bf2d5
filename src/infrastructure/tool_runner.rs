//! External process execution with captured output and a hard timeout

use std::ffi::OsStr;
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured result of a successful run
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external tools, killing any that outlive the timeout.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    timeout: Duration,
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

impl ToolRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `program` to completion. Any exit other than 0 is `ExternalToolFailed`.
    pub fn run<I, S>(&self, program: &str, args: I, stdin: Option<&str>) -> AppResult<ToolOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(program, "Running external tool");

        let mut child = command.spawn().map_err(|e| AppError::ExternalToolFailed {
            tool: program.to_string(),
            exit_code: None,
            stderr: format!("failed to start: {}", e),
        })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        if let (Some(payload), Some(mut pipe)) = (stdin, child.stdin.take()) {
            // A child that exits without reading its input is not an error here.
            let _ = pipe.write_all(payload.as_bytes());
        }

        let exit_code = self.wait(&mut child, program)?;
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        match exit_code {
            Some(0) => Ok(ToolOutput { stdout, stderr }),
            code => {
                warn!(program, exit_code = ?code, stderr = %stderr.trim(), "External tool failed");
                Err(AppError::ExternalToolFailed {
                    tool: program.to_string(),
                    exit_code: code,
                    stderr: stderr.trim().to_string(),
                })
            }
        }
    }

    /// Poll until exit or timeout. `None` means the child was killed.
    fn wait(&self, child: &mut Child, program: &str) -> AppResult<Option<i32>> {
        let start = Instant::now();
        loop {
            match child.try_wait()? {
                Some(status) => return Ok(status.code()),
                None if start.elapsed() >= self.timeout => {
                    warn!(program, timeout_secs = self.timeout.as_secs(), "External tool timed out, killing");
                    let _ = child.kill();
                    let _ = child.wait();
                    return Ok(None);
                }
                None => std::thread::sleep(POLL_INTERVAL),
            }
        }
    }
}
