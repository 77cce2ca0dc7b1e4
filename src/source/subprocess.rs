//! Event source backed by an external `conntrack -E` process.
//!
//! Each run spawns the program, feeds every stdout line through the sink and
//! ends when the program closes its output. Stderr is drained into the log.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{EventFilter, EventSource, LineSink, Result, SourceError};

/// Default conntrack binary, resolved through `PATH`.
pub const DEFAULT_PROGRAM: &str = "conntrack";

/// Default kernel event socket buffer handed to `conntrack -b`.
pub const DEFAULT_BUFFER_SIZE: usize = 10_485_760;

/// Arguments that make `conntrack` stream events in the parser's grammar.
pub fn conntrack_args(buffer_size: usize, filter: &EventFilter) -> Vec<String> {
    let mut args = vec![
        "-E".to_string(),
        "-b".to_string(),
        buffer_size.to_string(),
        "-e".to_string(),
        filter.joined(),
        "-o".to_string(),
        "timestamp,extended,id".to_string(),
    ];
    if filter.nat_only {
        args.push("--any-nat".to_string());
    }
    args
}

/// Runs a program and reads conntrack event lines from its stdout.
#[derive(Debug, Clone)]
pub struct SubprocessSource {
    name: String,
    program: String,
    args: Vec<String>,
}

impl SubprocessSource {
    /// Arbitrary program and arguments. No shell interpretation.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        Self {
            name: format!("subprocess:{program}"),
            program,
            args,
        }
    }

    /// `conntrack -E` with the standard output format.
    pub fn conntrack(program: impl Into<String>, buffer_size: usize, filter: &EventFilter) -> Self {
        Self::new(program, conntrack_args(buffer_size, filter))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl EventSource for SubprocessSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, sink: &LineSink) -> Result<()> {
        info!(program = %self.program, args = ?self.args, "Spawning conntrack process");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SourceError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(self.program.clone(), stderr));
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Exited("stdout was not captured".to_string()))?;

        let mut lines = BufReader::new(stdout).split(b'\n');
        while let Some(raw) = lines.next_segment().await? {
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            // Dropping `child` on the error path kills the process.
            sink.push_line(line).await?;
        }

        let status = child.wait().await?;
        debug!(program = %self.program, %status, "Conntrack process output closed");
        Err(SourceError::Exited(status.to_string()))
    }
}

async fn drain_stderr<R: AsyncRead + Unpin>(program: String, stderr: R) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => {
                warn!(program = %program, "{}", line.trim_end());
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                debug!(program = %program, error = %e, "Stopped reading stderr");
                break;
            }
        }
    }
}
