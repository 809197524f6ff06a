//! Host command execution for firewall backends.
//!
//! Firewall changes go through [`run`], which spawns the binary with an
//! explicit argument vector (never through a shell), captures capped stderr
//! and enforces a timeout. `kill_on_drop(true)` makes sure a command whose
//! caller was cancelled does not linger.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::EnforcementError;

/// Max stderr kept per command. iptables errors are one line.
const MAX_CAPTURE: usize = 4096;

/// Completed command.
#[derive(Debug)]
pub struct CommandOutput {
    /// Exit code, or `-1` if the process was killed by a signal.
    pub exit_code: i32,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// First stderr line, or the exit code when stderr was empty.
    pub fn detail(&self) -> String {
        match self.stderr.lines().next().map(str::trim) {
            Some(line) if !line.is_empty() => line.to_string(),
            _ => format!("exit code {}", self.exit_code),
        }
    }
}

/// Optional `sudo` prefix plus the program and arguments.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: &str, args: Vec<String>, use_sudo: bool) -> Self {
        if use_sudo {
            let mut full = Vec::with_capacity(args.len() + 2);
            full.push("-n".to_string());
            full.push(program.to_string());
            full.extend(args);
            Self {
                program: "sudo".to_string(),
                args: full,
            }
        } else {
            Self {
                program: program.to_string(),
                args,
            }
        }
    }

    /// Human-readable form for logs.
    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Run `invocation` to completion or until `timeout` elapses.
///
/// A non-zero exit is returned as `Ok` with the exit code; only failure to
/// start or wait for the process is an `Err`.
pub async fn run(
    invocation: &Invocation,
    timeout: Duration,
) -> Result<CommandOutput, EnforcementError> {
    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| EnforcementError::Spawn {
            program: invocation.program.clone(),
            reason: e.to_string(),
        })?;

    let mut stderr = child.stderr.take().ok_or_else(|| EnforcementError::Spawn {
        program: invocation.program.clone(),
        reason: "stderr pipe unavailable".to_string(),
    })?;

    let wait = async {
        let stderr_data = read_capped(&mut stderr, MAX_CAPTURE).await;
        drop(stderr);
        let status = child.wait().await.map_err(|e| EnforcementError::Spawn {
            program: invocation.program.clone(),
            reason: e.to_string(),
        })?;
        Ok::<_, EnforcementError>(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stderr: stderr_data,
        })
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(EnforcementError::Timeout {
            program: invocation.program.clone(),
        }),
    }
}

/// Read from an async reader, keeping the first `max_bytes` and draining the
/// rest so the child never blocks on a full pipe.
async fn read_capped(reader: &mut (impl tokio::io::AsyncRead + Unpin), max_bytes: usize) -> String {
    let mut buf = Vec::with_capacity(max_bytes.min(1024));
    let mut tmp = [0u8; 1024];
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
