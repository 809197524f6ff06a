//! Built-in supervisor that restarts the gateway on crash.
//!
//! `edgegate supervise` spawns `edgegate serve` and monitors it. On abnormal
//! exit the server is restarted with exponential backoff. A clean exit, or any
//! exit after SIGINT/SIGTERM was forwarded to the child, stops the supervisor.
//!
//! The portal must stay up: while the server is down, clients with an existing
//! firewall grant keep working but nobody new can authenticate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;

/// Delay before the next restart. Resets to 1s once the previous run stayed
/// up for `stable_threshold`.
fn next_backoff(current: u64, uptime: Duration, stable_threshold: Duration, max: u64) -> u64 {
    if uptime >= stable_threshold {
        1
    } else {
        current.saturating_mul(2).min(max.max(1))
    }
}

#[allow(clippy::cast_possible_wrap)]
fn forward(pid: Option<u32>, sig: libc::c_int) {
    if let Some(pid) = pid {
        // SAFETY: kill(2) has no memory-safety preconditions.
        unsafe {
            libc::kill(pid as i32, sig);
        }
    }
}

/// Run the supervisor loop until the server exits cleanly or is told to stop.
pub async fn run_supervisor(
    config_path: Option<&str>,
    sup_config: &SupervisorConfig,
) -> std::io::Result<()> {
    let mut backoff = 1u64;
    let stable_threshold = Duration::from_secs(sup_config.stable_threshold);
    let exe = std::env::current_exe()?;
    let stopping = Arc::new(AtomicBool::new(false));

    loop {
        let started = Instant::now();

        let mut cmd = Command::new(&exe);
        cmd.arg("serve");
        if let Some(p) = config_path {
            cmd.args(["--config", p]);
        }

        let mut child = cmd.spawn()?;
        let server_pid = child.id();
        info!("Supervisor: started server (pid {server_pid:?})");

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let stop_flag = stopping.clone();
        let signal_task = tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Supervisor: forwarding SIGINT to server");
                    stop_flag.store(true, Ordering::SeqCst);
                    forward(server_pid, libc::SIGINT);
                }
                _ = sigterm.recv() => {
                    info!("Supervisor: forwarding SIGTERM to server");
                    stop_flag.store(true, Ordering::SeqCst);
                    forward(server_pid, libc::SIGTERM);
                }
            }
        });

        let status = child.wait().await;
        signal_task.abort();
        let uptime = started.elapsed();

        match status {
            Ok(s) if s.success() => {
                info!("Server exited cleanly, supervisor stopping");
                return Ok(());
            }
            _ if stopping.load(Ordering::SeqCst) => {
                info!("Server stopped after signal, supervisor stopping");
                return Ok(());
            }
            Ok(s) => warn!(
                "Server exited: {s} (uptime {:.1}s), restarting in {backoff}s",
                uptime.as_secs_f64()
            ),
            Err(e) => error!(
                "Server wait error: {e} (uptime {:.1}s), restarting in {backoff}s",
                uptime.as_secs_f64()
            ),
        }

        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff = next_backoff(backoff, uptime, stable_threshold, sup_config.max_backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let stable = Duration::from_secs(60);
        let short = Duration::from_secs(2);
        let mut b = 1;
        let mut seen = Vec::new();
        for _ in 0..8 {
            b = next_backoff(b, short, stable, 30);
            seen.push(b);
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 30, 30, 30, 30]);
    }

    #[test]
    fn test_backoff_resets_after_stable_run() {
        let stable = Duration::from_secs(60);
        assert_eq!(next_backoff(16, Duration::from_secs(61), stable, 60), 1);
    }
}
