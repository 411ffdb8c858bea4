//! Local subprocess driver: spawns the node's command as a child process,
//! merges RUN_ID/NODE_ID into its environment, and streams its stdout as
//! NDJSON lines. Cancellation sends SIGTERM and escalates to SIGKILL after
//! a grace period if the process hasn't exited.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use crate::error::{CoreError, Result};
use crate::driver::{
    parse::parse_line, Driver, DriverContext, DriverEvent, DriverOutcome, EXIT_CODE_CANCELLED,
    EXIT_CODE_TIMEOUT, SIGTERM_GRACE_PERIOD_SECS,
};

pub struct LocalProcessDriver {
    grace_period: Duration,
}

impl LocalProcessDriver {
    pub fn new() -> Self {
        Self {
            grace_period: Duration::from_secs(SIGTERM_GRACE_PERIOD_SECS),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                let pid = nix::unistd::Pid::from_raw(pid as i32);
                let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
                if timeout(self.grace_period, child.wait()).await.is_err() {
                    let _ = child.kill().await;
                }
                return;
            }
        }
        let _ = child.kill().await;
    }
}

impl Default for LocalProcessDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for LocalProcessDriver {
    async fn execute(
        &self,
        ctx: DriverContext,
        events: mpsc::Sender<DriverEvent>,
    ) -> Result<DriverOutcome> {
        if ctx.node.command.is_empty() {
            return Err(CoreError::Validation(format!(
                "node {} has no command for the local driver",
                ctx.node.id
            )));
        }

        let mut command = Command::new(&ctx.node.command[0]);
        command
            .args(&ctx.node.command[1..])
            .env("RUN_ID", &ctx.run_id)
            .env("NODE_ID", &ctx.node.id)
            .envs(&ctx.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| CoreError::DriverFailure(format!("failed to spawn: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::DriverFailure("no stdout handle".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CoreError::DriverFailure("no stderr handle".to_string()))?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let deadline = ctx.node.timeout.map(Duration::from_secs);
        let run_fut = async {
            loop {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => {
                        return Outcome::Cancelled;
                    }
                    line = stdout_lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                let _ = events.send(parse_line(&line)).await;
                            }
                            Ok(None) => {}
                            Err(_) => {}
                        }
                    }
                    line = stderr_lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                let _ = events.send(DriverEvent::Log { message: line }).await;
                            }
                            Ok(None) => {}
                            Err(_) => {}
                        }
                    }
                    status = child.wait() => {
                        return Outcome::Exited(status);
                    }
                }
            }
        };

        let outcome = match deadline {
            Some(d) => match timeout(d, run_fut).await {
                Ok(outcome) => outcome,
                Err(_) => Outcome::TimedOut,
            },
            None => run_fut.await,
        };

        match outcome {
            Outcome::Exited(status) => {
                let status = status.map_err(|e| CoreError::DriverFailure(e.to_string()))?;
                Ok(DriverOutcome {
                    exit_code: status.code().unwrap_or(-1),
                    timed_out: false,
                    cancelled: false,
                })
            }
            Outcome::TimedOut => {
                self.terminate(&mut child).await;
                Ok(DriverOutcome {
                    exit_code: EXIT_CODE_TIMEOUT,
                    timed_out: true,
                    cancelled: false,
                })
            }
            Outcome::Cancelled => {
                self.terminate(&mut child).await;
                Ok(DriverOutcome {
                    exit_code: EXIT_CODE_CANCELLED,
                    timed_out: false,
                    cancelled: true,
                })
            }
        }
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}
