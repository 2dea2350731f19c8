//! Reachability probing for freshly created machines.
//!
//! A machine counts as reachable once it accepts an authenticated session
//! and executes a trivial command. The prober retries with a fixed delay and
//! an unbounded attempt count; only the caller's deadline stops it, by
//! cancelling the in-flight attempt rather than counting tries.

use std::future::pending;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::ssh::{SshClient, SshError, SshSettings};

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Trivial command executed to prove the machine accepts remote commands.
const NOOP_COMMAND: &str = "true";

/// Errors raised by the reachability prober.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The deadline elapsed before any probe succeeded. Carries the last
    /// underlying probe failure.
    #[error("server did not become reachable within {deadline_secs}s: {last}")]
    Timeout {
        /// Deadline the caller supplied, in seconds.
        deadline_secs: u64,
        /// Description of the last failed attempt.
        last: String,
    },
}

/// Probes a machine until it accepts remote commands or a deadline elapses.
#[derive(Clone, Debug)]
pub struct Prober {
    ssh: SshSettings,
    retry_delay: Duration,
}

impl Default for Prober {
    fn default() -> Self {
        Self {
            ssh: SshSettings::default(),
            retry_delay: RETRY_DELAY,
        }
    }
}

impl Prober {
    /// Overrides the SSH settings (port, binary, connect timeout).
    #[must_use]
    pub fn with_ssh_settings(mut self, ssh: SshSettings) -> Self {
        self.ssh = ssh;
        self
    }

    /// Overrides the fixed inter-attempt delay. Primarily for tests.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Attempts a single connect-and-noop probe.
    ///
    /// # Errors
    ///
    /// Returns [`SshError`] when the session cannot be opened or the no-op
    /// command fails.
    pub async fn check(&self, private_key: &str, address: &str) -> Result<(), SshError> {
        let mut client = SshClient::connect(&self.ssh, private_key, address).await?;
        let result = client.run_command(NOOP_COMMAND, pending()).await;
        client.close().ok();
        result
    }

    /// Retries [`Prober::check`] until it succeeds or `deadline` elapses.
    /// The deadline cancels the in-flight attempt; the attempt count is
    /// unbounded.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Timeout`] wrapping the last probe failure once
    /// the deadline is hit.
    pub async fn wait_reachable(
        &self,
        private_key: &str,
        address: &str,
        deadline: Duration,
    ) -> Result<(), ProbeError> {
        let started = Instant::now();
        let mut last = "no probe attempt completed".to_owned();

        loop {
            let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
                return Err(timeout_error(deadline, last));
            };

            match timeout(remaining, self.check(private_key, address)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => {
                    let remaining_after = deadline
                        .checked_sub(started.elapsed())
                        .unwrap_or(Duration::ZERO);
                    warn!(
                        error = %err,
                        remaining_secs = remaining_after.as_secs(),
                        "server not ready yet, retrying"
                    );
                    last = err.to_string();
                }
                Err(_elapsed) => return Err(timeout_error(deadline, last)),
            }

            let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
                return Err(timeout_error(deadline, last));
            };
            if remaining <= self.retry_delay {
                sleep(remaining).await;
                return Err(timeout_error(deadline, last));
            }
            sleep(self.retry_delay).await;
        }
    }
}

fn timeout_error(deadline: Duration, last: String) -> ProbeError {
    ProbeError::Timeout {
        deadline_secs: deadline.as_secs(),
        last,
    }
}
