//! The exec stage: stream a job script to the provisioned machine.
//!
//! By this point the machine has already proven reachable once, so the
//! liveness re-check and the connection attempts run on small bounded
//! budgets instead of the provisioning deadline.

use std::future::pending;
use std::time::Duration;

use camino::Utf8Path;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::ssh::{SshClient, SshError, SshSettings};
use crate::state::{StateError, StateStore};

const LIVENESS_ATTEMPTS: u32 = 20;
const LIVENESS_DELAY: Duration = Duration::from_secs(1);
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_DELAY: Duration = Duration::from_secs(10);

/// Trivial command proving the session still works.
const NOOP_COMMAND: &str = "true";

/// Errors raised by the exec stage.
#[derive(Debug, Error)]
pub enum ExecError {
    /// State file missing, corrupt, or unreadable.
    #[error(transparent)]
    State(#[from] StateError),
    /// State file parsed but lacks a required field.
    #[error("incomplete state: missing server address or private key")]
    IncompleteState,
    /// The machine stopped accepting sessions.
    #[error("machine is no longer reachable: {0}")]
    Unreachable(SshError),
    /// The script file could not be read.
    #[error("failed to read script {path}: {message}")]
    Script {
        /// Path passed by the orchestrator.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Remote execution failed or was cancelled.
    #[error(transparent)]
    Ssh(#[from] SshError),
}

/// Runs one job-stage script on the provisioned machine.
pub struct Exec<'a> {
    store: &'a StateStore,
    ssh: SshSettings,
    liveness_attempts: u32,
    liveness_delay: Duration,
    connect_attempts: u32,
    connect_delay: Duration,
}

impl<'a> Exec<'a> {
    /// Creates the stage with the default retry budgets.
    #[must_use]
    pub fn new(store: &'a StateStore) -> Self {
        Self {
            store,
            ssh: SshSettings::default(),
            liveness_attempts: LIVENESS_ATTEMPTS,
            liveness_delay: LIVENESS_DELAY,
            connect_attempts: CONNECT_ATTEMPTS,
            connect_delay: CONNECT_DELAY,
        }
    }

    /// Overrides the SSH settings. Primarily for tests.
    #[must_use]
    pub fn with_ssh_settings(mut self, ssh: SshSettings) -> Self {
        self.ssh = ssh;
        self
    }

    /// Overrides both retry budgets. Primarily for tests.
    #[must_use]
    pub const fn with_retry_budgets(
        mut self,
        liveness_attempts: u32,
        liveness_delay: Duration,
        connect_attempts: u32,
        connect_delay: Duration,
    ) -> Self {
        self.liveness_attempts = liveness_attempts;
        self.liveness_delay = liveness_delay;
        self.connect_attempts = connect_attempts;
        self.connect_delay = connect_delay;
        self
    }

    /// Streams the script at `script_path` to the machine as one remote
    /// command. `stage_name` is used for progress output only.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] when state is missing or incomplete, the
    /// machine is unreachable, or the remote command fails.
    pub async fn run(&self, script_path: &Utf8Path, stage_name: &str) -> Result<(), ExecError> {
        let state = self.store.read()?;
        if state.server_address.is_empty() || state.ssh_private_key.is_empty() {
            return Err(ExecError::IncompleteState);
        }

        self.recheck_liveness(&state.ssh_private_key, &state.server_address)
            .await?;

        let mut client = self
            .connect_with_retries(&state.ssh_private_key, &state.server_address)
            .await?;

        let script = std::fs::read_to_string(script_path).map_err(|err| ExecError::Script {
            path: script_path.to_string(),
            message: err.to_string(),
        })?;

        info!(stage = stage_name, "running job stage");
        let result = client.run_command(&script, pending()).await;
        client.close().ok();
        result.map_err(ExecError::from)
    }

    async fn recheck_liveness(&self, private_key: &str, address: &str) -> Result<(), ExecError> {
        let mut last = None;
        for attempt in 1..=self.liveness_attempts {
            match self.noop(private_key, address).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(attempt, error = %err, "liveness re-check failed, retrying");
                    last = Some(err);
                    if attempt < self.liveness_attempts {
                        sleep(self.liveness_delay).await;
                    }
                }
            }
        }
        Err(ExecError::Unreachable(last.unwrap_or(SshError::Terminated)))
    }

    async fn noop(&self, private_key: &str, address: &str) -> Result<(), SshError> {
        let mut client = SshClient::connect(&self.ssh, private_key, address).await?;
        let result = client.run_command(NOOP_COMMAND, pending()).await;
        client.close().ok();
        result
    }

    async fn connect_with_retries(
        &self,
        private_key: &str,
        address: &str,
    ) -> Result<SshClient, ExecError> {
        let mut last = None;
        for attempt in 1..=self.connect_attempts {
            match SshClient::connect(&self.ssh, private_key, address).await {
                Ok(client) => return Ok(client),
                Err(err) => {
                    warn!(attempt, error = %err, "failed to connect, retrying");
                    last = Some(err);
                    if attempt < self.connect_attempts {
                        sleep(self.connect_delay).await;
                    }
                }
            }
        }
        Err(ExecError::Unreachable(last.unwrap_or(SshError::Terminated)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MachineState;
    use camino::Utf8PathBuf;
    use std::os::unix::fs::PermissionsExt;
    use tokio::net::TcpListener;

    fn scratch_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().expect("scratch dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 path");
        let store = StateStore::open(&path).expect("open store");
        (dir, store)
    }

    fn stub_ssh(dir: &tempfile::TempDir, script: &str) -> String {
        let path = dir.path().join("fake-ssh");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).expect("write stub");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("mark stub executable");
        path.to_string_lossy().into_owned()
    }

    fn write_script(dir: &tempfile::TempDir, content: &str) -> Utf8PathBuf {
        let path = dir.path().join("stage.sh");
        std::fs::write(&path, content).expect("write script");
        Utf8PathBuf::from_path_buf(path).expect("utf-8 path")
    }

    #[tokio::test]
    async fn missing_state_is_not_found() {
        let (dir, store) = scratch_store();
        let script = write_script(&dir, "echo hi");
        let err = Exec::new(&store)
            .run(&script, "build")
            .await
            .expect_err("missing state must fail");
        assert!(matches!(err, ExecError::State(StateError::NotFound)), "got {err}");
    }

    #[tokio::test]
    async fn empty_state_fields_are_incomplete() {
        let (dir, store) = scratch_store();
        store
            .write(&MachineState {
                server_address: String::new(),
                ssh_private_key: "key".to_owned(),
            })
            .expect("write state");
        let script = write_script(&dir, "echo hi");
        let err = Exec::new(&store)
            .run(&script, "build")
            .await
            .expect_err("empty address must fail");
        assert!(matches!(err, ExecError::IncompleteState), "got {err}");
    }

    #[tokio::test]
    async fn streams_the_script_through_the_remote_shell() {
        let (dir, store) = scratch_store();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();
        store
            .write(&MachineState {
                server_address: "127.0.0.1".to_owned(),
                ssh_private_key: "key".to_owned(),
            })
            .expect("write state");
        let script = write_script(&dir, "exit 0");

        let exec = Exec::new(&store).with_ssh_settings(SshSettings {
            ssh_bin: stub_ssh(&dir, "exit 0"),
            port,
            ..SshSettings::default()
        });
        exec.run(&script, "build").await.expect("stage should succeed");
    }

    #[tokio::test]
    async fn remote_failure_surfaces_the_exit_status() {
        let (dir, store) = scratch_store();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();
        store
            .write(&MachineState {
                server_address: "127.0.0.1".to_owned(),
                ssh_private_key: "key".to_owned(),
            })
            .expect("write state");
        let script = write_script(&dir, "exit 3");

        // The stub fails the liveness no-op too, so shrink the budgets.
        let exec = Exec::new(&store)
            .with_ssh_settings(SshSettings {
                ssh_bin: stub_ssh(&dir, "exit 3"),
                port,
                ..SshSettings::default()
            })
            .with_retry_budgets(
                1,
                Duration::from_millis(10),
                1,
                Duration::from_millis(10),
            );
        let err = exec
            .run(&script, "build")
            .await
            .expect_err("failing no-op must surface");
        assert!(
            matches!(err, ExecError::Unreachable(SshError::CommandFailed(3))),
            "got {err}"
        );
    }

    #[tokio::test]
    async fn unreachable_machine_exhausts_the_bounded_budget() {
        let (dir, store) = scratch_store();
        store
            .write(&MachineState {
                server_address: "127.0.0.1".to_owned(),
                ssh_private_key: "key".to_owned(),
            })
            .expect("write state");
        let script = write_script(&dir, "echo hi");

        let started = std::time::Instant::now();
        let exec = Exec::new(&store)
            .with_ssh_settings(SshSettings {
                port: 1,
                connect_timeout: Duration::from_millis(50),
                ..SshSettings::default()
            })
            .with_retry_budgets(
                3,
                Duration::from_millis(20),
                1,
                Duration::from_millis(10),
            );
        let err = exec
            .run(&script, "build")
            .await
            .expect_err("closed port must exhaust the budget");
        assert!(matches!(err, ExecError::Unreachable(_)), "got {err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
