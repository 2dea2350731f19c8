//! Remote shell client backed by the system `ssh` binary.
//!
//! The machine is freshly created and has no prior host key, so host-key
//! verification is skipped. Connection establishment fails fast (sub-second
//! TCP probe) so the reachability prober can loop tightly. Remote commands
//! inherit this process's stdout/stderr, which is what streams build output
//! into the CI job log.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::process::Stdio;
use std::time::Duration;

use camino::Utf8PathBuf;
use tempfile::TempDir;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

/// SSH port the boot configuration moves sshd to on first boot.
pub const CUSTOM_SSH_PORT: u16 = 2222;

/// Administrative user the client authenticates as.
const SSH_USER: &str = "root";

/// File name for the staged private key inside the scratch directory.
const KEY_FILE: &str = "id_ecdsa";

/// Errors raised by the remote shell client.
#[derive(Debug, Error)]
pub enum SshError {
    /// The private key could not be staged on disk.
    #[error("failed to stage private key: {0}")]
    KeyFile(String),
    /// The TCP connection could not be established within the timeout.
    #[error("cannot connect to {address}:{port}: {message}")]
    Connect {
        /// Target host.
        address: String,
        /// Target port.
        port: u16,
        /// Underlying failure, or "timed out".
        message: String,
    },
    /// The `ssh` process could not be spawned or awaited.
    #[error("failed to run ssh: {0}")]
    Spawn(String),
    /// The remote command completed with a non-zero exit status.
    #[error("remote command exited with status {0}")]
    CommandFailed(i32),
    /// The `ssh` process was terminated without reporting an exit status.
    #[error("remote command terminated without an exit status")]
    Terminated,
    /// The caller's cancellation signal won the race against completion.
    #[error("remote command cancelled")]
    Cancelled,
}

/// Connection settings shared by the prober and the execution stage.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// Program used to open remote sessions; injectable for tests.
    pub ssh_bin: String,
    /// Remote SSH port.
    pub port: u16,
    /// Timeout for the TCP connection probe.
    pub connect_timeout: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_bin: "ssh".to_owned(),
            port: CUSTOM_SSH_PORT,
            connect_timeout: Duration::from_millis(500),
        }
    }
}

/// An authenticated remote session to a single machine.
#[derive(Debug)]
pub struct SshClient {
    settings: SshSettings,
    address: String,
    key_dir: Option<TempDir>,
    key_path: Utf8PathBuf,
}

impl SshClient {
    /// Stages the private key and verifies the host accepts TCP connections
    /// on the SSH port. Unreachable hosts fail within the connect timeout so
    /// callers can retry quickly.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::KeyFile`] when the key cannot be staged and
    /// [`SshError::Connect`] when the host is unreachable.
    pub async fn connect(
        settings: &SshSettings,
        private_key: &str,
        address: &str,
    ) -> Result<Self, SshError> {
        let key_dir = TempDir::new().map_err(|err| SshError::KeyFile(err.to_string()))?;
        let key_path = key_dir.path().join(KEY_FILE);
        std::fs::write(&key_path, private_key)
            .map_err(|err| SshError::KeyFile(err.to_string()))?;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
            .map_err(|err| SshError::KeyFile(err.to_string()))?;
        let key_path = Utf8PathBuf::from_path_buf(key_path)
            .map_err(|path| SshError::KeyFile(format!("non UTF-8 key path: {}", path.display())))?;

        let target = format!("{address}:{}", settings.port);
        match timeout(settings.connect_timeout, TcpStream::connect(&target)).await {
            Ok(Ok(_stream)) => {}
            Ok(Err(err)) => {
                return Err(SshError::Connect {
                    address: address.to_owned(),
                    port: settings.port,
                    message: err.to_string(),
                });
            }
            Err(_elapsed) => {
                return Err(SshError::Connect {
                    address: address.to_owned(),
                    port: settings.port,
                    message: "timed out".to_owned(),
                });
            }
        }

        Ok(Self {
            settings: settings.clone(),
            address: address.to_owned(),
            key_dir: Some(key_dir),
            key_path,
        })
    }

    /// Runs `command` in one remote session, racing completion against
    /// `cancel`. Output streams are inherited from this process. When the
    /// cancellation future completes first, the session is actively killed
    /// and [`SshError::Cancelled`] is returned.
    ///
    /// # Errors
    ///
    /// Returns [`SshError`] when the session cannot be spawned, the remote
    /// command fails, or the caller cancels.
    pub async fn run_command(
        &mut self,
        command: &str,
        cancel: impl Future<Output = ()>,
    ) -> Result<(), SshError> {
        let mut child = Command::new(&self.settings.ssh_bin)
            .args(self.session_args())
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| SshError::Spawn(err.to_string()))?;

        tokio::pin!(cancel);
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => status
                    .code()
                    .map_or(Err(SshError::Terminated), |code| Err(SshError::CommandFailed(code))),
                Err(err) => Err(SshError::Spawn(err.to_string())),
            },
            () = &mut cancel => {
                // The losing side is signalled, never merely dropped.
                child.start_kill().ok();
                if let Err(err) = child.wait().await {
                    warn!(error = %err, "failed to reap cancelled ssh session");
                }
                Err(SshError::Cancelled)
            }
        }
    }

    /// Releases the staged key material. Safe to call when no command ran.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::KeyFile`] when the scratch directory cannot be
    /// removed.
    pub fn close(mut self) -> Result<(), SshError> {
        match self.key_dir.take() {
            Some(dir) => dir.close().map_err(|err| SshError::KeyFile(err.to_string())),
            None => Ok(()),
        }
    }

    fn session_args(&self) -> Vec<String> {
        // ConnectTimeout has a one-second floor; the sub-second budget is
        // enforced by the TCP probe in connect().
        let connect_timeout_secs = self.settings.connect_timeout.as_secs().max(1);
        vec![
            "-p".to_owned(),
            self.settings.port.to_string(),
            "-i".to_owned(),
            self.key_path.to_string(),
            "-o".to_owned(),
            "StrictHostKeyChecking=no".to_owned(),
            "-o".to_owned(),
            "UserKnownHostsFile=/dev/null".to_owned(),
            "-o".to_owned(),
            "BatchMode=yes".to_owned(),
            "-o".to_owned(),
            format!("ConnectTimeout={connect_timeout_secs}"),
            "-l".to_owned(),
            SSH_USER.to_owned(),
            self.address.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    async fn local_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();
        (listener, port)
    }

    /// Writes an executable stub that stands in for the `ssh` binary.
    fn stub_ssh(dir: &tempfile::TempDir, script: &str) -> String {
        let path = dir.path().join("fake-ssh");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).expect("write stub");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("mark stub executable");
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn connect_fails_fast_on_closed_port() {
        let settings = SshSettings {
            port: 1, // closed on loopback
            ..SshSettings::default()
        };
        let started = std::time::Instant::now();
        let err = SshClient::connect(&settings, "key", "127.0.0.1")
            .await
            .expect_err("closed port should refuse");
        assert!(matches!(err, SshError::Connect { .. }), "got {err}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn run_command_reports_success_and_failure() {
        let (_listener, port) = local_listener().await;
        let scratch = tempfile::tempdir().expect("scratch dir");
        let settings = SshSettings {
            ssh_bin: stub_ssh(&scratch, "exit 0"),
            port,
            ..SshSettings::default()
        };

        let mut client = SshClient::connect(&settings, "key", "127.0.0.1")
            .await
            .expect("connect to local listener");
        client
            .run_command("true", pending())
            .await
            .expect("stub exits zero");

        let failing = SshSettings {
            ssh_bin: stub_ssh(&scratch, "exit 7"),
            ..settings
        };
        let mut failing_client = SshClient::connect(&failing, "key", "127.0.0.1")
            .await
            .expect("connect to local listener");
        let err = failing_client
            .run_command("true", pending())
            .await
            .expect_err("stub exits non-zero");
        assert!(matches!(err, SshError::CommandFailed(7)), "got {err}");

        client.close().expect("close after command");
        failing_client.close().expect("close after failure");
    }

    #[tokio::test]
    async fn cancellation_kills_the_session_and_close_still_works() {
        let (_listener, port) = local_listener().await;
        let scratch = tempfile::tempdir().expect("scratch dir");
        let settings = SshSettings {
            ssh_bin: stub_ssh(&scratch, "sleep 30"),
            port,
            ..SshSettings::default()
        };

        let mut client = SshClient::connect(&settings, "key", "127.0.0.1")
            .await
            .expect("connect to local listener");

        let started = std::time::Instant::now();
        let err = client
            .run_command("true", async {
                sleep(Duration::from_millis(100)).await;
            })
            .await
            .expect_err("cancellation should win");
        assert!(matches!(err, SshError::Cancelled), "got {err}");
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "cancellation must not wait for the sleeping session"
        );

        client.close().expect("close after cancellation");
    }

    #[tokio::test]
    async fn close_without_any_command_is_safe() {
        let (_listener, port) = local_listener().await;
        let settings = SshSettings {
            port,
            ..SshSettings::default()
        };
        let client = SshClient::connect(&settings, "key", "127.0.0.1")
            .await
            .expect("connect to local listener");
        client.close().expect("close without running a command");
    }
}
