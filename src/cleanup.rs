//! The cleanup stage: tear down the job's machine and local state.
//!
//! The machine is found by its derived resource name, never by a cached id,
//! so cleanup works even when the state file is gone. Deleting the machine
//! waits for the provider to confirm completion; the registered SSH key was
//! attached to the machine and goes with it.

use thiserror::Error;
use tracing::{info, warn};

use crate::naming::ResourceNamer;
use crate::provider::{CloudProvider, ProviderError};
use crate::state::{StateError, StateStore};

/// Errors raised by the cleanup stage.
#[derive(Debug, Error)]
pub enum CleanupError {
    /// No machine exists under the derived name.
    #[error("no machine named {0} exists")]
    MachineNotFound(String),
    /// A provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The state file could not be removed.
    #[error(transparent)]
    State(#[from] StateError),
}

/// Tears down the machine created for one job.
pub struct Cleanup<'a, P: CloudProvider + ?Sized> {
    provider: &'a P,
    namer: &'a ResourceNamer,
    store: &'a StateStore,
}

impl<'a, P: CloudProvider + ?Sized> Cleanup<'a, P> {
    /// Creates the stage.
    pub fn new(provider: &'a P, namer: &'a ResourceNamer, store: &'a StateStore) -> Self {
        Self {
            provider,
            namer,
            store,
        }
    }

    /// Deletes the job's machine, waiting for the provider to confirm the
    /// deletion completed, then removes the local state file. A missing
    /// state file is logged and tolerated; a missing machine is an error.
    ///
    /// # Errors
    ///
    /// Returns [`CleanupError`] when the machine cannot be found or deleted,
    /// or when removing an existing state file fails.
    pub async fn run(&self, job_id: &str) -> Result<(), CleanupError> {
        let name = self.namer.name(job_id);
        let machine = self
            .provider
            .server_by_name(&name)
            .await?
            .ok_or_else(|| CleanupError::MachineNotFound(name.clone()))?;

        info!(name, id = machine.id, "deleting machine");
        self.provider.delete_server(machine.id).await?;
        info!(name, "machine deleted");

        match self.store.delete() {
            Ok(()) => Ok(()),
            Err(StateError::NotFound) => {
                warn!("state file already absent, nothing to remove");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MachineRef;
    use crate::state::MachineState;
    use crate::test_support::FakeProvider;
    use camino::Utf8PathBuf;

    fn scratch_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().expect("scratch dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 path");
        let store = StateStore::open(&path).expect("open store");
        (dir, store)
    }

    fn namer() -> ResourceNamer {
        ResourceNamer::new("ci-job-").expect("valid prefix")
    }

    #[tokio::test]
    async fn deletes_the_machine_and_the_state_file() {
        let (_dir, store) = scratch_store();
        store
            .write(&MachineState {
                server_address: "192.0.2.10".to_owned(),
                ssh_private_key: "key".to_owned(),
            })
            .expect("write state");
        let provider = FakeProvider {
            existing_machine: Some(MachineRef {
                id: 4242,
                name: "ci-job-123456".to_owned(),
            }),
            ..FakeProvider::default()
        };
        let namer = namer();

        Cleanup::new(&provider, &namer, &store)
            .run("123456")
            .await
            .expect("cleanup should succeed");

        assert_eq!(
            provider.recorded_calls(),
            vec![
                "server_by_name:ci-job-123456".to_owned(),
                "delete_server:4242".to_owned(),
            ]
        );
        assert!(matches!(store.read(), Err(StateError::NotFound)));
    }

    #[tokio::test]
    async fn missing_machine_is_an_error() {
        let (_dir, store) = scratch_store();
        let provider = FakeProvider::default();
        let namer = namer();

        let err = Cleanup::new(&provider, &namer, &store)
            .run("123456")
            .await
            .expect_err("no machine must fail");
        assert!(
            matches!(err, CleanupError::MachineNotFound(ref name) if name == "ci-job-123456"),
            "got {err}"
        );
        assert_eq!(
            provider.recorded_calls(),
            vec!["server_by_name:ci-job-123456".to_owned()]
        );
    }

    #[tokio::test]
    async fn missing_state_file_is_tolerated() {
        let (_dir, store) = scratch_store();
        let provider = FakeProvider {
            existing_machine: Some(MachineRef {
                id: 7,
                name: "ci-job-99".to_owned(),
            }),
            ..FakeProvider::default()
        };
        let namer = namer();

        Cleanup::new(&provider, &namer, &store)
            .run("99")
            .await
            .expect("absent state file must not fail cleanup");
    }
}
