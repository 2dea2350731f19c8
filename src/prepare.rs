//! The provisioning pipeline behind the prepare stage.
//!
//! Ordering: generate keys → register key → build labels → resolve server
//! type → resolve image → render boot configuration → create machine → wait
//! for reachability → persist state. Every failure aborts and propagates.
//! The registered key is deleted on every failure path after registration;
//! on success its ownership passes to the created machine. A created machine
//! is never deleted here — cleanup is the caller's explicit stage, so a
//! failed wait can leave a billable machine behind.

use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::cloud_init::{render_user_data, split_authorized_keys};
use crate::keys::{KeyError, KeyPair};
use crate::labels::build_labels;
use crate::naming::ResourceNamer;
use crate::probe::{ProbeError, Prober};
use crate::provider::{CloudProvider, CreateMachine, ProviderError, ServerTypeCandidate, SshKeyRef};
use crate::select::{
    AUTO_SERVER_TYPE, SelectError, architecture_tag, auto_server_type, label_expression,
    select_image,
};
use crate::state::{MachineState, StateError, StateStore};

/// Requested machine shape. `server_type` may be the sentinel `auto`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmParams {
    /// Image selector (exact name, `<prefix>:latest`, or `label#<expr>`).
    pub image: String,
    /// Server-type name or `auto`.
    pub server_type: String,
    /// Target location.
    pub location: String,
    /// Architecture tag (`amd64` or `arm64`), used by automatic selection.
    pub architecture: String,
}

/// Per-invocation options for the prepare stage.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrepareOptions {
    /// Job identifier the resource name derives from.
    pub job_id: String,
    /// Deadline for the machine to become reachable.
    pub wait_deadline: Duration,
    /// Newline-delimited extra public keys for the boot configuration.
    pub additional_authorized_keys: String,
}

/// Errors raised by the provisioning pipeline.
#[derive(Debug, Error)]
pub enum PrepareError {
    /// Key generation failed.
    #[error(transparent)]
    Key(#[from] KeyError),
    /// A provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Image or server-type selection failed.
    #[error(transparent)]
    Select(#[from] SelectError),
    /// The provider accepted the creation request but reported no machine.
    #[error("machine creation reported no machine object")]
    ProvisioningFailed,
    /// The created machine carries no public IPv4 address.
    #[error("created machine has no public IPv4 address")]
    MissingAddress,
    /// The machine never became reachable within the deadline.
    #[error(transparent)]
    Unreachable(#[from] ProbeError),
    /// Persisting the state file failed; the machine is alive regardless.
    #[error("machine is provisioned but its state could not be persisted: {0}")]
    State(#[from] StateError),
}

/// Orchestrates the prepare stage against one provider.
pub struct Prepare<'a, P: CloudProvider + ?Sized> {
    provider: &'a P,
    namer: &'a ResourceNamer,
    store: &'a StateStore,
    prober: Prober,
}

impl<'a, P: CloudProvider + ?Sized> Prepare<'a, P> {
    /// Creates the orchestrator with default probing behaviour.
    #[must_use]
    pub fn new(provider: &'a P, namer: &'a ResourceNamer, store: &'a StateStore) -> Self {
        Self {
            provider,
            namer,
            store,
            prober: Prober::default(),
        }
    }

    /// Overrides the reachability prober. Primarily for tests.
    #[must_use]
    pub fn with_prober(mut self, prober: Prober) -> Self {
        self.prober = prober;
        self
    }

    /// Runs the full provisioning pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`PrepareError`] when any step fails. The registered SSH key
    /// is rolled back on failure; an already-created machine is not.
    pub async fn run(
        &self,
        options: &PrepareOptions,
        params: &VmParams,
    ) -> Result<(), PrepareError> {
        let keys = KeyPair::generate()?;
        info!(fingerprint = %keys.fingerprint, "created SSH key pair");

        let name = self.namer.name(&options.job_id);
        let registered = self
            .provider
            .create_ssh_key(&name, &keys.public_key, &crate::labels::managed_by_labels())
            .await?;

        match self.provision(&keys, &registered, options, params).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // Best-effort rollback; the original error is what surfaces.
                if let Err(delete_err) = self.provider.delete_ssh_key(registered.id).await {
                    warn!(
                        key = %registered.name,
                        error = %delete_err,
                        "failed to roll back registered SSH key"
                    );
                }
                Err(err)
            }
        }
    }

    async fn provision(
        &self,
        keys: &KeyPair,
        registered: &SshKeyRef,
        options: &PrepareOptions,
        params: &VmParams,
    ) -> Result<(), PrepareError> {
        let labels = build_labels();
        let server_type = self.resolve_server_type(params).await?;
        let tag = architecture_tag(&server_type.architecture);

        let images = self
            .provider
            .list_images(&server_type.architecture, label_expression(&params.image))
            .await?;
        let image = select_image(images, &params.image)?;
        info!(
            server_type = %server_type.description,
            architecture = tag,
            image = %image_display_name(&image.name, image.id),
            "creating CI machine"
        );

        let authorized_keys = split_authorized_keys(&options.additional_authorized_keys);
        let user_data = render_user_data(&authorized_keys, tag);

        let created = self
            .provider
            .create_server(&CreateMachine {
                name: registered.name.clone(),
                server_type: server_type.name,
                image_id: image.id,
                ssh_key: registered.name.clone(),
                labels,
                location: params.location.clone(),
                user_data,
            })
            .await?
            .ok_or(PrepareError::ProvisioningFailed)?;

        let address = created.ipv4.ok_or(PrepareError::MissingAddress)?.to_string();
        info!(
            deadline_secs = options.wait_deadline.as_secs(),
            address, "waiting for machine to become reachable"
        );
        if let Err(err) = self
            .prober
            .wait_reachable(&keys.private_key, &address, options.wait_deadline)
            .await
        {
            error!("machine was created but never became reachable; run cleanup to remove it");
            return Err(err.into());
        }

        self.store.write(&MachineState {
            server_address: address,
            ssh_private_key: keys.private_key.clone(),
        })?;
        info!("machine ready");
        Ok(())
    }

    async fn resolve_server_type(
        &self,
        params: &VmParams,
    ) -> Result<ServerTypeCandidate, PrepareError> {
        if params.server_type == AUTO_SERVER_TYPE {
            return Ok(
                auto_server_type(self.provider, &params.architecture, &params.location).await?,
            );
        }
        self.provider
            .server_type_by_name(&params.server_type)
            .await?
            .ok_or_else(|| SelectError::ServerTypeNotFound(params.server_type.clone()).into())
    }
}

fn image_display_name(name: &str, id: i64) -> String {
    if name.is_empty() {
        format!("id={id}")
    } else {
        name.to_owned()
    }
}
