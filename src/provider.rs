//! Interface boundary to the cloud provider's resource API.
//!
//! The catalog and mutation calls are consumed as an external collaborator;
//! stage logic only depends on this trait and the read-only candidate views,
//! which keeps selection deterministic and the pipeline mockable.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised by provider API calls.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// The request never produced an HTTP response.
    #[error("provider request failed: {0}")]
    Transport(String),
    /// The provider answered with an error status.
    #[error("provider returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Provider error message.
        message: String,
    },
    /// The response body could not be decoded.
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
}

/// Read-only view of a boot image offered by the catalog.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageCandidate {
    /// Provider identifier.
    pub id: i64,
    /// Image name; snapshots may carry none.
    pub name: String,
    /// Operating system version string, used by `:latest` selection.
    pub os_version: String,
    /// Creation timestamp, used by label selection.
    pub created: DateTime<Utc>,
    /// Labels attached to the image.
    pub labels: HashMap<String, String>,
}

/// Minimal reference to a selected image; all other fields are dropped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageRef {
    /// Provider identifier.
    pub id: i64,
    /// Image name (may be empty for snapshots).
    pub name: String,
}

/// Read-only view of a server-type offering.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerTypeCandidate {
    /// Provider identifier.
    pub id: i64,
    /// Offering name, e.g. `cx22`.
    pub name: String,
    /// Provider architecture string (`x86` or `arm`).
    pub architecture: String,
    /// CPU class (`shared` or `dedicated`).
    pub cpu_kind: String,
    /// Human-readable description.
    pub description: String,
}

/// A datacenter with its available server-type references.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DatacenterInfo {
    /// Datacenter name.
    pub name: String,
    /// Location the datacenter belongs to.
    pub location: String,
    /// Identifiers of server types currently available there.
    pub available_server_types: Vec<i64>,
}

/// Reference to a registered SSH key resource.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshKeyRef {
    /// Provider identifier.
    pub id: i64,
    /// Resource name the key was registered under.
    pub name: String,
}

/// Reference to an existing machine resource.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachineRef {
    /// Provider identifier.
    pub id: i64,
    /// Resource name.
    pub name: String,
}

/// Everything needed to create one machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateMachine {
    /// Resource name shared with the registered SSH key.
    pub name: String,
    /// Resolved server-type name.
    pub server_type: String,
    /// Resolved image identifier.
    pub image_id: i64,
    /// Name of the SSH key to inject.
    pub ssh_key: String,
    /// Labels to stamp onto the machine.
    pub labels: HashMap<String, String>,
    /// Requested location.
    pub location: String,
    /// Rendered first-boot configuration.
    pub user_data: String,
}

/// A machine the provider reports as created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreatedMachine {
    /// Provider identifier.
    pub id: i64,
    /// Public IPv4 address, when already assigned.
    pub ipv4: Option<Ipv4Addr>,
    /// Creation timestamp reported by the provider.
    pub created: Option<DateTime<Utc>>,
}

/// Synchronous request/response surface of the cloud provider. No call is
/// assumed idempotent beyond what the individual operation states.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Lists all datacenters with their available server types.
    async fn list_datacenters(&self) -> Result<Vec<DatacenterInfo>, ProviderError>;

    /// Looks a server type up by exact name.
    async fn server_type_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ServerTypeCandidate>, ProviderError>;

    /// Resolves a server-type reference to its full detail.
    async fn server_type_by_id(
        &self,
        id: i64,
    ) -> Result<Option<ServerTypeCandidate>, ProviderError>;

    /// Lists available images for an architecture, optionally filtered
    /// server-side by a label selector.
    async fn list_images(
        &self,
        architecture: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<ImageCandidate>, ProviderError>;

    /// Registers a public key under `name`.
    async fn create_ssh_key(
        &self,
        name: &str,
        public_key: &str,
        labels: &HashMap<String, String>,
    ) -> Result<SshKeyRef, ProviderError>;

    /// Deletes a registered SSH key.
    async fn delete_ssh_key(&self, id: i64) -> Result<(), ProviderError>;

    /// Creates a machine. Returns `None` when the provider accepted the
    /// request shape but reported no machine object.
    async fn create_server(
        &self,
        params: &CreateMachine,
    ) -> Result<Option<CreatedMachine>, ProviderError>;

    /// Looks a machine up by its resource name.
    async fn server_by_name(&self, name: &str) -> Result<Option<MachineRef>, ProviderError>;

    /// Deletes a machine and waits for the provider to confirm completion,
    /// not merely request acceptance.
    async fn delete_server(&self, id: i64) -> Result<(), ProviderError>;
}
