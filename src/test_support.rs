//! In-memory provider fake shared by unit tests.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::provider::{
    CloudProvider, CreateMachine, CreatedMachine, DatacenterInfo, ImageCandidate, MachineRef,
    ProviderError, ServerTypeCandidate, SshKeyRef,
};

/// Canned provider whose responses come from plain fields and whose calls
/// are recorded in order.
#[derive(Debug, Default)]
pub struct FakeProvider {
    /// Datacenters returned by `list_datacenters`.
    pub datacenters: Vec<DatacenterInfo>,
    /// Server types resolvable by name or id.
    pub server_types: Vec<ServerTypeCandidate>,
    /// Images returned by `list_images`.
    pub images: Vec<ImageCandidate>,
    /// Result of `create_server`; `None` models a provider that accepted the
    /// request but reported no machine.
    pub created_machine: Option<CreatedMachine>,
    /// Machine visible to `server_by_name`.
    pub existing_machine: Option<MachineRef>,
    /// Ordered record of provider calls.
    pub calls: Mutex<Vec<String>>,
}

impl FakeProvider {
    fn record(&self, call: impl Into<String>) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call.into());
        }
    }

    /// Returns the recorded call names in order.
    pub fn recorded_calls(&self) -> Vec<String> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// Convenience constructor for a machine answer with an address.
    #[must_use]
    pub fn machine_at(id: i64, address: Ipv4Addr) -> CreatedMachine {
        CreatedMachine {
            id,
            ipv4: Some(address),
            created: None,
        }
    }
}

#[async_trait]
impl CloudProvider for FakeProvider {
    async fn list_datacenters(&self) -> Result<Vec<DatacenterInfo>, ProviderError> {
        self.record("list_datacenters");
        Ok(self.datacenters.clone())
    }

    async fn server_type_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ServerTypeCandidate>, ProviderError> {
        self.record(format!("server_type_by_name:{name}"));
        Ok(self
            .server_types
            .iter()
            .find(|server_type| server_type.name == name)
            .cloned())
    }

    async fn server_type_by_id(
        &self,
        id: i64,
    ) -> Result<Option<ServerTypeCandidate>, ProviderError> {
        self.record(format!("server_type_by_id:{id}"));
        Ok(self
            .server_types
            .iter()
            .find(|server_type| server_type.id == id)
            .cloned())
    }

    async fn list_images(
        &self,
        architecture: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<ImageCandidate>, ProviderError> {
        self.record(format!(
            "list_images:{architecture}:{}",
            label_selector.unwrap_or("-")
        ));
        Ok(self.images.clone())
    }

    async fn create_ssh_key(
        &self,
        name: &str,
        _public_key: &str,
        _labels: &HashMap<String, String>,
    ) -> Result<SshKeyRef, ProviderError> {
        self.record(format!("create_ssh_key:{name}"));
        Ok(SshKeyRef {
            id: 77,
            name: name.to_owned(),
        })
    }

    async fn delete_ssh_key(&self, id: i64) -> Result<(), ProviderError> {
        self.record(format!("delete_ssh_key:{id}"));
        Ok(())
    }

    async fn create_server(
        &self,
        params: &CreateMachine,
    ) -> Result<Option<CreatedMachine>, ProviderError> {
        self.record(format!("create_server:{}", params.name));
        Ok(self.created_machine.clone())
    }

    async fn server_by_name(&self, name: &str) -> Result<Option<MachineRef>, ProviderError> {
        self.record(format!("server_by_name:{name}"));
        Ok(self.existing_machine.clone())
    }

    async fn delete_server(&self, id: i64) -> Result<(), ProviderError> {
        self.record(format!("delete_server:{id}"));
        Ok(())
    }
}
