//! Core library for the machinist ephemeral build-machine tool.
//!
//! The crate manages the full lifecycle of short-lived CI build machines on
//! Hetzner Cloud: provision (create key + machine, wait for SSH readiness,
//! persist a hand-off state file), execute job-stage scripts over SSH, and
//! tear everything down again.

pub mod cleanup;
pub mod cloud_init;
pub mod exec;
pub mod hcloud;
pub mod keys;
pub mod labels;
pub mod naming;
pub mod prepare;
pub mod probe;
pub mod provider;
pub mod select;
pub mod ssh;
pub mod state;
#[cfg(test)]
pub mod test_support;

pub use cleanup::{Cleanup, CleanupError};
pub use exec::{Exec, ExecError};
pub use hcloud::HcloudClient;
pub use keys::{KeyError, KeyPair};
pub use naming::{NamingError, ResourceNamer};
pub use prepare::{Prepare, PrepareError, PrepareOptions, VmParams};
pub use probe::{ProbeError, Prober};
pub use provider::{CloudProvider, ProviderError};
pub use ssh::{SshClient, SshError, SshSettings};
pub use state::{MachineState, StateError, StateStore};
