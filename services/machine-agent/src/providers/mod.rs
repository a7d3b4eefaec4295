//! Collaborators the controller drives.
//!
//! Each provider exposes a small async operation set. The controller treats
//! every [`ProviderError`] as retryable and never inspects it beyond logging.

pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kiln_id::MachineId;
use thiserror::Error;

use crate::event::MachineEvent;
use crate::machine::{GuestEvent, Image, Machine, MachineField, NetworkInterface, Volume};

/// Errors from resource providers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("no capacity: {0}")]
    NoCapacity(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("image pull failed: {0}")]
    PullFailed(String),

    #[error("volume operation failed: {0}")]
    Volume(String),

    #[error("network operation failed: {0}")]
    Network(String),

    #[error("runtime operation failed: {0}")]
    Runtime(String),

    #[error("guest communication failed: {0}")]
    Guest(String),
}

/// Errors from durable storage.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Allocates host network interfaces.
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    /// Allocate a tap device and address for the machine. Fails with
    /// [`ProviderError::NoCapacity`] when the address space is exhausted.
    async fn allocate_interface(&self, machine_id: MachineId)
        -> Result<NetworkInterface, ProviderError>;

    async fn release_interface(&self, interface: &NetworkInterface) -> Result<(), ProviderError>;
}

/// Creates and deletes block volumes.
#[async_trait]
pub trait VolumeProvider: Send + Sync {
    /// Create a volume, copying `source` into it when given.
    async fn create(&self, size_mib: u64, source: Option<&Volume>) -> Result<Volume, ProviderError>;

    async fn delete(&self, volume: &Volume) -> Result<(), ProviderError>;
}

/// Fetches images and prepares their root filesystems.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn fetch(&self, reference: &str) -> Result<Image, ProviderError>;
}

/// Drives the hypervisor.
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    /// Build the boot payload, start a hypervisor process and create the VM.
    /// Returns the hypervisor's pid.
    async fn create(&self, machine: &Machine) -> Result<u32, ProviderError>;

    async fn boot(&self, machine_id: MachineId) -> Result<(), ProviderError>;

    /// Stop and reap the hypervisor. Succeeds if none is running.
    async fn terminate(&self, machine_id: MachineId) -> Result<(), ProviderError>;

    /// One round trip to the guest init daemon.
    async fn healthcheck(&self, machine_id: MachineId) -> Result<(), ProviderError>;
}

/// Container lifecycle events from the guest init daemon.
pub type GuestEventStream = BoxStream<'static, Result<GuestEvent, ProviderError>>;

/// Opens event subscriptions against the guest init daemon.
#[async_trait]
pub trait GuestEventClient: Send + Sync {
    /// Open a new subscription. The stream ends or yields an error when the
    /// connection breaks; callers reconnect by subscribing again.
    async fn subscribe(&self, machine_id: MachineId) -> Result<GuestEventStream, ProviderError>;
}

/// Durable storage of machine records and their event log.
#[async_trait]
pub trait PersistenceClient: Send + Sync {
    /// Persist the machine. `changed` names the fields that moved since the
    /// last save; implementations may write the whole record regardless.
    async fn save(&self, machine: &Machine, changed: &[MachineField])
        -> Result<(), PersistenceError>;

    async fn load_machines(&self) -> Result<Vec<Machine>, PersistenceError>;

    async fn append_event(
        &self,
        machine_id: MachineId,
        event: &MachineEvent,
    ) -> Result<(), PersistenceError>;
}

/// The collaborators one controller works with.
#[derive(Clone)]
pub struct Providers {
    pub network: Arc<dyn NetworkProvider>,
    pub volumes: Arc<dyn VolumeProvider>,
    pub images: Arc<dyn ImageProvider>,
    pub runtime: Arc<dyn RuntimeProvider>,
    /// Required by the event-stream monitor only.
    pub guest_events: Option<Arc<dyn GuestEventClient>>,
    pub persistence: Arc<dyn PersistenceClient>,
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers")
            .field("guest_events", &self.guest_events.is_some())
            .finish_non_exhaustive()
    }
}
