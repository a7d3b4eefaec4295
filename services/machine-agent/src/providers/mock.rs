//! In-memory providers for tests and development.
//!
//! Every mock counts its calls and can be scripted to fail, so tests can
//! assert on exactly which side effects a controller performed.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use kiln_id::{InterfaceId, MachineId, VolumeId};
use tracing::{debug, info};

use super::{
    GuestEventClient, GuestEventStream, ImageProvider, NetworkProvider, PersistenceClient,
    PersistenceError, ProviderError, Providers, RuntimeProvider, VolumeProvider,
};
use crate::event::MachineEvent;
use crate::machine::{GuestEvent, Image, Machine, MachineField, NetworkInterface, Volume};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Takes one unit from a "fail the next N calls" budget.
fn take_failure(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// =============================================================================
// Network
// =============================================================================

/// Hands out addresses from `10.0.0.0/8` without touching the host.
#[derive(Debug, Default)]
pub struct MockNetwork {
    next: AtomicU32,
    allocated: AtomicU64,
    released: AtomicU64,
    live: Mutex<HashSet<InterfaceId>>,
    fail_allocations: AtomicU32,
    capacity: Option<usize>,
    release_delay: Option<Duration>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A network that refuses to hold more than `capacity` live interfaces.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// A network whose `release_interface` takes `delay`, for holding a
    /// teardown in flight.
    pub fn with_release_delay(delay: Duration) -> Self {
        Self {
            release_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Fail the next `n` allocations.
    pub fn fail_allocations(&self, n: u32) {
        self.fail_allocations.store(n, Ordering::SeqCst);
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// Interfaces allocated and not yet released.
    pub fn live(&self) -> usize {
        lock(&self.live).len()
    }
}

#[async_trait]
impl NetworkProvider for MockNetwork {
    async fn allocate_interface(
        &self,
        machine_id: MachineId,
    ) -> Result<NetworkInterface, ProviderError> {
        if take_failure(&self.fail_allocations) {
            return Err(ProviderError::Network("mock network configured to fail".into()));
        }

        let mut live = lock(&self.live);
        if self.capacity.is_some_and(|capacity| live.len() >= capacity) {
            return Err(ProviderError::NoCapacity("mock network exhausted".into()));
        }

        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let base = u32::from(Ipv4Addr::new(10, 0, 0, 0)) + n * 4;
        let interface = NetworkInterface {
            id: InterfaceId::new(),
            tap_name: format!("mock{n}"),
            mac: format!("06:00:00:00:{:02x}:{:02x}", (n >> 8) & 0xff, n & 0xff),
            address: Ipv4Addr::from(base + 2),
            gateway: Ipv4Addr::from(base + 1),
            prefix_len: 30,
        };
        live.insert(interface.id);
        self.allocated.fetch_add(1, Ordering::SeqCst);

        debug!(machine_id = %machine_id, tap = %interface.tap_name, "[MOCK] Interface allocated");
        Ok(interface)
    }

    async fn release_interface(&self, interface: &NetworkInterface) -> Result<(), ProviderError> {
        if let Some(delay) = self.release_delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.live).remove(&interface.id);
        self.released.fetch_add(1, Ordering::SeqCst);
        debug!(tap = %interface.tap_name, "[MOCK] Interface released");
        Ok(())
    }
}

// =============================================================================
// Volumes
// =============================================================================

#[derive(Debug, Default)]
pub struct MockVolumes {
    created: AtomicU64,
    deleted: AtomicU64,
    live: Mutex<HashSet<VolumeId>>,
    fail_creates: AtomicU32,
}

impl MockVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` creates.
    pub fn fail_creates(&self, n: u32) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        lock(&self.live).len()
    }
}

#[async_trait]
impl VolumeProvider for MockVolumes {
    async fn create(&self, size_mib: u64, source: Option<&Volume>) -> Result<Volume, ProviderError> {
        if take_failure(&self.fail_creates) {
            return Err(ProviderError::Volume("mock volumes configured to fail".into()));
        }

        let id = VolumeId::new();
        let volume = Volume {
            id,
            size_mib,
            source: source.map(|s| s.id),
            path: PathBuf::from(format!("/mock/volumes/{}.ext4", id.suffix())),
        };
        lock(&self.live).insert(id);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(volume)
    }

    async fn delete(&self, volume: &Volume) -> Result<(), ProviderError> {
        lock(&self.live).remove(&volume.id);
        self.deleted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Images
// =============================================================================

/// Resolves every reference except the ones marked missing.
#[derive(Debug, Default)]
pub struct MockImages {
    fetched: AtomicU64,
    missing: Mutex<HashSet<String>>,
}

impl MockImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_missing(&self, reference: impl Into<String>) {
        lock(&self.missing).insert(reference.into());
    }

    pub fn fetched(&self) -> u64 {
        self.fetched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageProvider for MockImages {
    async fn fetch(&self, reference: &str) -> Result<Image, ProviderError> {
        if lock(&self.missing).contains(reference) {
            return Err(ProviderError::ImageNotFound(reference.to_string()));
        }
        self.fetched.fetch_add(1, Ordering::SeqCst);

        let id = VolumeId::new();
        Ok(Image {
            reference: reference.to_string(),
            digest: format!("sha256:{:064x}", reference.len()),
            rootfs: Volume {
                id,
                size_mib: 64,
                source: None,
                path: PathBuf::from(format!("/mock/images/{}.ext4", id.suffix())),
            },
        })
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// A runtime call, as recorded by [`MockRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeCall {
    Create(MachineId),
    Boot(MachineId),
    Terminate(MachineId),
    Healthcheck(MachineId),
}

/// Mock hypervisor. VMs "exist" between `create` and `terminate`.
#[derive(Debug, Default)]
pub struct MockRuntime {
    pid_counter: AtomicU32,
    vms: Mutex<HashMap<MachineId, u32>>,
    calls: Mutex<Vec<RuntimeCall>>,
    fail_creates: AtomicU32,
    fail_healthchecks: AtomicU32,
    unhealthy: AtomicBool,
    create_delay: Option<Duration>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runtime whose `create` takes `delay`, for exercising cancellation
    /// while a provider call is in flight.
    pub fn with_create_delay(delay: Duration) -> Self {
        Self {
            create_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Fail the next `n` creates.
    pub fn fail_creates(&self, n: u32) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` healthchecks.
    pub fn fail_healthchecks(&self, n: u32) {
        self.fail_healthchecks.store(n, Ordering::SeqCst);
    }

    /// Fail every healthcheck until set back to healthy.
    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        lock(&self.calls).clone()
    }

    fn count(&self, pred: impl Fn(&RuntimeCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| pred(c)).count()
    }

    pub fn creates(&self) -> usize {
        self.count(|c| matches!(c, RuntimeCall::Create(_)))
    }

    pub fn boots(&self) -> usize {
        self.count(|c| matches!(c, RuntimeCall::Boot(_)))
    }

    pub fn terminates(&self) -> usize {
        self.count(|c| matches!(c, RuntimeCall::Terminate(_)))
    }

    pub fn healthchecks(&self) -> usize {
        self.count(|c| matches!(c, RuntimeCall::Healthcheck(_)))
    }

    pub fn is_running(&self, machine_id: MachineId) -> bool {
        lock(&self.vms).contains_key(&machine_id)
    }

    fn record(&self, call: RuntimeCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl RuntimeProvider for MockRuntime {
    async fn create(&self, machine: &Machine) -> Result<u32, ProviderError> {
        self.record(RuntimeCall::Create(machine.id));

        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }

        if take_failure(&self.fail_creates) {
            return Err(ProviderError::Runtime("mock runtime configured to fail".into()));
        }

        let pid = 10_000 + self.pid_counter.fetch_add(1, Ordering::SeqCst);
        lock(&self.vms).insert(machine.id, pid);

        info!(
            machine_id = %machine.id,
            vcpus = machine.spec.vcpus,
            memory_mib = machine.spec.memory_mib,
            pid,
            "[MOCK] VM created"
        );
        Ok(pid)
    }

    async fn boot(&self, machine_id: MachineId) -> Result<(), ProviderError> {
        self.record(RuntimeCall::Boot(machine_id));
        if !self.is_running(machine_id) {
            return Err(ProviderError::Runtime(format!("no VM for {machine_id}")));
        }
        debug!(machine_id = %machine_id, "[MOCK] VM booted");
        Ok(())
    }

    async fn terminate(&self, machine_id: MachineId) -> Result<(), ProviderError> {
        self.record(RuntimeCall::Terminate(machine_id));
        lock(&self.vms).remove(&machine_id);
        debug!(machine_id = %machine_id, "[MOCK] VM terminated");
        Ok(())
    }

    async fn healthcheck(&self, machine_id: MachineId) -> Result<(), ProviderError> {
        self.record(RuntimeCall::Healthcheck(machine_id));

        if !self.is_running(machine_id) {
            return Err(ProviderError::Guest(format!("no VM for {machine_id}")));
        }
        if take_failure(&self.fail_healthchecks) || self.unhealthy.load(Ordering::SeqCst) {
            return Err(ProviderError::Guest("healthcheck timed out".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Guest events
// =============================================================================

type GuestSender = mpsc::UnboundedSender<Result<GuestEvent, ProviderError>>;

/// Guest event streams fed by the test.
#[derive(Debug, Default)]
pub struct MockGuestEvents {
    streams: Mutex<HashMap<MachineId, GuestSender>>,
    subscriptions: AtomicU64,
    fail_subscribes: AtomicU32,
}

impl MockGuestEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` subscribe attempts.
    pub fn fail_subscribes(&self, n: u32) {
        self.fail_subscribes.store(n, Ordering::SeqCst);
    }

    /// Number of successful subscriptions so far.
    pub fn subscriptions(&self) -> u64 {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self, machine_id: MachineId) -> bool {
        lock(&self.streams)
            .get(&machine_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Deliver an event on the machine's open stream. Returns false if no
    /// stream is open.
    pub fn emit(&self, machine_id: MachineId, event: GuestEvent) -> bool {
        lock(&self.streams)
            .get(&machine_id)
            .is_some_and(|tx| tx.unbounded_send(Ok(event)).is_ok())
    }

    /// Yield an error on the open stream, then close it.
    pub fn fail(&self, machine_id: MachineId, error: ProviderError) -> bool {
        match lock(&self.streams).remove(&machine_id) {
            Some(tx) => tx.unbounded_send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// End the open stream.
    pub fn disconnect(&self, machine_id: MachineId) -> bool {
        lock(&self.streams).remove(&machine_id).is_some()
    }
}

#[async_trait]
impl GuestEventClient for MockGuestEvents {
    async fn subscribe(&self, machine_id: MachineId) -> Result<GuestEventStream, ProviderError> {
        if take_failure(&self.fail_subscribes) {
            return Err(ProviderError::Guest("connection refused".into()));
        }

        let (tx, rx) = mpsc::unbounded();
        lock(&self.streams).insert(machine_id, tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(rx.boxed())
    }
}

// =============================================================================
// Persistence
// =============================================================================

/// Keeps machines and their event log in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    machines: Mutex<HashMap<MachineId, Machine>>,
    events: Mutex<Vec<(MachineId, MachineEvent)>>,
    saves: AtomicU64,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every save fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Seed a record, as if written by an earlier agent run.
    pub fn insert(&self, machine: Machine) {
        lock(&self.machines).insert(machine.id, machine);
    }

    pub fn machine(&self, machine_id: MachineId) -> Option<Machine> {
        lock(&self.machines).get(&machine_id).cloned()
    }

    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn events_for(&self, machine_id: MachineId) -> Vec<MachineEvent> {
        lock(&self.events)
            .iter()
            .filter(|(id, _)| *id == machine_id)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

#[async_trait]
impl PersistenceClient for MemoryStore {
    async fn save(
        &self,
        machine: &Machine,
        _changed: &[MachineField],
    ) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Storage("memory store configured to fail".into()));
        }
        lock(&self.machines).insert(machine.id, machine.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_machines(&self) -> Result<Vec<Machine>, PersistenceError> {
        let mut machines: Vec<_> = lock(&self.machines).values().cloned().collect();
        machines.sort_by_key(|m| m.created_at);
        Ok(machines)
    }

    async fn append_event(
        &self,
        machine_id: MachineId,
        event: &MachineEvent,
    ) -> Result<(), PersistenceError> {
        lock(&self.events).push((machine_id, event.clone()));
        Ok(())
    }
}

// =============================================================================
// Bundle
// =============================================================================

/// One of every mock, sharing nothing.
#[derive(Debug, Clone, Default)]
pub struct MockProviders {
    pub network: Arc<MockNetwork>,
    pub volumes: Arc<MockVolumes>,
    pub images: Arc<MockImages>,
    pub runtime: Arc<MockRuntime>,
    pub guest_events: Arc<MockGuestEvents>,
    pub store: Arc<MemoryStore>,
}

impl MockProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runtime(runtime: MockRuntime) -> Self {
        Self {
            runtime: Arc::new(runtime),
            ..Self::default()
        }
    }

    pub fn with_network(network: MockNetwork) -> Self {
        Self {
            network: Arc::new(network),
            ..Self::default()
        }
    }

    pub fn providers(&self) -> Providers {
        Providers {
            network: self.network.clone(),
            volumes: self.volumes.clone(),
            images: self.images.clone(),
            runtime: self.runtime.clone(),
            guest_events: Some(self.guest_events.clone()),
            persistence: self.store.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{ContainerState, MachineSpec};
    use kiln_id::ContainerId;
    use kiln_reconcile::DesiredState;

    fn machine() -> Machine {
        Machine::new(
            MachineId::new(),
            MachineSpec {
                vcpus: 1,
                memory_mib: 128,
                containers: vec![],
            },
            DesiredState::Running,
        )
    }

    #[tokio::test]
    async fn test_mock_network_capacity() {
        let network = MockNetwork::with_capacity(1);
        let nic = network.allocate_interface(MachineId::new()).await.unwrap();
        assert_eq!(nic.prefix_len, 30);
        assert!(matches!(
            network.allocate_interface(MachineId::new()).await,
            Err(ProviderError::NoCapacity(_))
        ));

        network.release_interface(&nic).await.unwrap();
        assert_eq!(network.live(), 0);
        network.allocate_interface(MachineId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_runtime_scripted_failures() {
        let runtime = MockRuntime::new();
        let machine = machine();

        runtime.fail_creates(2);
        assert!(runtime.create(&machine).await.is_err());
        assert!(runtime.create(&machine).await.is_err());
        let pid = runtime.create(&machine).await.unwrap();
        assert!(pid >= 10_000);
        assert_eq!(runtime.creates(), 3);

        runtime.boot(machine.id).await.unwrap();
        runtime.healthcheck(machine.id).await.unwrap();
        runtime.set_healthy(false);
        assert!(runtime.healthcheck(machine.id).await.is_err());

        runtime.terminate(machine.id).await.unwrap();
        assert!(!runtime.is_running(machine.id));
    }

    #[tokio::test]
    async fn test_mock_guest_events_stream() {
        let guest = MockGuestEvents::new();
        let id = MachineId::new();
        let mut stream = guest.subscribe(id).await.unwrap();

        let event = GuestEvent {
            container_id: ContainerId::new(),
            state: ContainerState::Running,
            exit_code: None,
        };
        assert!(guest.emit(id, event.clone()));
        assert_eq!(stream.next().await, Some(Ok(event)));

        assert!(guest.disconnect(id));
        assert_eq!(stream.next().await, None);
        assert!(!guest.is_connected(id));
    }

    #[tokio::test]
    async fn test_memory_store_failing_save() {
        let store = MemoryStore::new();
        let machine = machine();
        store.set_failing(true);
        assert!(store.save(&machine, &MachineField::ALL).await.is_err());
        store.set_failing(false);
        store.save(&machine, &MachineField::ALL).await.unwrap();
        assert_eq!(store.load_machines().await.unwrap(), vec![machine]);
    }
}
