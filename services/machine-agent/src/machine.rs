//! The machine aggregate and the resources bound to it.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use kiln_id::{ContainerId, InterfaceId, MachineId, VolumeId};
use kiln_reconcile::{DesiredState, MachineState};
use serde::{Deserialize, Serialize};

/// A container to run inside the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub id: ContainerId,
    pub name: String,
    /// OCI image reference.
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Size of the container's root volume.
    pub volume_size_mib: u64,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>, volume_size_mib: u64) -> Self {
        Self {
            id: ContainerId::new(),
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            env: BTreeMap::new(),
            volume_size_mib,
        }
    }
}

/// Immutable resource request for a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub vcpus: u8,
    pub memory_mib: u32,
    pub containers: Vec<ContainerSpec>,
}

/// Host-side network resources allocated to a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub id: InterfaceId,
    /// TAP device name on the host.
    pub tap_name: String,
    pub mac: String,
    /// Guest address.
    pub address: Ipv4Addr,
    /// Host side of the link, the guest's default route.
    pub gateway: Ipv4Addr,
    pub prefix_len: u8,
}

/// A block volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub size_mib: u64,
    /// Volume this one was copied from, if any.
    pub source: Option<VolumeId>,
    pub path: PathBuf,
}

/// Binds one volume to the container that boots from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub container_id: ContainerId,
    pub volume: Volume,
}

/// A fetched image with its prepared root filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub reference: String,
    pub digest: String,
    pub rootfs: Volume,
}

/// Lifecycle state of a container as reported by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Failed,
}

/// A container lifecycle event read from the guest init daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestEvent {
    pub container_id: ContainerId,
    pub state: ContainerState,
    pub exit_code: Option<i32>,
}

/// Fields of [`Machine`] that change after creation, reported to
/// persistence with every save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineField {
    State,
    DesiredState,
    RuntimePid,
    NetworkInterface,
    Volumes,
}

impl MachineField {
    pub const ALL: [MachineField; 5] = [
        MachineField::State,
        MachineField::DesiredState,
        MachineField::RuntimePid,
        MachineField::NetworkInterface,
        MachineField::Volumes,
    ];
}

/// The managed unit: one microVM and its containers.
///
/// Only the machine's controller mutates this; everyone else works with
/// clones handed out by `MachineController::get_machine`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub state: MachineState,
    pub desired_state: DesiredState,
    pub spec: MachineSpec,
    /// Hypervisor process, present once one has been created.
    pub runtime_pid: Option<u32>,
    pub network_interface: Option<NetworkInterface>,
    /// One binding per container, in container order once fully prepared.
    #[serde(default)]
    pub volumes: Vec<VolumeBinding>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Machine {
    /// A new machine in `Pending`.
    pub fn new(id: MachineId, spec: MachineSpec, desired_state: DesiredState) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: MachineState::Pending,
            desired_state,
            spec,
            runtime_pid: None,
            network_interface: None,
            volumes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn containers(&self) -> &[ContainerSpec] {
        &self.spec.containers
    }

    pub fn volume_for(&self, container_id: ContainerId) -> Option<&VolumeBinding> {
        self.volumes.iter().find(|b| b.container_id == container_id)
    }

    /// Every container has a volume and a network interface is allocated.
    pub fn is_prepared(&self) -> bool {
        self.network_interface.is_some()
            && self
                .containers()
                .iter()
                .all(|c| self.volume_for(c.id).is_some())
    }

    pub fn is_converged(&self) -> bool {
        kiln_reconcile::matches(self.state, self.desired_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> MachineSpec {
        MachineSpec {
            vcpus: 2,
            memory_mib: 512,
            containers: vec![
                ContainerSpec::new("web", "docker.io/library/nginx:1.27", 256),
                ContainerSpec::new("sidecar", "docker.io/library/busybox:1.36", 64),
            ],
        }
    }

    #[test]
    fn test_new_machine_is_pending_and_unprepared() {
        let machine = Machine::new(MachineId::new(), spec(), DesiredState::Running);
        assert_eq!(machine.state, MachineState::Pending);
        assert!(machine.runtime_pid.is_none());
        assert!(!machine.is_prepared());
        assert!(!machine.is_converged());
    }

    #[test]
    fn test_prepared_needs_every_container_volume() {
        let mut machine = Machine::new(MachineId::new(), spec(), DesiredState::Pending);
        machine.network_interface = Some(NetworkInterface {
            id: InterfaceId::new(),
            tap_name: "kt-test".to_string(),
            mac: "06:00:0a:00:00:02".to_string(),
            address: Ipv4Addr::new(10, 0, 0, 2),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            prefix_len: 30,
        });

        let first = machine.containers()[0].id;
        machine.volumes.push(VolumeBinding {
            container_id: first,
            volume: Volume {
                id: VolumeId::new(),
                size_mib: 256,
                source: None,
                path: PathBuf::from("/tmp/web.ext4"),
            },
        });
        assert!(!machine.is_prepared());
        assert!(machine.volume_for(first).is_some());

        let second = machine.containers()[1].id;
        machine.volumes.push(VolumeBinding {
            container_id: second,
            volume: Volume {
                id: VolumeId::new(),
                size_mib: 64,
                source: None,
                path: PathBuf::from("/tmp/sidecar.ext4"),
            },
        });
        assert!(machine.is_prepared());
    }

    #[test]
    fn test_machine_json_roundtrip() {
        let machine = Machine::new(MachineId::new(), spec(), DesiredState::Running);
        let json = serde_json::to_string(&machine).unwrap();
        assert!(json.contains("\"state\":\"pending\""));
        let parsed: Machine = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, machine);
    }
}
