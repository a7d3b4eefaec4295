//! Host networking for machines.
//!
//! [`TapNetworkProvider`] gives every machine a dedicated TAP device and a
//! /30 link carved out of a configured IPv4 subnet.

mod pool;
mod tap;

pub use pool::{AddressPool, Lease, LINK_PREFIX_LEN};
pub use tap::{create_tap, delete_tap, tap_exists, tap_name, TapConfig};

use std::net::Ipv4Addr;

use async_trait::async_trait;
use kiln_id::{InterfaceId, MachineId};
use thiserror::Error;
use tracing::warn;

use crate::machine::NetworkInterface;
use crate::providers::{NetworkProvider, ProviderError};

/// Errors from host network setup.
#[derive(Debug, Error)]
pub enum TapError {
    #[error("failed to create TAP device: {0}")]
    CreateFailed(String),

    #[error("failed to configure TAP device: {0}")]
    ConfigFailed(String),

    #[error("failed to delete TAP device: {0}")]
    DeleteFailed(String),

    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),
}

/// Locally administered MAC derived from the guest address, so the guest's
/// MAC and IP can be read off each other.
pub fn mac_for(address: Ipv4Addr) -> String {
    let [a, b, c, d] = address.octets();
    format!("06:00:{a:02x}:{b:02x}:{c:02x}:{d:02x}")
}

/// Network provider backed by real TAP devices.
#[derive(Debug)]
pub struct TapNetworkProvider {
    pool: AddressPool,
    mtu: u32,
}

impl TapNetworkProvider {
    pub fn new(subnet: &str, mtu: u32) -> Result<Self, TapError> {
        Ok(Self {
            pool: AddressPool::from_cidr(subnet)?,
            mtu,
        })
    }

    /// Mark addresses of interfaces restored from persisted state as taken.
    pub fn restore<'a>(&self, interfaces: impl IntoIterator<Item = &'a NetworkInterface>) {
        for interface in interfaces {
            if !self.pool.reserve(interface.address) {
                warn!(address = %interface.address, tap = %interface.tap_name, "Restored address not reservable");
            }
        }
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }
}

async fn blocking<F>(f: F) -> Result<(), ProviderError>
where
    F: FnOnce() -> Result<(), TapError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProviderError::Network(e.to_string()))?
        .map_err(|e| ProviderError::Network(e.to_string()))
}

#[async_trait]
impl NetworkProvider for TapNetworkProvider {
    async fn allocate_interface(
        &self,
        machine_id: MachineId,
    ) -> Result<NetworkInterface, ProviderError> {
        let lease = self
            .pool
            .allocate()
            .ok_or_else(|| ProviderError::NoCapacity("tap subnet exhausted".into()))?;

        let config = TapConfig::new(machine_id, lease.gateway, lease.prefix_len).with_mtu(self.mtu);
        let name = config.name.clone();

        if let Err(e) = blocking(move || create_tap(&config)).await {
            self.pool.release(lease.address);
            return Err(e);
        }

        Ok(NetworkInterface {
            id: InterfaceId::new(),
            tap_name: name,
            mac: mac_for(lease.address),
            address: lease.address,
            gateway: lease.gateway,
            prefix_len: lease.prefix_len,
        })
    }

    async fn release_interface(&self, interface: &NetworkInterface) -> Result<(), ProviderError> {
        let name = interface.tap_name.clone();
        blocking(move || delete_tap(&name)).await?;
        self.pool.release(interface.address);
        Ok(())
    }
}
