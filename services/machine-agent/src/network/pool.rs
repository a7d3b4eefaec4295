//! IPv4 address pool for machine links.
//!
//! The subnet is carved into /30 blocks, one per machine: `.1` of the block
//! is the host end of the tap link (the guest's gateway) and `.2` is the
//! guest.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError};

use super::TapError;

/// Prefix length of each per-machine link.
pub const LINK_PREFIX_LEN: u8 = 30;

const BLOCK_SIZE: u32 = 4;

/// One allocated /30 block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub gateway: Ipv4Addr,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

#[derive(Debug)]
pub struct AddressPool {
    network: u32,
    blocks: u32,
    in_use: Mutex<BTreeSet<u32>>,
}

impl AddressPool {
    /// Parse `a.b.c.d/len`. The prefix must leave room for at least one /30.
    pub fn from_cidr(cidr: &str) -> Result<Self, TapError> {
        let invalid = || TapError::InvalidSubnet(cidr.to_string());

        let (addr, len) = cidr.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let len: u8 = len.parse().map_err(|_| invalid())?;
        if len > LINK_PREFIX_LEN {
            return Err(invalid());
        }

        let mask = u32::MAX.checked_shl(32 - u32::from(len)).unwrap_or(0);
        let network = u32::from(addr) & mask;
        let blocks = (1u64 << (32 - u32::from(len))) / u64::from(BLOCK_SIZE);

        Ok(Self {
            network,
            blocks: u32::try_from(blocks).unwrap_or(u32::MAX),
            in_use: Mutex::new(BTreeSet::new()),
        })
    }

    /// Number of blocks the pool can hand out.
    pub fn capacity(&self) -> u32 {
        self.blocks
    }

    pub fn in_use(&self) -> usize {
        self.lock().len()
    }

    /// Lease the lowest free block, or `None` when exhausted.
    pub fn allocate(&self) -> Option<Lease> {
        let mut in_use = self.lock();
        let index = (0..self.blocks).find(|i| !in_use.contains(i))?;
        in_use.insert(index);
        Some(self.lease(index))
    }

    /// Mark the block holding `address` as in use, for interfaces restored
    /// from persisted state. Returns false if it was already taken or lies
    /// outside the pool.
    pub fn reserve(&self, address: Ipv4Addr) -> bool {
        match self.index_of(address) {
            Some(index) => self.lock().insert(index),
            None => false,
        }
    }

    /// Return the block holding `address` to the pool.
    pub fn release(&self, address: Ipv4Addr) -> bool {
        match self.index_of(address) {
            Some(index) => self.lock().remove(&index),
            None => false,
        }
    }

    fn lease(&self, index: u32) -> Lease {
        let base = self.network + index * BLOCK_SIZE;
        Lease {
            gateway: Ipv4Addr::from(base + 1),
            address: Ipv4Addr::from(base + 2),
            prefix_len: LINK_PREFIX_LEN,
        }
    }

    fn index_of(&self, address: Ipv4Addr) -> Option<u32> {
        let offset = u32::from(address).checked_sub(self.network)?;
        let index = offset / BLOCK_SIZE;
        (index < self.blocks).then_some(index)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u32>> {
        self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_are_slash_30() {
        let pool = AddressPool::from_cidr("172.30.0.0/24").unwrap();
        assert_eq!(pool.capacity(), 64);

        let first = pool.allocate().unwrap();
        assert_eq!(first.gateway, Ipv4Addr::new(172, 30, 0, 1));
        assert_eq!(first.address, Ipv4Addr::new(172, 30, 0, 2));
        assert_eq!(first.prefix_len, 30);

        let second = pool.allocate().unwrap();
        assert_eq!(second.address, Ipv4Addr::new(172, 30, 0, 6));
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let pool = AddressPool::from_cidr("10.1.0.0/29").unwrap();
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());

        assert!(pool.release(a.address));
        assert_eq!(pool.allocate(), Some(a));
    }

    #[test]
    fn test_host_bits_in_cidr_are_masked() {
        let pool = AddressPool::from_cidr("192.168.7.77/28").unwrap();
        assert_eq!(
            pool.allocate().unwrap().gateway,
            Ipv4Addr::new(192, 168, 7, 65)
        );
    }

    #[test]
    fn test_reserve_restored_address() {
        let pool = AddressPool::from_cidr("10.1.0.0/29").unwrap();
        assert!(pool.reserve(Ipv4Addr::new(10, 1, 0, 2)));
        assert!(!pool.reserve(Ipv4Addr::new(10, 1, 0, 2)));
        assert_eq!(pool.allocate().unwrap().address, Ipv4Addr::new(10, 1, 0, 6));
        assert!(!pool.reserve(Ipv4Addr::new(10, 2, 0, 2)));
    }

    #[test]
    fn test_invalid_subnets() {
        for cidr in ["10.0.0.0", "10.0.0.0/31", "nope/24", "10.0.0.0/x"] {
            assert!(
                matches!(AddressPool::from_cidr(cidr), Err(TapError::InvalidSubnet(_))),
                "{cidr}"
            );
        }
    }
}
