//! Subnet pool — hands out non-overlapping `/30`s from a dynamic CIDR
//! range, plus explicitly-requested static subnets.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubnetError {
    #[error("subnet pool exhausted")]
    Exhausted,

    #[error("subnet {0} overlaps an existing reservation or the dynamic range")]
    Overlap(Ipv4Network),

    #[error("ip {1} already in use within subnet {0}")]
    IpInUse(Ipv4Network, Ipv4Addr),

    #[error("subnet {0}/ip {1} is not currently reserved")]
    NotReserved(Ipv4Network, Ipv4Addr),

    #[error("invalid subnet: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Dynamic,
    Static,
}

struct Entry {
    kind: Kind,
    ips_in_use: HashSet<Ipv4Addr>,
}

/// What a caller is requesting from the subnet pool.
pub enum SubnetRequest {
    /// Hand out a fresh `/30` from the dynamic range.
    Dynamic,
    /// Reserve a specific CIDR and IP, shared by refcount across callers.
    Static { cidr: Ipv4Network, ip: Ipv4Addr },
}

/// A reserved subnet plus the container IP assigned within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub subnet: Ipv4Network,
    pub container_ip: Ipv4Addr,
}

struct State {
    reserved: HashMap<Ipv4Network, Entry>,
}

pub struct SubnetPool {
    dynamic_range: Ipv4Network,
    block_prefix: u8,
    state: Mutex<State>,
}

impl SubnetPool {
    pub fn new(dynamic_range: Ipv4Network) -> Self {
        Self::with_block_prefix(dynamic_range, 30)
    }

    pub fn with_block_prefix(dynamic_range: Ipv4Network, block_prefix: u8) -> Self {
        Self {
            dynamic_range,
            block_prefix,
            state: Mutex::new(State {
                reserved: HashMap::new(),
            }),
        }
    }

    /// Acquire a subnet per `request`.
    pub fn acquire(&self, request: SubnetRequest) -> Result<Allocation, SubnetError> {
        match request {
            SubnetRequest::Dynamic => self.acquire_dynamic(),
            SubnetRequest::Static { cidr, ip } => self.acquire_static(cidr, ip),
        }
    }

    fn acquire_dynamic(&self) -> Result<Allocation, SubnetError> {
        let mut state = self.state.lock();

        for candidate in carve(self.dynamic_range, self.block_prefix) {
            if state.reserved.contains_key(&candidate) {
                continue;
            }

            let container_ip = first_usable(candidate)?;
            state.reserved.insert(
                candidate,
                Entry {
                    kind: Kind::Dynamic,
                    ips_in_use: HashSet::from([container_ip]),
                },
            );
            return Ok(Allocation {
                subnet: candidate,
                container_ip,
            });
        }

        Err(SubnetError::Exhausted)
    }

    fn acquire_static(&self, cidr: Ipv4Network, ip: Ipv4Addr) -> Result<Allocation, SubnetError> {
        if !cidr.contains(ip) {
            return Err(SubnetError::Invalid(format!(
                "{} is not within {}",
                ip, cidr
            )));
        }

        let mut state = self.state.lock();

        if let Some(entry) = state.reserved.get_mut(&cidr) {
            if entry.kind != Kind::Static {
                return Err(SubnetError::Overlap(cidr));
            }
            if !entry.ips_in_use.insert(ip) {
                return Err(SubnetError::IpInUse(cidr, ip));
            }
            return Ok(Allocation {
                subnet: cidr,
                container_ip: ip,
            });
        }

        if overlaps(cidr, self.dynamic_range)
            || state.reserved.keys().any(|existing| overlaps(cidr, *existing))
        {
            return Err(SubnetError::Overlap(cidr));
        }

        state.reserved.insert(
            cidr,
            Entry {
                kind: Kind::Static,
                ips_in_use: HashSet::from([ip]),
            },
        );

        Ok(Allocation {
            subnet: cidr,
            container_ip: ip,
        })
    }

    /// Release a previously-acquired `(subnet, ip)` pair. When the
    /// refcount reaches zero the subnet becomes eligible for re-handout
    /// (dynamic) or is forgotten entirely (static).
    pub fn release(&self, subnet: Ipv4Network, ip: Ipv4Addr) -> Result<(), SubnetError> {
        let mut state = self.state.lock();

        let entry = state
            .reserved
            .get_mut(&subnet)
            .ok_or(SubnetError::NotReserved(subnet, ip))?;

        if !entry.ips_in_use.remove(&ip) {
            return Err(SubnetError::NotReserved(subnet, ip));
        }

        if entry.ips_in_use.is_empty() {
            state.reserved.remove(&subnet);
        }

        Ok(())
    }

    /// Pre-reserve a subnet/ip at startup (snapshot replay) as a dynamic
    /// allocation, joining an existing in-memory entry for the same
    /// subnet if one is already present.
    pub fn remove_dynamic(&self, subnet: Ipv4Network, ip: Ipv4Addr) -> Result<(), SubnetError> {
        self.remove(subnet, ip, Kind::Dynamic)
    }

    /// Pre-reserve a subnet/ip at startup (snapshot replay) as a static
    /// allocation, validated the same way `acquire_static` would be so a
    /// replayed reservation can't silently collide with the dynamic
    /// range or another static subnet.
    pub fn remove_static(&self, subnet: Ipv4Network, ip: Ipv4Addr) -> Result<(), SubnetError> {
        self.remove(subnet, ip, Kind::Static)
    }

    fn remove(&self, subnet: Ipv4Network, ip: Ipv4Addr, kind: Kind) -> Result<(), SubnetError> {
        let mut state = self.state.lock();

        if let Some(entry) = state.reserved.get_mut(&subnet) {
            if entry.kind != kind {
                return Err(SubnetError::Overlap(subnet));
            }
            entry.ips_in_use.insert(ip);
            return Ok(());
        }

        if kind == Kind::Static
            && (overlaps(subnet, self.dynamic_range)
                || state.reserved.keys().any(|existing| overlaps(subnet, *existing)))
        {
            return Err(SubnetError::Overlap(subnet));
        }

        state.reserved.insert(
            subnet,
            Entry {
                kind,
                ips_in_use: HashSet::from([ip]),
            },
        );
        Ok(())
    }
}

fn overlaps(a: Ipv4Network, b: Ipv4Network) -> bool {
    let (a_lo, a_hi) = bounds(a);
    let (b_lo, b_hi) = bounds(b);
    a_lo <= b_hi && b_lo <= a_hi
}

fn bounds(net: Ipv4Network) -> (u32, u32) {
    let lo = u32::from(net.network());
    let hi = u32::from(net.broadcast());
    (lo, hi)
}

fn carve(range: Ipv4Network, block_prefix: u8) -> impl Iterator<Item = Ipv4Network> {
    let block_size: u32 = 1u32 << (32 - block_prefix as u32);
    let range_lo = u32::from(range.network());
    let range_hi = u32::from(range.broadcast());

    std::iter::successors(Some(range_lo), move |addr| {
        let next = addr.checked_add(block_size)?;
        (next <= range_hi).then_some(next)
    })
    .filter_map(move |addr| Ipv4Network::new(Ipv4Addr::from(addr), block_prefix).ok())
}

fn first_usable(net: Ipv4Network) -> Result<Ipv4Addr, SubnetError> {
    let network_addr = u32::from(net.network());
    Ok(Ipv4Addr::from(network_addr + 1))
}
