//! Bridge manager — reference-counts named bridges per subnet.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use thiserror::Error;

use super::os::{NetOs, OsError};

/// Linux's `IFNAMSIZ` includes the trailing nul, so a device name may
/// be at most 15 visible characters.
const IFNAMSIZ_MAX: usize = 15;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("os error: {0}")]
    Os(#[from] OsError),

    #[error("bridge for subnet {0} was not reserved")]
    NotReserved(Ipv4Network),
}

struct Entry {
    name: String,
    refcount: u32,
}

struct State {
    bridges: HashMap<Ipv4Network, Entry>,
}

pub struct BridgeManager {
    prefix: String,
    os: Arc<dyn NetOs>,
    state: Mutex<State>,
}

impl BridgeManager {
    pub fn new(tag: &str, os: Arc<dyn NetOs>) -> Self {
        Self {
            prefix: format!("w{tag}b-"),
            os,
            state: Mutex::new(State {
                bridges: HashMap::new(),
            }),
        }
    }

    /// Deterministic bridge name for `subnet`, truncated to `IFNAMSIZ`.
    pub fn name_for(&self, subnet: Ipv4Network) -> String {
        let full = format!("{}{:x}", self.prefix, u32::from(subnet.network()));
        full.chars().take(IFNAMSIZ_MAX).collect()
    }

    /// Reserve the bridge for `subnet`, creating the device and
    /// assigning `host_ip` on first reservation.
    pub async fn reserve(
        &self,
        subnet: Ipv4Network,
        host_ip: Ipv4Addr,
    ) -> Result<String, BridgeError> {
        let name = self.name_for(subnet);

        let should_create = {
            let mut state = self.state.lock();
            match state.bridges.get_mut(&subnet) {
                Some(entry) => {
                    entry.refcount += 1;
                    false
                }
                None => {
                    state.bridges.insert(
                        subnet,
                        Entry {
                            name: name.clone(),
                            refcount: 1,
                        },
                    );
                    true
                }
            }
        };

        if should_create {
            if let Err(err) = self.create_device(&name, subnet, host_ip).await {
                self.state.lock().bridges.remove(&subnet);
                return Err(err);
            }
        }

        Ok(name)
    }

    async fn create_device(
        &self,
        name: &str,
        subnet: Ipv4Network,
        host_ip: Ipv4Addr,
    ) -> Result<(), BridgeError> {
        self.os.bridge_add(name).await?;
        self.os
            .addr_add(name, &format!("{}/{}", host_ip, subnet.prefix()))
            .await?;
        self.os.link_set_up(name).await?;
        Ok(())
    }

    /// Release one reservation of the bridge owning `subnet`, deleting
    /// the device on last release.
    pub async fn release(&self, subnet: Ipv4Network) -> Result<(), BridgeError> {
        let should_delete = {
            let mut state = self.state.lock();
            let entry = state
                .bridges
                .get_mut(&subnet)
                .ok_or(BridgeError::NotReserved(subnet))?;
            entry.refcount -= 1;
            if entry.refcount == 0 {
                let name = entry.name.clone();
                state.bridges.remove(&subnet);
                Some(name)
            } else {
                None
            }
        };

        if let Some(name) = should_delete {
            self.os.bridge_del(&name).await?;
        }

        Ok(())
    }

    pub fn refcount(&self, subnet: Ipv4Network) -> u32 {
        self.state
            .lock()
            .bridges
            .get(&subnet)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeOs {
        adds: AtomicUsize,
        dels: AtomicUsize,
    }

    #[async_trait]
    impl NetOs for FakeOs {
        async fn bridge_add(&self, _name: &str) -> Result<(), OsError> {
            self.adds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn bridge_del(&self, _name: &str) -> Result<(), OsError> {
            self.dels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn addr_add(&self, _device: &str, _cidr: &str) -> Result<(), OsError> {
            Ok(())
        }
        async fn link_set_up(&self, _device: &str) -> Result<(), OsError> {
            Ok(())
        }
        async fn link_set_mtu(&self, _device: &str, _mtu: u32) -> Result<(), OsError> {
            Ok(())
        }
        async fn link_set_master(&self, _device: &str, _bridge: &str) -> Result<(), OsError> {
            Ok(())
        }
        async fn link_set_netns(&self, _device: &str, _pid: u32) -> Result<(), OsError> {
            Ok(())
        }
        async fn veth_add(&self, _host_side: &str, _container_side: &str) -> Result<(), OsError> {
            Ok(())
        }
        async fn route_add_default(&self, _gateway: Ipv4Addr) -> Result<(), OsError> {
            Ok(())
        }
        async fn set_hostname(&self, _hostname: &str) -> Result<(), OsError> {
            Ok(())
        }
    }

    fn subnet() -> Ipv4Network {
        "10.254.0.0/30".parse().unwrap()
    }

    #[tokio::test]
    async fn name_is_deterministic_and_within_ifnamsiz() {
        let os = Arc::new(FakeOs::default());
        let mgr = BridgeManager::new("d", os);
        let a = mgr.name_for(subnet());
        let b = mgr.name_for(subnet());
        assert_eq!(a, b);
        assert!(a.len() <= IFNAMSIZ_MAX);
    }

    #[tokio::test]
    async fn device_created_once_across_reserves_and_deleted_on_last_release() {
        let os = Arc::new(FakeOs::default());
        let mgr = BridgeManager::new("d", os.clone());
        let gw: Ipv4Addr = "10.254.0.1".parse().unwrap();

        mgr.reserve(subnet(), gw).await.unwrap();
        mgr.reserve(subnet(), gw).await.unwrap();
        assert_eq!(os.adds.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.refcount(subnet()), 2);

        mgr.release(subnet()).await.unwrap();
        assert_eq!(os.dels.load(Ordering::SeqCst), 0);

        mgr.release(subnet()).await.unwrap();
        assert_eq!(os.dels.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.refcount(subnet()), 0);
    }

    #[tokio::test]
    async fn release_without_reservation_is_an_error() {
        let os = Arc::new(FakeOs::default());
        let mgr = BridgeManager::new("d", os);
        assert!(matches!(
            mgr.release(subnet()).await,
            Err(BridgeError::NotReserved(_))
        ));
    }
}
