//! Container pool — the orchestrator that composes resource pools,
//! a rootfs provider, and the helper-script pipeline into a fully
//! configured container, reversing every allocation on failure or
//! destroy.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use ipnetwork::Ipv4Network;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::Configuration;
use crate::error::CoreError;
use crate::events::EventBus;
use crate::hooks::{HookContext, HookFn, HookPoint, HookSet};
use crate::network::{BridgeManager, ContainerConfig, HostConfig, NetworkConfigurator};
use crate::pool::port::PortPool;
use crate::pool::subnet::{SubnetPool, SubnetRequest};
use crate::pool::uid::UidPool;
use crate::rootfs::{ProvideResult, RootfsManager};
use crate::script::{CreateEnv, ScriptRunner, SetupEnv};
use crate::types::{Container, ContainerSpec, ContainerState, NetworkResources, ResourcesBundle};

/// Everything returned to the caller of `create`: the container record
/// plus the hook set an external namespace driver must invoke at the
/// clone/pivot points.
pub struct CreatedContainer {
    pub container: Container,
    pub hooks: HookSet,
}

pub struct ContainerPool {
    config: Arc<Configuration>,
    uid_pool: UidPool,
    port_pool: PortPool,
    subnet_pool: SubnetPool,
    bridges: Arc<BridgeManager>,
    configurator: Arc<NetworkConfigurator>,
    rootfs: Arc<RootfsManager>,
    scripts: ScriptRunner,
    events: Arc<EventBus>,
    containers: DashMap<String, Container>,
}

impl ContainerPool {
    pub fn new(
        config: Arc<Configuration>,
        uid_pool: UidPool,
        port_pool: PortPool,
        subnet_pool: SubnetPool,
        bridges: Arc<BridgeManager>,
        configurator: Arc<NetworkConfigurator>,
        rootfs: Arc<RootfsManager>,
        scripts: ScriptRunner,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            uid_pool,
            port_pool,
            subnet_pool,
            bridges,
            configurator,
            rootfs,
            scripts,
            events,
            containers: DashMap::new(),
        }
    }

    /// Wires up the real collaborators (`ip`, HTTP registry client, the
    /// tempdir-backed graph) from a loaded [`Configuration`].
    pub fn from_config(config: Arc<Configuration>) -> Self {
        let os: Arc<dyn crate::network::NetOs> = Arc::new(crate::network::IpRoute2);
        let bridges = Arc::new(BridgeManager::new(&config.bridge.tag, os.clone()));
        let configurator = Arc::new(NetworkConfigurator::new(bridges.clone(), os));

        let graph = Arc::new(crate::graph::local::LocalGraph::new(config.depot_path.join("graph")));
        let provider = Arc::new(crate::registry::http::DefaultRegistryProvider::new(
            reqwest::Client::new(),
        ));
        let fetcher = Arc::new(crate::fetcher::Fetcher::new(provider, graph.clone()));
        let rootfs = Arc::new(RootfsManager::new(config.depot_path.join("overlay"), fetcher, graph));

        Self::new(
            config.clone(),
            UidPool::new(config.uid_pool.start, config.uid_pool.size),
            PortPool::new(config.port_pool.start as u16, config.port_pool.size as u16),
            SubnetPool::new(
                config
                    .network
                    .pool_network
                    .parse()
                    .expect("configured pool_network must be a valid CIDR"),
            ),
            bridges,
            configurator,
            rootfs,
            ScriptRunner::new(config.bin_path.clone()),
            Arc::new(EventBus::new()),
        )
    }

    /// Runs the external `setup.sh` once with the canonical helper-script
    /// environment contract.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> Result<(), CoreError> {
        let env = SetupEnv {
            pool_network: self.config.network.pool_network.clone(),
            allow_networks: self.config.network.allow_networks.join(","),
            deny_networks: self.config.network.deny_networks.join(","),
            container_rootfs_path: self.config.rootfs_path.clone(),
            container_depot_path: self.config.depot_path.clone(),
            container_depot_mount_point_path: PathBuf::from("/"),
            disk_quota_enabled: self.config.disk_quota_enabled,
        };
        self.scripts.setup(&env).await?;
        Ok(())
    }

    fn depot_path_for(&self, id: &str) -> PathBuf {
        self.config.depot_path.join(id)
    }

    #[instrument(skip(self, spec))]
    pub async fn create(&self, spec: ContainerSpec) -> Result<CreatedContainer, CoreError> {
        let id = Uuid::new_v4().to_string();

        let uid = self.uid_pool.acquire()?;

        let subnet_request = match spec.static_subnet {
            Some((cidr, ip)) => SubnetRequest::Static { cidr, ip },
            None => SubnetRequest::Dynamic,
        };
        let subnet_alloc = match self.subnet_pool.acquire(subnet_request) {
            Ok(alloc) => alloc,
            Err(err) => {
                self.release_uid(uid);
                return Err(err.into());
            }
        };

        let host_ip = next_address(subnet_alloc.subnet, subnet_alloc.container_ip);
        // The bridge device itself is created later, from the host-namespace
        // hook, once a pid exists to move the veth into. Only the name is
        // deterministic up front.
        let bridge_name = self.bridges.name_for(subnet_alloc.subnet);

        let mut ports = Vec::with_capacity(spec.requested_ports.len());
        let mut port_err = None;
        for _ in &spec.requested_ports {
            match self.port_pool.acquire() {
                Ok(p) => ports.push(p),
                Err(err) => {
                    port_err = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = port_err {
            for p in &ports {
                self.release_port(*p);
            }
            self.release_subnet(subnet_alloc.subnet, subnet_alloc.container_ip);
            self.release_uid(uid);
            return Err(err.into());
        }

        let rootfs_url = spec
            .rootfs
            .as_ref()
            .map(|r| r.0.clone())
            .unwrap_or_else(|| "local://".parse().unwrap());

        let provided: ProvideResult = match self.rootfs.provide(&id, &rootfs_url).await {
            Ok(p) => p,
            Err(err) => {
                for p in &ports {
                    self.release_port(*p);
                }
                self.release_subnet(subnet_alloc.subnet, subnet_alloc.container_ip);
                self.release_uid(uid);
                return Err(err.into());
            }
        };

        let create_env = CreateEnv {
            id: id.clone(),
            rootfs_path: provided.path.clone(),
            allow_nested_warden: self.config.allow_nested_warden,
            container_iface_mtu: self.config.container_iface_mtu,
        };

        if let Err(err) = self.scripts.create(&self.depot_path_for(&id), &create_env).await {
            let _ = self.rootfs.cleanup(&id).await;
            for p in &ports {
                self.release_port(*p);
            }
            self.release_subnet(subnet_alloc.subnet, subnet_alloc.container_ip);
            self.release_uid(uid);
            return Err(err.into());
        }

        let network = NetworkResources {
            bridge_name,
            subnet: subnet_alloc.subnet,
            container_ip: subnet_alloc.container_ip,
            host_ip,
        };

        let container = Container {
            handle: id.clone(),
            id: id.clone(),
            state: ContainerState::Active,
            grace_time_secs: spec.grace_time_secs.unwrap_or(self.config.container_grace_time_secs),
            resources: ResourcesBundle { uid, network: network.clone(), ports },
            net_in: Default::default(),
            net_out: Vec::new(),
            limits: spec.limits,
            created_at: chrono::Utc::now(),
        };

        self.containers.insert(id.clone(), container.clone());
        self.events.publish_state(&id, ContainerState::Active);
        info!(container_id = %id, "container created");

        let hooks = self.build_hooks(&id, network, provided.path);

        Ok(CreatedContainer { container, hooks })
    }

    fn build_hooks(&self, container_id: &str, network: NetworkResources, container_root: PathBuf) -> HookSet {
        let mut hooks = HookSet::new();

        let configurator = self.configurator.clone();
        let mtu = self.config.container_iface_mtu;
        let host_network = network.clone();
        let host_hook: HookFn = Box::new(move |ctx: &HookContext| {
            let configurator = configurator.clone();
            let host_network = host_network.clone();
            Box::pin(async move {
                let cfg = HostConfig {
                    host_iface: veth_name("h", &ctx.container_id),
                    container_iface: veth_name("c", &ctx.container_id),
                    bridge_subnet: host_network.subnet,
                    host_ip: host_network.host_ip,
                    container_pid: ctx.container_pid,
                    mtu,
                };
                configurator
                    .configure_host(&cfg)
                    .await
                    .map(|_| ())
                    .map_err(|e| crate::hooks::HookError::at(HookPoint::ParentAfterClone, e))
            })
        });
        hooks.register(HookPoint::ParentAfterClone, host_hook);

        let configurator = self.configurator.clone();
        let container_network = network.clone();
        let container_hook: HookFn = Box::new(move |ctx: &HookContext| {
            let configurator = configurator.clone();
            let container_network = container_network.clone();
            Box::pin(async move {
                let cfg = ContainerConfig {
                    container_iface: veth_name("c", &ctx.container_id),
                    container_ip: container_network.container_ip,
                    gateway_ip: container_network.host_ip,
                    subnet: container_network.subnet,
                    hostname: ctx.container_id.clone(),
                    mtu,
                };
                configurator
                    .configure_container(&cfg)
                    .await
                    .map_err(|e| crate::hooks::HookError::at(HookPoint::ChildAfterPivot, e))?;

                crate::hooks::mount_proc_and_tmp(&ctx.container_root)
                    .map_err(|e| crate::hooks::HookError::at(HookPoint::ChildAfterPivot, e))?;
                crate::hooks::run_seed_script(&ctx.container_root)
                    .await
                    .map_err(|e| crate::hooks::HookError::at(HookPoint::ChildAfterPivot, e))?;
                crate::hooks::ensure_mtab_symlink(&ctx.container_root)
                    .map_err(|e| crate::hooks::HookError::at(HookPoint::ChildAfterPivot, e))?;
                Ok(())
            })
        });
        hooks.register(HookPoint::ChildAfterPivot, container_hook);

        let _ = container_root; // captured per-container by the caller's own HookContext, not here
        let _ = container_id;
        hooks
    }

    #[instrument(skip(self))]
    pub async fn destroy(&self, id: &str) -> Result<(), CoreError> {
        let (_, container) = self
            .containers
            .remove(id)
            .ok_or_else(|| CoreError::NoSuchContainer(id.to_string()))?;

        self.scripts.destroy(&self.depot_path_for(id), id).await?;

        if let Err(err) = self.rootfs.cleanup(id).await {
            warn!(container_id = %id, error = %err, "rootfs cleanup failed");
        }

        for port in &container.resources.ports {
            self.release_port(*port);
        }
        self.release_bridge(container.resources.network.subnet).await;
        self.release_subnet(container.resources.network.subnet, container.resources.network.container_ip);
        self.release_uid(container.resources.uid);

        self.events.publish_state(id, ContainerState::Destroyed);
        info!(container_id = %id, "container destroyed");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Container> {
        self.containers.get(id).map(|e| e.value().clone())
    }

    pub fn count(&self) -> usize {
        self.containers.len()
    }

    fn release_uid(&self, uid: u32) {
        if let Err(err) = self.uid_pool.release(uid) {
            warn!(uid, error = %err, "uid release failed");
        }
    }

    fn release_port(&self, port: u16) {
        if let Err(err) = self.port_pool.release(port) {
            warn!(port, error = %err, "port release failed");
        }
    }

    fn release_subnet(&self, subnet: Ipv4Network, ip: Ipv4Addr) {
        if let Err(err) = self.subnet_pool.release(subnet, ip) {
            warn!(%subnet, %ip, error = %err, "subnet release failed");
        }
    }

    async fn release_bridge(&self, subnet: Ipv4Network) {
        if let Err(err) = self.bridges.release(subnet).await {
            warn!(%subnet, error = %err, "bridge release failed");
        }
    }
}

fn next_address(subnet: Ipv4Network, after: Ipv4Addr) -> Ipv4Addr {
    let candidate = Ipv4Addr::from(u32::from(after) + 1);
    if subnet.contains(candidate) {
        candidate
    } else {
        subnet.network()
    }
}

fn veth_name(side: &str, container_id: &str) -> String {
    let short: String = container_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(8).collect();
    format!("v{side}{short}")
}
