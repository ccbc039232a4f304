//! Node pool, node capacity and the simulator runners each node hosts.
//!
//! The registry owns the configured nodes for a session. It derives each
//! node's capacity, provisions simulator runners through `xcrun simctl`, and
//! tracks which nodes have been degraded by infrastructure failures.
//!
//! # Provisioning
//!
//! ```text
//! list runtimes ──► runtime check (exact, or major.minor with a warning)
//!       │
//! list devices ──► "<device> (simfleet <i>)" reused, or simctl create
//!       │
//! simctl boot ──► simctl bootstatus -b ──► Runner
//! ```

pub mod simctl;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelError, Command};
use crate::config::{Concurrency, DeviceProfile, DriverConfig, NodeConfig};

use simctl::RuntimeMatch;

/// Errors raised while preparing nodes and runners.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Two nodes share the same name.
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    /// The requested OS runtime is not installed on the node.
    #[error("Runtime {platform} {runtime} is not available on node {node} (installed: {installed})")]
    RuntimeUnavailable {
        node: String,
        platform: String,
        runtime: String,
        installed: String,
    },

    /// Output of a probe or simctl command could not be understood.
    #[error("Unexpected output from {what} on node {node}: {message}")]
    Parse {
        node: String,
        what: String,
        message: String,
    },

    /// Built products are missing on the node and cannot be uploaded.
    #[error("Test products missing on node {node}: {path}")]
    MissingProducts { node: String, path: String },

    /// The underlying channel failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl RegistryError {
    /// Errors that no retry or other node can fix.
    pub fn is_fatal(&self) -> bool {
        match self {
            RegistryError::DuplicateNode(_) | RegistryError::RuntimeUnavailable { .. } => true,
            RegistryError::MissingProducts { .. } => true,
            RegistryError::Channel(e) => e.is_auth(),
            RegistryError::Parse { .. } => false,
        }
    }

    /// Errors worth retrying under the infrastructure budget.
    pub fn is_infra(&self) -> bool {
        !self.is_fatal()
    }
}

/// A booted simulator owned by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runner {
    /// Simulator UDID.
    pub udid: String,
    /// Name of the node hosting the simulator.
    pub node: String,
    /// Display name, `"<device> (simfleet <i>)"`.
    pub name: String,
    pub profile: DeviceProfile,
}

/// Display name of the `index`-th runner (1-based) for a device.
pub fn runner_name(device: &str, index: usize) -> String {
    format!("{} (simfleet {})", device, index)
}

/// Capacity derived from a node's hardware.
///
/// Half the cores, one simulator per 4 GiB of memory, at least one; bounded
/// by the scratch disk hint at 2 GB per simulator.
pub fn auto_concurrency(cpus: u64, memory_bytes: u64, scratch_disk_gb: Option<u64>) -> usize {
    let memory_gib = memory_bytes / (1024 * 1024 * 1024);
    let mut capacity = (cpus / 2).min(memory_gib / 4).max(1);
    if let Some(disk) = scratch_disk_gb {
        capacity = capacity.min((disk / 2).max(1));
    }
    capacity as usize
}

/// The node pool of a session.
pub struct Registry {
    nodes: Vec<NodeConfig>,
    infra_retries: usize,
    degraded: Mutex<HashMap<String, String>>,
}

impl Registry {
    /// Builds the pool.
    ///
    /// Every loopback designation (`local`, `localhost`, `127.0.0.1`, `::1`)
    /// collapses into a single local node; the first one wins.
    pub fn new(nodes: Vec<NodeConfig>, infra_retries: usize) -> Result<Self, RegistryError> {
        let mut pool: Vec<NodeConfig> = Vec::with_capacity(nodes.len());
        let mut local_seen: Option<String> = None;

        for node in nodes {
            if pool.iter().any(|n| n.name == node.name) {
                return Err(RegistryError::DuplicateNode(node.name));
            }
            if node.is_local() {
                if let Some(first) = &local_seen {
                    warn!(
                        "Node {} ({}) is the local machine, already registered as {}; ignoring it",
                        node.name, node.address, first
                    );
                    continue;
                }
                local_seen = Some(node.name.clone());
            }
            pool.push(node);
        }

        Ok(Self {
            nodes: pool,
            infra_retries,
            degraded: Mutex::new(HashMap::new()),
        })
    }

    pub fn nodes(&self) -> &[NodeConfig] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Marks a node as unusable for the rest of the session.
    pub fn mark_degraded(&self, node: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Node {} degraded: {}", node, reason);
        self.degraded_map().entry(node.to_string()).or_insert(reason);
    }

    pub fn is_degraded(&self, node: &str) -> bool {
        self.degraded_map().contains_key(node)
    }

    /// Reason recorded when the node was degraded.
    pub fn degraded_reason(&self, node: &str) -> Option<String> {
        self.degraded_map().get(node).cloned()
    }

    /// Names of the nodes that are still healthy.
    pub fn viable_nodes(&self) -> Vec<String> {
        let degraded = self.degraded_map();
        self.nodes
            .iter()
            .filter(|n| !degraded.contains_key(&n.name))
            .map(|n| n.name.clone())
            .collect()
    }

    fn degraded_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.degraded.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `op`, retrying infrastructure failures up to `infra_retries` times.
    pub async fn with_infra_retries<T, F, Fut>(
        &self,
        node: &str,
        what: &str,
        mut op: F,
    ) -> Result<T, RegistryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_infra() && attempt < self.infra_retries => {
                    attempt += 1;
                    warn!(
                        "{} on node {} failed (attempt {}/{}): {}",
                        what,
                        node,
                        attempt,
                        self.infra_retries + 1,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Number of runners the node may host.
    pub async fn resolve_concurrency(
        &self,
        node: &NodeConfig,
        channel: &dyn Channel,
    ) -> Result<usize, RegistryError> {
        match node.concurrency {
            Concurrency::Fixed(n) => Ok(n),
            Concurrency::Auto => {
                let cpus = probe_sysctl(channel, "hw.ncpu").await?;
                let memory = probe_sysctl(channel, "hw.memsize").await?;
                let capacity = auto_concurrency(cpus, memory, node.scratch_disk_gb);
                info!(
                    "Node {}: {} cpus, {} GiB memory -> {} runners",
                    node.name,
                    cpus,
                    memory / (1024 * 1024 * 1024),
                    capacity
                );
                Ok(capacity)
            }
        }
    }

    /// Makes sure the built test products are present on the node.
    ///
    /// Remote nodes receive `driver.products_dir` in `driver.remote_dir`
    /// unless the xctestrun file is already there.
    pub async fn prepare_products(
        &self,
        node: &NodeConfig,
        channel: &dyn Channel,
        driver: &DriverConfig,
    ) -> Result<(), RegistryError> {
        let remote = !node.is_local();
        let xctestrun = driver.xctestrun_on(remote);

        if channel.file_exists(&xctestrun).await? {
            debug!("Node {}: {} already present", node.name, xctestrun);
            return Ok(());
        }

        let products = match (&driver.products_dir, remote) {
            (Some(dir), true) => dir,
            _ => {
                return Err(RegistryError::MissingProducts {
                    node: node.name.clone(),
                    path: xctestrun,
                });
            }
        };

        info!(
            "Uploading {} to {}:{}",
            products.display(),
            node.name,
            driver.remote_dir
        );
        channel
            .execute(
                &Command::new("rm").arg("-rf").arg(&driver.remote_dir),
                None,
            )
            .await?;
        channel.upload(products, &driver.remote_dir).await?;
        Ok(())
    }

    /// Provisions and boots `count` runners on the node.
    ///
    /// # Errors
    ///
    /// [`RegistryError::RuntimeUnavailable`] if neither the exact runtime nor
    /// one with the same `major.minor` is installed.
    pub async fn provision_runners(
        &self,
        node: &NodeConfig,
        channel: &dyn Channel,
        profile: &DeviceProfile,
        count: usize,
    ) -> Result<Vec<Runner>, RegistryError> {
        let output = channel.execute(&simctl::list_runtimes(), None).await?;
        let runtimes = simctl::parse_runtimes(&output.stdout).map_err(|e| RegistryError::Parse {
            node: node.name.clone(),
            what: "simctl list runtimes".to_string(),
            message: e.to_string(),
        })?;

        let (runtime, quality) = simctl::select_runtime(&runtimes, &profile.platform, &profile.runtime)
            .ok_or_else(|| RegistryError::RuntimeUnavailable {
                node: node.name.clone(),
                platform: profile.platform.clone(),
                runtime: profile.runtime.clone(),
                installed: runtimes
                    .iter()
                    .map(|r| r.name.clone())
                    .collect::<Vec<_>>()
                    .join(", "),
            })?;
        if quality == RuntimeMatch::Approximate {
            warn!(
                "Node {}: runtime {} requested, using {} instead",
                node.name, profile.runtime, runtime.version
            );
        }

        let output = channel.execute(&simctl::list_devices(), None).await?;
        let devices = simctl::parse_devices(&output.stdout).map_err(|e| RegistryError::Parse {
            node: node.name.clone(),
            what: "simctl list devices".to_string(),
            message: e.to_string(),
        })?;

        let mut runners = Vec::with_capacity(count);
        for index in 1..=count {
            let name = runner_name(&profile.name, index);
            let udid = match find_device(&devices, &runtime.identifier, &profile.runtime, &name) {
                Some((udid, RuntimeMatch::Exact)) => {
                    debug!("Node {}: reusing {} ({})", node.name, name, udid);
                    udid
                }
                Some((udid, RuntimeMatch::Approximate)) => {
                    warn!(
                        "Node {}: reusing {} ({}) on a runtime differing in patch version",
                        node.name, name, udid
                    );
                    udid
                }
                None => {
                    let output = channel
                        .execute(
                            &simctl::create(&name, &profile.name, &runtime.identifier),
                            None,
                        )
                        .await?;
                    let udid = output.stdout.trim().to_string();
                    if udid.is_empty() {
                        return Err(RegistryError::Parse {
                            node: node.name.clone(),
                            what: "simctl create".to_string(),
                            message: "empty UDID".to_string(),
                        });
                    }
                    info!("Node {}: created {} ({})", node.name, name, udid);
                    udid
                }
            };

            channel.execute(&simctl::boot(&udid), None).await?;
            channel.execute(&simctl::bootstatus(&udid), None).await?;

            runners.push(Runner {
                udid,
                node: node.name.clone(),
                name,
                profile: profile.clone(),
            });
        }

        Ok(runners)
    }

    /// Shuts the runner down and erases its contents.
    pub async fn reset(&self, runner: &Runner, channel: &dyn Channel) -> Result<(), RegistryError> {
        self.shutdown(runner, channel).await?;
        channel.execute(&simctl::erase(&runner.udid), None).await?;
        Ok(())
    }

    /// Shuts the runner down; an already shut down runner is fine.
    pub async fn shutdown(&self, runner: &Runner, channel: &dyn Channel) -> Result<(), RegistryError> {
        channel.execute(&simctl::shutdown(&runner.udid), None).await?;
        Ok(())
    }

    /// Kills the app under test on the runner.
    pub async fn terminate_app(
        &self,
        runner: &Runner,
        channel: &dyn Channel,
        bundle_id: &str,
    ) -> Result<(), RegistryError> {
        channel
            .execute(&simctl::terminate(&runner.udid, bundle_id), None)
            .await?;
        Ok(())
    }
}

/// Finds a device with the runner name, preferring the chosen runtime.
fn find_device(
    devices: &HashMap<String, Vec<simctl::SimDevice>>,
    runtime_identifier: &str,
    requested: &str,
    name: &str,
) -> Option<(String, RuntimeMatch)> {
    let named = |list: &Vec<simctl::SimDevice>| {
        list.iter()
            .find(|d| d.is_available && d.name == name)
            .map(|d| d.udid.clone())
    };

    if let Some(udid) = devices.get(runtime_identifier).and_then(named) {
        return Some((udid, RuntimeMatch::Exact));
    }

    let mut others: Vec<_> = devices
        .iter()
        .filter(|(id, _)| id.as_str() != runtime_identifier)
        .collect();
    others.sort_by(|a, b| a.0.cmp(b.0));
    others.into_iter().find_map(|(id, list)| {
        let version = simctl::identifier_version(id)?;
        simctl::match_version(&version, requested)?;
        named(list).map(|udid| (udid, RuntimeMatch::Approximate))
    })
}

async fn probe_sysctl(channel: &dyn Channel, key: &str) -> Result<u64, RegistryError> {
    let output = channel
        .execute(&Command::new("sysctl").arg("-n").arg(key), None)
        .await?;
    output
        .stdout
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| RegistryError::Parse {
            node: channel.node().to_string(),
            what: format!("sysctl {}", key),
            message: e.to_string(),
        })
}
