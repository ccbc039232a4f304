//! Per-node preparation before any test runs.
//!
//! Every node is handled concurrently: open a channel, resolve its
//! capacity, make sure the test products are present, and boot its
//! runners. Transient failures are retried under the infra budget; a node
//! that still fails is degraded, while configuration faults (bad
//! credentials, missing runtime, missing products) abort the session.

use futures::future::join_all;
use tracing::{info, warn};

use crate::aggregator::{Aggregator, Stage};
use crate::channel::{Channel, ChannelProvider};
use crate::config::{DeviceProfile, DriverConfig, NodeConfig};
use crate::registry::{Registry, RegistryError, Runner};

/// A provisioned node: its channel and the runners it hosts.
pub struct NodePool<C> {
    pub node: String,
    pub channel: C,
    pub runners: Vec<Runner>,
}

async fn provision_node<P: ChannelProvider>(
    provider: &P,
    registry: &Registry,
    aggregator: &Aggregator,
    node: &NodeConfig,
    driver: &DriverConfig,
    device: &DeviceProfile,
) -> Result<NodePool<P::Channel>, RegistryError> {
    let _timing = aggregator.begin(Stage::Provisioning, Some(&node.name));

    let channel = provider.connect(node)?;
    let handle: &dyn Channel = &channel;
    let runners = registry
        .with_infra_retries(&node.name, "Provisioning", || async move {
            let capacity = registry.resolve_concurrency(node, handle).await?;
            if capacity == 0 {
                return Ok(Vec::new());
            }
            registry.prepare_products(node, handle, driver).await?;
            registry
                .provision_runners(node, handle, device, capacity)
                .await
        })
        .await?;

    info!("Node {}: {} runners ready", node.name, runners.len());
    Ok(NodePool {
        node: node.name.clone(),
        channel,
        runners,
    })
}

/// Provisions every node of the registry.
///
/// Returns the pools of healthy nodes; nodes failing with infrastructure
/// errors are marked degraded and left out.
///
/// # Errors
///
/// The first fatal error of any node.
pub async fn provision_all<P: ChannelProvider>(
    provider: &P,
    registry: &Registry,
    aggregator: &Aggregator,
    driver: &DriverConfig,
    device: &DeviceProfile,
) -> Result<Vec<NodePool<P::Channel>>, RegistryError> {
    let outcomes = join_all(
        registry
            .nodes()
            .iter()
            .map(|node| provision_node(provider, registry, aggregator, node, driver, device)),
    )
    .await;

    let mut pools = Vec::new();
    for (node, outcome) in registry.nodes().iter().zip(outcomes) {
        match outcome {
            Ok(pool) if pool.runners.is_empty() => {
                warn!("Node {} has no capacity; skipping it", node.name);
            }
            Ok(pool) => pools.push(pool),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => registry.mark_degraded(&node.name, e.to_string()),
        }
    }
    Ok(pools)
}

/// Shuts down (or erases) every runner of the pools; failures are logged.
pub async fn teardown_all<C: Channel>(
    pools: &[NodePool<C>],
    registry: &Registry,
    aggregator: &Aggregator,
    erase: bool,
) {
    join_all(pools.iter().map(|pool| async move {
        let _timing = aggregator.begin(Stage::Teardown, Some(&pool.node));
        for runner in &pool.runners {
            let outcome = if erase {
                registry.reset(runner, &pool.channel).await
            } else {
                registry.shutdown(runner, &pool.channel).await
            };
            if let Err(e) = outcome {
                warn!("Teardown of {} on {} failed: {}", runner.name, pool.node, e);
            }
        }
    }))
    .await;
}
