//! Per-node health checking. Each node of a group gets its own probe task
//! that gates the node's membership in the group balancer.

use std::sync::{Arc, Weak};

use reqwest::StatusCode;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::proxy::upstream::{Node, NodeGroup};

/// Spawns the periodic health checker for a node. The task holds only a weak
/// handle to the group, so dropping the group ends the task on its own; it is
/// aborted explicitly when the node is deleted.
pub(crate) fn spawn_probe(group: Weak<NodeGroup>, node: Arc<Node>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = match group.upgrade() {
            Some(group) => group.health_check.interval,
            None => return,
        };
        // first probe fires one full interval after the node is added
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let Some(group) = group.upgrade() else {
                return;
            };
            probe_once(&group, &node).await;
        }
    })
}

/// One health check round: probe the node, then apply the edge-triggered
/// healthy/unhealthy transition on the group balancer.
async fn probe_once(group: &Arc<NodeGroup>, node: &Arc<Node>) {
    let scheme = if group.https { "https" } else { "http" };
    let path = &group.health_check.path;
    let url = if path.starts_with('/') {
        format!("{}://{}{}", scheme, node.key, path)
    } else {
        format!("{}://{}/{}", scheme, node.key, path)
    };

    let outcome = group
        .client
        .get(&url)
        .timeout(group.health_check.timeout)
        .send()
        .await;
    if let Err(err) = &outcome {
        debug!("health check request to {} failed: {}", node.key, err);
    }
    let passed = matches!(&outcome, Ok(res) if res.status() == StatusCode::OK);

    // The roundtrip takes a while and the node may have been deleted from the
    // group meanwhile. Re-check membership, and hold the group and node locks
    // through the transition so deletion cannot interleave with the balancer
    // update.
    let nodes = group.nodes.read();
    if !nodes.contains_key(&node.key) {
        return;
    }

    let mut state = node.state.lock();
    if state.healthy && !passed {
        state.healthy = false;
        group.balancer.remove_node(&node.key);
        warn!("node {} is unhealthy", node.key);
    } else if !state.healthy && passed {
        state.healthy = true;
        group.balancer.add_node(node.clone());
        info!("node {} is healthy", node.key);
    }
}
