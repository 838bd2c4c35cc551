//! C9: seeds an empty routing table from a list of known endpoints so the
//! first real lookup has somewhere to start.

use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;

use krpc_encoding::{Endpoint, NodeId};
use routing_table::{DhtNode, RoutingTable};
use tokio_krpc::RequestTransport;

use crate::config::DhtConfig;
use crate::errors::{Error, ErrorKind};
use crate::lookup::Lookup;

const BOOTSTRAP_PING_WINDOW_MS: u64 = 1500;
const RANDOM_LOOKUPS: usize = 3;
const BOOTSTRAP_DEADLINE_S: u64 = 30;

/// Pings every seed, then runs `RANDOM_LOOKUPS` parallel `find_node`
/// lookups against freshly drawn random targets to pull in the seeds'
/// neighbors. Bounded by an overall `BOOTSTRAP_DEADLINE_S` timeout;
/// succeeds iff the routing table holds at least one node afterward,
/// regardless of whether the deadline or natural completion ended it.
pub async fn bootstrap(
    local_id: NodeId,
    seeds: Vec<Endpoint>,
    routing_table: &RoutingTable,
    transport: RequestTransport,
    config: &DhtConfig,
) -> Result<(), Error> {
    let _ = tokio::time::timeout(
        Duration::from_secs(BOOTSTRAP_DEADLINE_S),
        run(local_id, seeds, routing_table, transport, config),
    )
    .await;

    if routing_table.is_empty() {
        return Err(ErrorKind::BootstrapFailed.into());
    }
    Ok(())
}

async fn run(
    local_id: NodeId,
    seeds: Vec<Endpoint>,
    routing_table: &RoutingTable,
    transport: RequestTransport,
    config: &DhtConfig,
) {
    ping_seeds(local_id, &seeds, routing_table, &transport).await;

    if routing_table.is_empty() {
        return;
    }

    let mut lookups = FuturesUnordered::new();
    for _ in 0..RANDOM_LOOKUPS {
        let target = NodeId::random();
        let lookup_seeds = routing_table.closest_nodes(&target, config.k);
        lookups.push(Lookup::find_node(local_id, target, lookup_seeds, transport.clone(), config).run());
    }
    while lookups.next().await.is_some() {}
}

async fn ping_seeds(
    local_id: NodeId,
    seeds: &[Endpoint],
    routing_table: &RoutingTable,
    transport: &RequestTransport,
) {
    let window = Duration::from_millis(BOOTSTRAP_PING_WINDOW_MS);
    let mut pending = FuturesUnordered::new();
    for &endpoint in seeds {
        let transport = transport.clone();
        pending.push(async move { (endpoint, transport.ping(local_id, endpoint, window).await) });
    }
    while let Some((endpoint, result)) = pending.next().await {
        match result {
            Ok(response) => {
                routing_table.add_node(DhtNode::new(response.responder_id, endpoint));
            }
            Err(e) => log::debug!("bootstrap ping to {} failed: {}", endpoint, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_seed_list_fails_when_table_stays_empty() {
        let local_id = NodeId::random();
        let table = RoutingTable::new(local_id);
        let socket = std::sync::Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let transport = RequestTransport::new(socket, tokio_krpc::ActiveTransactions::new());
        let config = DhtConfig::default();

        let result = bootstrap(local_id, Vec::new(), &table, transport, &config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn succeeds_once_a_seed_has_already_been_added() {
        // Simulates a seed that answered a concurrent ping by the time
        // bootstrap's own (unreachable, in this test) seed pings time out:
        // bootstrap only cares whether the table is non-empty afterward.
        let local_id = NodeId::random();
        let table = RoutingTable::new(local_id);
        table.add_node(DhtNode::new(NodeId::random(), Endpoint::parse("127.0.0.1", 6881).unwrap()));
        let socket = std::sync::Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let transport = RequestTransport::new(socket, tokio_krpc::ActiveTransactions::new());
        let mut config = DhtConfig::default();
        config.lookup_deadline_ms = 50;
        config.query_timeout_ms = 20;

        let result = bootstrap(local_id, Vec::new(), &table, transport, &config).await;
        assert!(result.is_ok());
    }
}
