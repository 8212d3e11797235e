// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Node tracker: composes discovery, topology, statistics and ping/pong
//! into a live map of remote bus nodes (host id, instance id,
//! responsiveness, known message kinds).
//!
//! The original composes these via `require_services` mixins and a large
//! `remote_node_tracker` state machine; here each building block is its own
//! [`Service`] and the tracker just owns one of each plus periodic timers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::endpoint::Endpoint;
use crate::identifier::{EndpointId, MessageId};

use super::discovery::{DiscoveryEvent, SubscriberDiscovery};
use super::ping_pong::Pinger;
use super::statistics::StatisticsTracker;
use super::topology::{NodeKind, TopologyTracker};
use super::Service;

/// Everything the tracker currently knows about one remote node.
#[derive(Clone, Debug, Default)]
pub struct RemoteNode {
    pub kind: Option<NodeKind>,
    pub subscriptions: Vec<MessageId>,
    pub last_seen: Option<Instant>,
    pub responsive: bool,
}

const TOPOLOGY_QUERY_INTERVAL: Duration = Duration::from_secs(30);
const STATS_QUERY_INTERVAL: Duration = Duration::from_secs(10);

pub struct NodeTracker {
    discovery: SubscriberDiscovery,
    topology: TopologyTracker,
    statistics: StatisticsTracker,
    pinger: Pinger,
    nodes: HashMap<EndpointId, RemoteNode>,
    last_topology_query: Option<Instant>,
    last_stats_query: Option<Instant>,
}

impl Default for NodeTracker {
    fn default() -> Self {
        NodeTracker {
            discovery: SubscriberDiscovery::new(),
            topology: TopologyTracker::new(),
            statistics: StatisticsTracker::new(),
            pinger: Pinger::new(),
            nodes: HashMap::new(),
            last_topology_query: None,
            last_stats_query: None,
        }
    }
}

impl NodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: EndpointId) -> Option<&RemoteNode> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&EndpointId, &RemoteNode)> {
        self.nodes.iter()
    }

    fn should_query_topology(&self) -> bool {
        self.last_topology_query.map_or(true, |t| t.elapsed() >= TOPOLOGY_QUERY_INTERVAL)
    }

    fn should_query_stats(&self) -> bool {
        self.last_stats_query.map_or(true, |t| t.elapsed() >= STATS_QUERY_INTERVAL)
    }

    fn absorb_discovery(&mut self) {
        for event in self.discovery.drain_events() {
            match event {
                DiscoveryEvent::Alive(info) => {
                    let node = self.nodes.entry(info.endpoint_id).or_default();
                    node.last_seen = Some(Instant::now());
                    node.responsive = true;
                }
                DiscoveryEvent::Subscribed(info, id) => {
                    let node = self.nodes.entry(info.endpoint_id).or_default();
                    if !node.subscriptions.contains(&id) {
                        node.subscriptions.push(id);
                    }
                }
                DiscoveryEvent::Unsubscribed(info, id) => {
                    if let Some(node) = self.nodes.get_mut(&info.endpoint_id) {
                        node.subscriptions.retain(|x| *x != id);
                    }
                }
                DiscoveryEvent::NotSubscribed(_, _) => {}
            }
        }
    }

    fn absorb_topology(&mut self) {
        for info in self.topology.drain() {
            let node = self.nodes.entry(info.peer_id).or_default();
            node.kind = Some(info.kind);
        }
    }

    fn absorb_pings(&mut self) {
        let (responded, timed_out) = self.pinger.poll();
        for r in responded {
            let node = self.nodes.entry(r.pingable_id).or_default();
            node.responsive = true;
            node.last_seen = Some(Instant::now());
        }
        for t in timed_out {
            if let Some(node) = self.nodes.get_mut(&t.pingable_id) {
                node.responsive = false;
            }
        }
    }
}

impl Service for NodeTracker {
    fn attach(&mut self, endpoint: &mut Endpoint) {
        self.discovery.attach(endpoint);
        self.topology.attach(endpoint);
        self.statistics.attach(endpoint);
        self.pinger.attach(endpoint);
    }

    fn update(&mut self, endpoint: &mut Endpoint) -> bool {
        let mut work = false;
        if self.should_query_topology() {
            self.topology.discover(endpoint);
            self.last_topology_query = Some(Instant::now());
            work = true;
        }
        if self.should_query_stats() {
            self.statistics.query(endpoint);
            self.last_stats_query = Some(Instant::now());
            work = true;
        }
        work |= self.discovery.update(endpoint);
        work |= self.topology.update(endpoint);
        work |= self.statistics.update(endpoint);
        self.absorb_discovery();
        self.absorb_topology();
        self.absorb_pings();
        work
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::ProcessInstanceId;

    #[test]
    fn discovery_events_populate_node_table() {
        let mut tracker = NodeTracker::new();
        let ep = EndpointId(7);
        tracker.discovery.on_still_alive(ep, ProcessInstanceId(1), 1);
        tracker.discovery.on_subscribed(ep, 1, MessageId::new("a", "b"));
        tracker.absorb_discovery();

        let node = tracker.node(ep).unwrap();
        assert!(node.responsive);
        assert_eq!(1, node.subscriptions.len());
    }

    #[test]
    fn topology_response_records_node_kind() {
        let mut tracker = NodeTracker::new();
        tracker.topology.on_response(NodeKind::Bridge, EndpointId(1), &EndpointId(9).0.to_be_bytes());
        tracker.absorb_topology();
        assert_eq!(Some(NodeKind::Bridge), tracker.node(EndpointId(9)).unwrap().kind);
    }
}
