// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Network topology discovery: issues `topoQuery` and collects the
//! `topoRutrCn` / `topoBrdgCn` / `topoEndpt` responses.
//!
//! The router already answers `topoQuery` directly (see
//! [`crate::router::Router::answer_topology`]); this module is the
//! requester side, run from an endpoint that wants to map the network.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::endpoint::Endpoint;
use crate::identifier::{EndpointId, Identifier, MessageId};
use crate::message::{Message, Priority};

use super::Service;

fn query_id() -> MessageId {
    MessageId::control("topoQuery")
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeKind {
    Router,
    Bridge,
    Endpoint,
}

#[derive(Clone, Copy, Debug)]
pub struct TopologyInfo {
    pub kind: NodeKind,
    /// The responding router/bridge's own id.
    pub reporter_id: EndpointId,
    /// The peer id carried in the response payload.
    pub peer_id: EndpointId,
}

/// Broadcasts `topoQuery` and accumulates every topology response received
/// since the last drain.
#[derive(Default)]
pub struct TopologyTracker {
    observed: Vec<TopologyInfo>,
    received: Rc<RefCell<VecDeque<Message>>>,
}

impl TopologyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discover(&mut self, endpoint: &mut Endpoint) {
        endpoint.broadcast(query_id(), Priority::Low, Vec::new());
    }

    pub fn on_response(&mut self, kind: NodeKind, reporter_id: EndpointId, payload: &[u8]) {
        if payload.len() < 8 {
            return;
        }
        let peer_id = EndpointId(u64::from_be_bytes(payload[..8].try_into().unwrap()));
        self.observed.push(TopologyInfo { kind, reporter_id, peer_id });
    }

    pub fn drain(&mut self) -> Vec<TopologyInfo> {
        std::mem::take(&mut self.observed)
    }

    pub fn router_count(&self) -> usize {
        self.observed.iter().filter(|i| i.kind == NodeKind::Router).count()
    }

    pub fn bridge_count(&self) -> usize {
        self.observed.iter().filter(|i| i.kind == NodeKind::Bridge).count()
    }

    pub fn endpoint_count(&self) -> usize {
        self.observed.iter().filter(|i| i.kind == NodeKind::Endpoint).count()
    }
}

impl Service for TopologyTracker {
    fn attach(&mut self, endpoint: &mut Endpoint) {
        for method in ["topoRutrCn", "topoBrdgCn", "topoEndpt"] {
            let received = self.received.clone();
            endpoint.subscribe(
                MessageId::control(method),
                Box::new(move |_ctx: &crate::subscriber::HandlerContext, message: &Message| {
                    received.borrow_mut().push_back(message.clone());
                    true
                }),
            );
        }
    }

    fn update(&mut self, _endpoint: &mut Endpoint) -> bool {
        let messages: Vec<Message> = self.received.borrow_mut().drain(..).collect();
        let work = !messages.is_empty();
        for message in messages {
            let kind = if message.id.method == Identifier::new("topoRutrCn") {
                NodeKind::Router
            } else if message.id.method == Identifier::new("topoBrdgCn") {
                NodeKind::Bridge
            } else {
                NodeKind::Endpoint
            };
            self.on_response(kind, message.source_id, &message.content);
        }
        work
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_are_classified_and_counted() {
        let mut tracker = TopologyTracker::new();
        tracker.on_response(NodeKind::Router, EndpointId(1), &EndpointId(2).0.to_be_bytes());
        tracker.on_response(NodeKind::Bridge, EndpointId(1), &EndpointId(3).0.to_be_bytes());
        tracker.on_response(NodeKind::Endpoint, EndpointId(1), &EndpointId(4).0.to_be_bytes());
        tracker.on_response(NodeKind::Endpoint, EndpointId(1), &EndpointId(5).0.to_be_bytes());

        assert_eq!(1, tracker.router_count());
        assert_eq!(1, tracker.bridge_count());
        assert_eq!(2, tracker.endpoint_count());
        assert_eq!(4, tracker.drain().len());
        assert_eq!(0, tracker.router_count());
    }
}
