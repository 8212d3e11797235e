// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Statistics query/response: issues `statsQuery` and decodes `statsRutr` /
//! `statsBrdg` / `statsEndpt` / `statsConn` replies.
//!
//! The reply payload layout (forwarded, dropped, mean age ms, max idle
//! streak — four big-endian `u64`s) matches
//! [`crate::router::Router::answer_stats`] and
//! [`crate::bridge::BridgeStats`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::endpoint::Endpoint;
use crate::identifier::{EndpointId, MessageId};
use crate::message::{Message, Priority};

use super::Service;

fn query_id() -> MessageId {
    MessageId::control("statsQuery")
}

/// Decoded flow counters for one reporting node.
#[derive(Clone, Copy, Debug)]
pub struct FlowStats {
    pub reporter_id: EndpointId,
    pub forwarded: u64,
    pub dropped: u64,
    pub mean_age_ms: u64,
    pub max_idle_streak: u64,
}

pub fn decode_flow_stats(reporter_id: EndpointId, payload: &[u8]) -> Option<FlowStats> {
    if payload.len() < 32 {
        return None;
    }
    let forwarded = u64::from_be_bytes(payload[0..8].try_into().ok()?);
    let dropped = u64::from_be_bytes(payload[8..16].try_into().ok()?);
    let mean_age_ms = u64::from_be_bytes(payload[16..24].try_into().ok()?);
    let max_idle_streak = u64::from_be_bytes(payload[24..32].try_into().ok()?);
    Some(FlowStats { reporter_id, forwarded, dropped, mean_age_ms, max_idle_streak })
}

/// Broadcasts `statsQuery` and accumulates every decoded reply.
#[derive(Default)]
pub struct StatisticsTracker {
    replies: Vec<FlowStats>,
    received: Rc<RefCell<VecDeque<Message>>>,
}

impl StatisticsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(&mut self, endpoint: &mut Endpoint) {
        endpoint.broadcast(query_id(), Priority::Low, Vec::new());
    }

    pub fn on_reply(&mut self, reporter_id: EndpointId, payload: &[u8]) {
        if let Some(stats) = decode_flow_stats(reporter_id, payload) {
            self.replies.push(stats);
        }
    }

    pub fn drain(&mut self) -> Vec<FlowStats> {
        std::mem::take(&mut self.replies)
    }
}

impl Service for StatisticsTracker {
    fn attach(&mut self, endpoint: &mut Endpoint) {
        for method in ["statsRutr", "statsBrdg", "statsEndpt", "statsConn"] {
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
            self.on_reply(message.source_id, &message.content);
        }
        work
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_and_accumulates_replies() {
        let mut tracker = StatisticsTracker::new();
        let mut payload = Vec::new();
        payload.extend_from_slice(&100u64.to_be_bytes());
        payload.extend_from_slice(&3u64.to_be_bytes());
        payload.extend_from_slice(&12u64.to_be_bytes());
        payload.extend_from_slice(&0u64.to_be_bytes());
        tracker.on_reply(EndpointId(1), &payload);
        let replies = tracker.drain();
        assert_eq!(1, replies.len());
        assert_eq!(100, replies[0].forwarded);
        assert_eq!(3, replies[0].dropped);
    }

    #[test]
    fn short_payload_is_ignored() {
        assert!(decode_flow_stats(EndpointId(1), &[1, 2, 3]).is_none());
    }
}
