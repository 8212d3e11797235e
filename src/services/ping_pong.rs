// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Ping/pong liveness checking: one side answers pings with a matching
//! pong, the other tracks outstanding pings against a deadline.
//!
//! `Pingable` answers pings addressed to its endpoint; `Pinger` sends them
//! and tracks outstanding requests until a `pong` arrives or the deadline
//! passes. The split mirrors the original `pingable`/`pinger` pair, but as
//! two independent [`Service`] objects rather than mixin base classes.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::endpoint::Endpoint;
use crate::identifier::{EndpointId, Identifier, MessageId};
use crate::message::{Message, Priority, VerificationBits};
use crate::subscriber::HandlerContext;

use super::Service;

fn ping_id() -> MessageId {
    MessageId::control("ping")
}

fn pong_id() -> MessageId {
    MessageId::control("pong")
}

/// Answers `ping` with `pong`, reusing the request's sequence number so the
/// pinger can match the reply to its pending entry.
///
/// The subscribed handler only has shared access to `self`, so it stashes
/// each request in a queue that `update` later drains with full access to
/// the endpoint (needed to post the reply).
pub struct Pingable {
    received: Rc<RefCell<VecDeque<Message>>>,
    /// Called with `(pinger_id, sequence, verification)`; returning `false`
    /// suppresses the reply (e.g. for an endpoint that wants to go quiet).
    pub respond: Box<dyn FnMut(EndpointId, u64, VerificationBits) -> bool>,
}

impl Default for Pingable {
    fn default() -> Self {
        Pingable { received: Rc::new(RefCell::new(VecDeque::new())), respond: Box::new(|_, _, _| true) }
    }
}

impl Pingable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Service for Pingable {
    fn attach(&mut self, endpoint: &mut Endpoint) {
        let received = self.received.clone();
        endpoint.subscribe(
            ping_id(),
            Box::new(move |_ctx: &HandlerContext, message: &Message| {
                received.borrow_mut().push_back(message.clone());
                true
            }),
        );
    }

    fn update(&mut self, endpoint: &mut Endpoint) -> bool {
        let requests: Vec<Message> = self.received.borrow_mut().drain(..).collect();
        let mut work = false;
        for request in requests {
            let sequence = decode_ping_sequence(&request.content).unwrap_or(0);
            if (self.respond)(request.source_id, sequence, request.verification) {
                let reply_id = MessageId { class: request.id.class, method: pingable_respond_method() };
                endpoint.respond_to(&request, reply_id, request.content.clone());
                work = true;
            }
        }
        work
    }
}

struct PendingPing {
    sent_at: Instant,
    deadline: Duration,
}

/// Sends `ping` requests and tracks them until a matching `pong` arrives or
/// the per-request deadline elapses.
#[derive(Default)]
pub struct Pinger {
    pending: HashMap<(EndpointId, u64), PendingPing>,
    received: Rc<RefCell<VecDeque<Message>>>,
    responded: Vec<PingResponse>,
    timed_out: Vec<PingTimeout>,
    next_sequence: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct PingResponse {
    pub pingable_id: EndpointId,
    pub age: Duration,
    pub sequence: u64,
    pub verification: VerificationBits,
}

#[derive(Clone, Copy, Debug)]
pub struct PingTimeout {
    pub pingable_id: EndpointId,
    pub age: Duration,
    pub sequence: u64,
}

impl Pinger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends a `ping` to `target` via `endpoint`, tracked for up to `max_time`.
    pub fn ping(&mut self, endpoint: &mut Endpoint, target: EndpointId, max_time: Duration) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        endpoint.send_to(target, ping_id(), Priority::Low, sequence.to_be_bytes().to_vec());
        self.pending.insert((target, sequence), PendingPing { sent_at: Instant::now(), deadline: max_time });
    }

    pub fn has_pending_pings(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drains newly arrived `pong` replies and timed-out entries. Call once
    /// per tick after the endpoint has dispatched its incoming queue.
    pub fn poll(&mut self) -> (Vec<PingResponse>, Vec<PingTimeout>) {
        let arrived: Vec<Message> = self.received.borrow_mut().drain(..).collect();
        for message in arrived {
            if let Some(sequence) = decode_ping_sequence(&message.content) {
                self.on_pong(message.source_id, sequence, message.verification);
            }
        }
        let now = Instant::now();
        let expired: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.sent_at) >= p.deadline)
            .map(|(k, p)| (*k, p.sent_at))
            .collect();
        for (key, sent_at) in expired {
            self.pending.remove(&key);
            self.timed_out.push(PingTimeout { pingable_id: key.0, age: now.duration_since(sent_at), sequence: key.1 });
        }
        (std::mem::take(&mut self.responded), std::mem::take(&mut self.timed_out))
    }

    fn on_pong(&mut self, source: EndpointId, sequence: u64, verification: VerificationBits) {
        if let Some(pending) = self.pending.remove(&(source, sequence)) {
            self.responded.push(PingResponse { pingable_id: source, age: pending.sent_at.elapsed(), sequence, verification });
        }
    }
}

impl Service for Pinger {
    fn attach(&mut self, endpoint: &mut Endpoint) {
        let received = self.received.clone();
        endpoint.subscribe(
            pong_id(),
            Box::new(move |_ctx: &HandlerContext, message: &Message| {
                received.borrow_mut().push_back(message.clone());
                true
            }),
        );
    }
}

/// Decodes a `pong` message's originating sequence out of a raw payload
/// produced by [`Pinger::ping`] (the payload is the sequence, big-endian).
pub fn decode_ping_sequence(content: &[u8]) -> Option<u64> {
    content.get(..8).map(|b| u64::from_be_bytes(b.try_into().unwrap()))
}

/// Feeds a `pong` message into `pinger`'s bookkeeping directly, bypassing
/// the received-message queue `attach` wires up. Useful for tests that
/// drive a `Pinger` without a live endpoint/connection pair.
pub fn apply_pong(pinger: &mut Pinger, ctx: &HandlerContext, content: &[u8]) {
    if let Some(sequence) = decode_ping_sequence(content) {
        pinger.on_pong(ctx.source_id, sequence, ctx.verification);
    }
}

pub fn pingable_respond_method() -> Identifier {
    Identifier::new("pong")
}
