// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Endpoint: an addressable bus node owning outgoing queues, connections
//! and a subscriber dispatch table.

use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::config::{keys, Config};
use crate::connection::Connection;
use crate::context::Context;
use crate::identifier::{EndpointId, Identifier, MessageId};
use crate::message::{Message, Priority};
use crate::subscriber::{Handler, HandlerContext, Subscriber};

/// Connection-side identity state machine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EndpointState {
    Unassigned,
    RequestingId,
    Assigned(EndpointId),
    Retiring,
}

/// Static self-description published on discovery/topology queries.
#[derive(Clone, Debug, Default)]
pub struct SelfInfo {
    pub kind: String,
    pub display_name: String,
    pub description: String,
    pub host_id: u64,
    pub build_info: String,
    pub app_name: String,
}

const PRIORITY_COUNT: usize = 5;

fn priority_index(p: Priority) -> usize {
    p as usize
}

/// Addressable node on the bus: owns connections, per-priority outgoing
/// queues, and a subscriber handler table.
pub struct Endpoint {
    context: Rc<Context>,
    state: EndpointState,
    connections: Vec<Box<dyn Connection>>,
    outgoing: [VecDeque<Message>; PRIORITY_COUNT],
    incoming: VecDeque<(Message, crate::message::VerificationBits)>,
    subscriber: Subscriber,
    self_info: SelfInfo,
    last_assign_request: Option<Instant>,
    cert_path: Option<String>,
}

impl Endpoint {
    pub fn new(context: Rc<Context>) -> Self {
        Endpoint {
            context,
            state: EndpointState::Unassigned,
            connections: Vec::new(),
            outgoing: Default::default(),
            incoming: VecDeque::new(),
            subscriber: Subscriber::new(),
            self_info: SelfInfo::default(),
            last_assign_request: None,
            cert_path: None,
        }
    }

    /// Remembers `msgbus.endpoint.cert_path`, if set, so the own
    /// certificate is loaded from it as soon as an id is assigned (a
    /// certificate is filed under its owner's id, which an endpoint does
    /// not have until the router assigns one).
    pub fn configure_certificate(&mut self, config: &Config) {
        self.cert_path = config.get_str(keys::ENDPOINT_CERT_PATH).map(str::to_string);
        if let Some(id) = self.id() {
            self.load_certificate(id);
        }
    }

    fn load_certificate(&self, id: EndpointId) {
        let Some(path) = self.cert_path.as_deref() else { return };
        if let Err(e) = self.context.load_own_certificate(id, path) {
            debug!("endpoint {id:?} failed to load certificate from '{path}': {e}");
        }
    }

    pub fn id(&self) -> Option<EndpointId> {
        match self.state {
            EndpointState::Assigned(id) => Some(id),
            _ => None,
        }
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn set_self_info(&mut self, info: SelfInfo) {
        self.self_info = info;
    }

    pub fn self_info(&self) -> &SelfInfo {
        &self.self_info
    }

    /// Attaches an outbound connection. Messages are duplicated on every
    /// attached connection until the endpoint's id stabilises (the
    /// deduplication across connections is the router's job once it can
    /// tell which connections serve the same peer).
    pub fn add_connection(&mut self, conn: Box<dyn Connection>) {
        self.connections.push(conn);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Enqueues `message` for delivery; the target and priority already
    /// carried on `message` are used as-is.
    pub fn post(&mut self, message: Message) {
        let idx = priority_index(message.priority);
        self.outgoing[idx].push_back(message);
    }

    /// Builds and posts a message to `target` with the next sequence
    /// number for `(self, id)`.
    pub fn send_to(&mut self, target: EndpointId, id: MessageId, priority: Priority, content: Vec<u8>) {
        let Some(source) = self.id() else {
            debug!("dropping send, endpoint has no assigned id yet");
            return;
        };
        let mut message = Message::new(id, source, target, content);
        message.priority = priority;
        message.sequence = self.context.next_sequence(source, id);
        self.post(message);
    }

    pub fn broadcast(&mut self, id: MessageId, priority: Priority, content: Vec<u8>) {
        self.send_to(EndpointId::BROADCAST, id, priority, content);
    }

    /// Sends a reply to `incoming` under `reply_id` (which may use a
    /// different class/method than the request — e.g. a `StrUtilReq`
    /// request answered with a `StrUtilRes` reply), correlating by reusing
    /// its sequence number so the requester's invoker can match request to
    /// reply.
    pub fn respond_to(&mut self, incoming: &Message, reply_id: MessageId, content: Vec<u8>) {
        let Some(source) = self.id() else { return };
        let mut message = Message::new(reply_id, source, incoming.source_id, content);
        message.priority = incoming.priority;
        message.sequence = incoming.sequence;
        self.post(message);
    }

    pub fn subscribe(&mut self, id: MessageId, handler: Box<dyn Handler>) {
        self.subscriber.subscribe(id, handler);
    }

    pub fn unsubscribe(&mut self, id: MessageId) {
        self.subscriber.unsubscribe(id);
    }

    pub fn handles(&self, id: MessageId) -> bool {
        self.subscriber.handles(id)
    }

    pub fn subscribed_ids(&self) -> Vec<MessageId> {
        self.subscriber.subscribed_ids().collect()
    }

    /// Publishes any newly added/removed subscriptions as `subscribTo` /
    /// `unsubFrom` control messages.
    fn publish_subscription_changes(&mut self) {
        let added = self.subscriber.drain_subscribed();
        let removed = self.subscriber.drain_unsubscribed();
        for id in added {
            self.send_control_id("subscribTo", id);
        }
        for id in removed {
            self.send_control_id("unsubFrom", id);
        }
    }

    fn send_control_id(&mut self, method: &str, payload_id: MessageId) {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&payload_id.class.value().to_be_bytes());
        payload.extend_from_slice(&payload_id.method.value().to_be_bytes());
        self.broadcast(MessageId::control(method), Priority::Low, payload);
    }

    /// Flushes outgoing queues to every connection (highest priority
    /// first), pulls incoming frames into the pending-dispatch queue, and
    /// advances the identity state machine. Does not invoke subscriber
    /// handlers — call `process_all` for that.
    pub fn update(&mut self) -> bool {
        let mut work = false;

        if matches!(self.state, EndpointState::Unassigned) {
            self.state = EndpointState::RequestingId;
            self.last_assign_request = Some(Instant::now());
        }

        self.publish_subscription_changes();

        for conn in self.connections.iter_mut() {
            work |= conn.update();

            for p in Priority::ALL {
                let idx = priority_index(p);
                while let Some(msg) = self.outgoing[idx].front().cloned() {
                    if conn.send(msg) {
                        self.outgoing[idx].pop_front();
                        work = true;
                    } else {
                        break;
                    }
                }
            }

            let context = &self.context;
            let mut new_assignment: Option<(EndpointId, EndpointId)> = None;
            let incoming = &mut self.incoming;
            work |= conn.fetch(&mut |message: Message| {
                if message.is_special() && message.id.method == Identifier::new("assignId") && message.content.len() >= 8 {
                    let raw = u64::from_be_bytes(message.content[..8].try_into().unwrap());
                    new_assignment = Some((EndpointId(raw), message.source_id));
                    true
                } else {
                    let mut message = message;
                    context.verify(&mut message);
                    let verification = message.verification;
                    incoming.push_back((message, verification));
                    true
                }
            });
            if let Some((id, router_id)) = new_assignment {
                debug!("endpoint assigned id {:?}", id);
                self.state = EndpointState::Assigned(id);
                if let Some(path) = self.cert_path.clone() {
                    if let Err(e) = self.context.load_own_certificate(id, &path) {
                        debug!("endpoint {id:?} failed to load certificate from '{path}': {e}");
                    }
                }
                let confirm = Message::new(MessageId::control("confirmId"), id, router_id, id.0.to_be_bytes().to_vec());
                conn.send(confirm);
                work = true;
            }
        }

        self.connections.retain(|c| c.is_usable());
        work
    }

    /// Dispatches at most one buffered incoming message to subscribers.
    /// Returns `true` if a message was processed.
    pub fn process_one(&mut self) -> bool {
        let Some((message, verification)) = self.incoming.pop_front() else { return false };
        let ctx = HandlerContext { source_id: message.source_id, sequence: message.sequence, verification };
        match self.subscriber.dispatch(&ctx, &message) {
            Some(_consumed) => {}
            None => {
                trace!("no handler for {:?}, not replying unless directly queried", message.id);
            }
        }
        true
    }

    /// Dispatches every currently buffered incoming message.
    pub fn process_all(&mut self) -> usize {
        let mut n = 0;
        while self.process_one() {
            n += 1;
        }
        n
    }

    /// Requests graceful retirement; a `byeByeEndp` is sent on the next
    /// update and the endpoint stops requesting a fresh id afterward.
    pub fn retire(&mut self) {
        if let Some(_id) = self.id() {
            self.broadcast(MessageId::control("byeByeEndp"), Priority::High, Vec::new());
        }
        self.state = EndpointState::Retiring;
    }

    pub fn assign_id_pending_for(&self) -> Option<Duration> {
        self.last_assign_request.map(|t| t.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::inprocess::loopback_pair;

    #[test]
    fn post_queues_by_priority_and_flushes_on_update() {
        let ctx = Context::new();
        let mut ep = Endpoint::new(ctx);
        let (a, _b) = loopback_pair();
        ep.add_connection(Box::new(a));

        // manually assign so send_to doesn't no-op
        ep.state = EndpointState::Assigned(EndpointId(9));
        ep.send_to(EndpointId(11), MessageId::new("x", "y"), Priority::Normal, b"hi".to_vec());
        assert_eq!(1, ep.outgoing[priority_index(Priority::Normal)].len());
        ep.update();
        assert_eq!(0, ep.outgoing[priority_index(Priority::Normal)].len());
    }

    #[test]
    fn respond_to_reuses_request_sequence() {
        let ctx = Context::new();
        let mut ep = Endpoint::new(ctx);
        ep.state = EndpointState::Assigned(EndpointId(1));
        let mut incoming = Message::new(MessageId::new("StrUtilReq", "Reverse"), EndpointId(2), EndpointId(1), b"foo".to_vec());
        incoming.sequence = 77;
        ep.respond_to(&incoming, MessageId::new("StrUtilRes", "Reverse"), b"oof".to_vec());
        let queued = ep.outgoing[priority_index(Priority::Normal)].front().unwrap();
        assert_eq!(77, queued.sequence);
        assert_eq!(EndpointId(2), queued.target_id);
        assert_eq!(MessageId::new("StrUtilRes", "Reverse"), queued.id);
    }

    #[test]
    fn loads_certificate_once_an_id_is_assigned() {
        let dir = std::env::temp_dir().join(format!("relaybus-endpoint-cert-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("endpoint.pem");
        std::fs::write(&cert_path, b"-----FAKE ENDPOINT CERT-----").unwrap();

        let ctx = Context::new();
        let mut ep = Endpoint::new(ctx.clone());
        let (conn, mut router_side) = loopback_pair();
        ep.add_connection(Box::new(conn));

        let mut config = Config::new();
        config.set(keys::ENDPOINT_CERT_PATH, cert_path.to_str().unwrap());
        ep.configure_certificate(&config);
        assert!(ctx.own_certificate().is_none(), "nothing to load a certificate under before an id is assigned");

        let mut payload = EndpointId(42).0.to_be_bytes().to_vec();
        payload.push(0);
        let router_id = EndpointId(1);
        router_side.send(Message::new(MessageId::control("assignId"), router_id, EndpointId::BROADCAST, payload));
        ep.update();

        assert_eq!(Some(EndpointId(42)), ep.id());
        let cert = ctx.own_certificate().expect("certificate should have been loaded once an id was assigned");
        assert_eq!(EndpointId(42), cert.owner);
        assert_eq!(b"-----FAKE ENDPOINT CERT-----".to_vec(), cert.pem);

        let _ = std::fs::remove_file(&cert_path);
        let _ = std::fs::remove_dir(&dir);
    }
}
