// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Router: local message switch. Accepts connections, assigns endpoint
//! ids, forwards user messages by subscription/target, and answers
//! control-plane queries.
//!
//! Links live in a slab (`Vec<Option<Link>>`) addressed by index, an
//! arena-with-indices layout that sidesteps the cyclic connection/subscriber
//! ownership a router would otherwise need.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::blob::BlobManipulator;
use crate::config::{keys, Config};
use crate::connection::{Acceptor, Connection};
use crate::context::Context;
use crate::identifier::{EndpointId, GlobalIdSequence, Identifier, MessageId};
use crate::message::{Message, Priority};
use crate::services::shutdown::{self, ShutdownPolicy, ShutdownTarget};
use crate::setup::Setup;

const PENDING_TIMEOUT: Duration = Duration::from_secs(30);
const OUTDATED_TIMEOUT: Duration = Duration::from_secs(60);
const DISCONNECTED_SHADOW: Duration = Duration::from_secs(60);
const NO_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const STATS_UPDATE_INTERVAL: Duration = Duration::from_secs(5);
const ID_BLOCK_SIZE: u64 = 4096;

type LinkId = usize;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkRole {
    Endpoint,
    Bridge,
    ParentRouter,
}

#[derive(Clone, Debug, Default)]
struct SubscriptionTable {
    known: Option<HashSet<MessageId>>,
    blocked: HashSet<MessageId>,
}

impl SubscriptionTable {
    fn allow(&mut self, id: MessageId) {
        self.known.get_or_insert_with(HashSet::new).insert(id);
        self.blocked.remove(&id);
    }

    fn disallow(&mut self, id: MessageId) {
        if let Some(known) = self.known.as_mut() {
            known.remove(&id);
        }
    }

    fn block(&mut self, id: MessageId) {
        self.blocked.insert(id);
    }

    fn wants(&self, id: MessageId) -> bool {
        if self.blocked.contains(&id) {
            return false;
        }
        match &self.known {
            Some(known) => known.contains(&id),
            None => true,
        }
    }

    fn reset(&mut self) {
        self.known = None;
        self.blocked.clear();
    }
}

struct Link {
    connection: Box<dyn Connection>,
    endpoint_id: Option<EndpointId>,
    role: LinkRole,
    subscriptions: SubscriptionTable,
    pending_since: Option<Instant>,
}

struct EndpointInfo {
    link_id: LinkId,
    instance_nonce: Option<u32>,
    last_seen: Instant,
}

#[derive(Default, Clone, Copy, Debug)]
pub struct DirectionStats {
    pub forwarded: u64,
    pub dropped: u64,
    age_sum_ms: u64,
    age_count: u64,
    pub max_idle_streak: u64,
}

impl DirectionStats {
    pub fn mean_age_ms(&self) -> f64 {
        if self.age_count == 0 {
            0.0
        } else {
            self.age_sum_ms as f64 / self.age_count as f64
        }
    }

    fn record_age(&mut self, age_ms: u64) {
        self.age_sum_ms += age_ms;
        self.age_count += 1;
    }
}

/// Local message switch: the hardest and most intricate component of the
/// bus.
pub struct Router {
    own_id: EndpointId,
    context: Rc<Context>,
    id_base: u64,
    next_id: u64,
    links: Vec<Option<Link>>,
    endpoints: HashMap<EndpointId, EndpointInfo>,
    disconnected: HashMap<EndpointId, Instant>,
    acceptors: Vec<Box<dyn Acceptor>>,
    blob: BlobManipulator,
    stats: DirectionStats,
    idle_streak: u64,
    last_activity: Instant,
    last_tick: Instant,
    last_stats_update: Instant,
    shutdown: ShutdownTarget,
    keep_running: bool,
}

impl Router {
    pub fn new(context: Rc<Context>, id_sequence: &GlobalIdSequence) -> Self {
        let id_base = id_sequence.reserve_block(ID_BLOCK_SIZE);
        let own_id = EndpointId(id_base);
        Router {
            own_id,
            context,
            id_base: id_base + 1,
            next_id: id_base + 1,
            links: Vec::new(),
            endpoints: HashMap::new(),
            disconnected: HashMap::new(),
            acceptors: Vec::new(),
            blob: BlobManipulator::new(),
            stats: DirectionStats::default(),
            idle_streak: 0,
            last_activity: Instant::now(),
            last_tick: Instant::now(),
            last_stats_update: Instant::now(),
            shutdown: ShutdownTarget::new(ShutdownPolicy::default()),
            keep_running: false,
        }
    }

    /// Builds a router from `msgbus.router.*` config: shutdown policy
    /// (`shutdown.{verify,max_age,delay}`, `keep_running`) and, if
    /// `msgbus.router.address` names a reachable scheme, a bound acceptor
    /// for it.
    pub fn from_config(context: Rc<Context>, id_sequence: &GlobalIdSequence, config: &Config) -> Self {
        let mut router = Router::new(context, id_sequence);
        router.shutdown = ShutdownTarget::new(ShutdownPolicy {
            verify: config.get_bool(keys::ROUTER_SHUTDOWN_VERIFY, false),
            max_age: config.get_duration_ms(keys::ROUTER_SHUTDOWN_MAX_AGE, Duration::from_secs(2)),
            delay: config.get_duration_ms(keys::ROUTER_SHUTDOWN_DELAY, Duration::ZERO),
        });
        router.keep_running = config.get_bool(keys::ROUTER_KEEP_RUNNING, false);
        if let Some(address) = config.get_str(keys::ROUTER_ADDRESS) {
            match Setup::from_config(config).setup_acceptor(address) {
                Ok(acceptor) => router.add_acceptor(acceptor),
                Err(e) => warn!("router could not bind '{address}': {e}"),
            }
        }
        if let Some(path) = config.get_str(keys::ROUTER_CERT_PATH) {
            if let Err(e) = router.context.load_own_certificate(router.own_id, path) {
                warn!("router could not load certificate from '{path}': {e}");
            }
        }
        router
    }

    /// Whether a policy-accepted `shutdown` request's delay has elapsed
    /// and the router should now stop. `update()` drives the countdown.
    pub fn wants_shutdown(&self) -> bool {
        matches!(self.shutdown.state(), crate::services::shutdown::ShutdownState::ShuttingDown)
    }

    pub fn own_id(&self) -> EndpointId {
        self.own_id
    }

    pub fn add_acceptor(&mut self, acceptor: Box<dyn Acceptor>) {
        self.acceptors.push(acceptor);
    }

    fn next_endpoint_id(&mut self) -> EndpointId {
        let id = EndpointId(self.next_id);
        self.next_id += 1;
        if self.next_id >= self.id_base + ID_BLOCK_SIZE {
            warn!("router exhausted its id block, wrapping (should reserve a fresh block)");
            self.next_id = self.id_base;
        }
        id
    }

    fn insert_link(&mut self, link: Link) -> LinkId {
        if let Some(slot) = self.links.iter().position(Option::is_none) {
            self.links[slot] = Some(link);
            slot
        } else {
            self.links.push(Some(link));
            self.links.len() - 1
        }
    }

    /// Registers a newly accepted connection as a pending link and sends
    /// it `assignId` immediately.
    pub fn accept_connection(&mut self, connection: Box<dyn Connection>, role: LinkRole) {
        let new_id = self.next_endpoint_id();
        let link = Link {
            connection,
            endpoint_id: None,
            role,
            subscriptions: SubscriptionTable::default(),
            pending_since: Some(Instant::now()),
        };
        let link_id = self.insert_link(link);
        let mut payload = new_id.0.to_be_bytes().to_vec();
        payload.push(match role {
            LinkRole::Endpoint => 0,
            LinkRole::Bridge => 1,
            LinkRole::ParentRouter => 2,
        });
        self.send_on_link(link_id, MessageId::control("assignId"), payload);
        debug!("router offering id {:?} to new link {}", new_id, link_id);
    }

    fn send_on_link(&mut self, link_id: LinkId, id: MessageId, content: Vec<u8>) {
        let Some(Some(link)) = self.links.get_mut(link_id) else { return };
        let mut message = Message::new(id, self.own_id, EndpointId::BROADCAST, content);
        message.priority = Priority::High;
        link.connection.send(message);
    }

    /// Drives acceptors, every link's I/O, and control-plane/forwarding
    /// logic for one tick. Returns whether any work was done.
    pub fn update(&mut self) -> bool {
        let mut work = false;
        let elapsed = self.last_tick.elapsed();
        self.last_tick = Instant::now();

        let mut new_conns = Vec::new();
        for acceptor in self.acceptors.iter_mut() {
            while let Some(conn) = acceptor.update() {
                new_conns.push(conn);
            }
        }
        for conn in new_conns {
            self.accept_connection(conn, LinkRole::Endpoint);
            work = true;
        }

        self.expire_pending();
        self.expire_disconnected();
        self.expire_outdated();

        let link_ids: Vec<LinkId> = (0..self.links.len()).filter(|i| self.links[*i].is_some()).collect();
        let mut inbound: Vec<(LinkId, Message)> = Vec::new();

        for &link_id in &link_ids {
            let Some(Some(link)) = self.links.get_mut(link_id) else { continue };
            work |= link.connection.update();
            work |= self.blob.update_outgoing(self.own_id, link.connection.as_mut());

            let mut frames = Vec::new();
            link.connection.fetch(&mut |m| {
                frames.push(m);
                true
            });
            for m in frames {
                inbound.push((link_id, m));
            }
        }

        for (link_id, mut message) in inbound {
            work = true;
            self.note_source(link_id, &message);
            if message.is_special() {
                self.handle_control(link_id, &mut message, elapsed);
            } else {
                self.forward_user_message(link_id, message, elapsed);
            }
        }

        self.links.retain_mut(|slot| {
            if let Some(link) = slot {
                if !link.connection.is_usable() {
                    if let Some(id) = link.endpoint_id {
                        self.disconnected.insert(id, Instant::now());
                        self.endpoints.remove(&id);
                    }
                    return false;
                }
            }
            true
        });

        work |= self.shutdown.poll();

        if work {
            self.idle_streak = 0;
            self.last_activity = Instant::now();
        } else {
            self.idle_streak += 1;
            self.stats.max_idle_streak = self.stats.max_idle_streak.max(self.idle_streak);
        }

        work
    }

    fn note_source(&mut self, link_id: LinkId, message: &Message) {
        if message.source_id.is_broadcast() {
            return;
        }
        let nonce_hint = if message.id.method == Identifier::new("stillAlive") && message.content.len() == 4 {
            Some(u32::from_be_bytes(message.content[..4].try_into().unwrap()))
        } else {
            None
        };
        let entry = self.endpoints.entry(message.source_id).or_insert_with(|| EndpointInfo {
            link_id,
            instance_nonce: nonce_hint,
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
        if let Some(nonce) = nonce_hint {
            if entry.instance_nonce != Some(nonce) {
                entry.instance_nonce = Some(nonce);
                if let Some(Some(link)) = self.links.get_mut(link_id) {
                    link.subscriptions.reset();
                }
            }
        }
    }

    fn handle_control(&mut self, link_id: LinkId, message: &mut Message, elapsed: Duration) {
        let method = message.id.method;
        if method == Identifier::new("confirmId") {
            self.handle_confirm_id(link_id, message);
        } else if method == Identifier::new("subscribTo") {
            if let Some(id) = decode_message_id(&message.content) {
                if let Some(Some(link)) = self.links.get_mut(link_id) {
                    link.subscriptions.allow(id);
                }
            }
        } else if method == Identifier::new("unsubFrom") {
            if let Some(id) = decode_message_id(&message.content) {
                if let Some(Some(link)) = self.links.get_mut(link_id) {
                    link.subscriptions.disallow(id);
                }
            }
        } else if method == Identifier::new("notSubTo") {
            if let Some(id) = decode_message_id(&message.content) {
                if let Some(Some(link)) = self.links.get_mut(link_id) {
                    link.subscriptions.block(id);
                }
            }
        } else if method == Identifier::new("ping") && message.target_id == self.own_id {
            self.send_on_link(link_id, MessageId::control("pong"), Vec::new());
            return;
        } else if method == Identifier::new("topoQuery") {
            self.answer_topology(link_id);
        } else if method == Identifier::new("statsQuery") {
            self.answer_stats(link_id);
        } else if method == Identifier::new("qrySubscrb") && message.target_id == self.own_id {
            if let Some(id) = decode_message_id(&message.content) {
                self.answer_subscribers(link_id, id);
            }
            return;
        } else if method == Identifier::new("qrySubscrp") && message.target_id == self.own_id {
            self.answer_handled(link_id);
            return;
        } else if method == Identifier::new("qryCert") && message.target_id == self.own_id {
            self.answer_certificate(link_id, message.source_id);
            return;
        } else if method == Identifier::new("shutdown") && message.target_id == self.own_id {
            self.handle_shutdown(message);
            return;
        } else if (method == Identifier::new("blobFrgmnt") || method == Identifier::new("blobResend")) && message.target_id == self.own_id {
            if let Some(reply) = self.blob.handle_control(message) {
                if let Some(Some(link)) = self.links.get_mut(link_id) {
                    link.connection.send(reply);
                }
            }
            return;
        } else if method.to_name().starts_with("byeBye") {
            if let Some(Some(link)) = self.links.get_mut(link_id) {
                if let Some(id) = link.endpoint_id {
                    self.disconnected.insert(id, Instant::now());
                }
            }
        }

        // most control messages are both handled locally and forwarded one hop
        self.forward_user_message(link_id, message.clone(), elapsed);
    }

    fn handle_confirm_id(&mut self, link_id: LinkId, message: &Message) {
        if message.content.len() < 8 {
            return;
        }
        let id = EndpointId(u64::from_be_bytes(message.content[..8].try_into().unwrap()));
        if let Some(Some(link)) = self.links.get_mut(link_id) {
            link.endpoint_id = Some(id);
            link.pending_since = None;
        }
        self.endpoints.insert(id, EndpointInfo { link_id, instance_nonce: None, last_seen: Instant::now() });
        self.disconnected.remove(&id);
        info!("router confirmed endpoint {:?} on link {}", id, link_id);
    }

    fn answer_topology(&mut self, requester_link: LinkId) {
        let mut endpt = Vec::new();
        let mut rutr = Vec::new();
        let mut brdg = Vec::new();
        for slot in self.links.iter().flatten() {
            let Some(id) = slot.endpoint_id else { continue };
            match slot.role {
                LinkRole::Endpoint => endpt.push(id),
                LinkRole::Bridge => brdg.push(id),
                LinkRole::ParentRouter => rutr.push(id),
            }
        }
        for id in endpt {
            self.send_on_link(requester_link, MessageId::control("topoEndpt"), id.0.to_be_bytes().to_vec());
        }
        for id in rutr {
            self.send_on_link(requester_link, MessageId::control("topoRutrCn"), id.0.to_be_bytes().to_vec());
        }
        for id in brdg {
            self.send_on_link(requester_link, MessageId::control("topoBrdgCn"), id.0.to_be_bytes().to_vec());
        }
    }

    fn answer_stats(&mut self, requester_link: LinkId) {
        let mut payload = Vec::with_capacity(32);
        payload.extend_from_slice(&self.stats.forwarded.to_be_bytes());
        payload.extend_from_slice(&self.stats.dropped.to_be_bytes());
        payload.extend_from_slice(&(self.stats.mean_age_ms() as u64).to_be_bytes());
        payload.extend_from_slice(&self.stats.max_idle_streak.to_be_bytes());
        self.send_on_link(requester_link, MessageId::control("statsRutr"), payload);
    }

    /// Answers `qrySubscrb(msg_id)` from the router's own per-link
    /// subscription cache, not by asking the actual subscribers.
    fn answer_subscribers(&mut self, requester_link: LinkId, msg_id: MessageId) {
        let subscribers: Vec<EndpointId> = self
            .links
            .iter()
            .filter_map(|slot| slot.as_ref())
            .filter(|link| link.subscriptions.wants(msg_id))
            .filter_map(|link| link.endpoint_id)
            .collect();
        for id in subscribers {
            self.send_on_link(requester_link, MessageId::control("subHandlr"), id.0.to_be_bytes().to_vec());
        }
    }

    /// Answers `qrySubscrp` (what do you handle) with the union of message
    /// ids explicitly known across every link's cached subscription table.
    fn answer_handled(&mut self, requester_link: LinkId) {
        let mut known: HashSet<MessageId> = HashSet::new();
        for link in self.links.iter().filter_map(|slot| slot.as_ref()) {
            if let Some(ids) = &link.subscriptions.known {
                known.extend(ids.iter().copied());
            }
        }
        for id in known {
            let mut payload = id.class.value().to_be_bytes().to_vec();
            payload.extend_from_slice(&id.method.value().to_be_bytes());
            self.send_on_link(requester_link, MessageId::control("subHandld"), payload);
        }
    }

    /// Answers a certificate query with the router's own certificate
    /// bytes, or drops it silently if none has been configured.
    fn answer_certificate(&mut self, requester_link: LinkId, _requester: EndpointId) {
        if let Some(cert) = self.context.own_certificate() {
            self.send_on_link(requester_link, MessageId::control("certRutr"), cert.pem);
        }
    }

    /// Decodes a `shutdown` request addressed to the router itself and
    /// hands it to its policy-gated `ShutdownTarget` (`msgbus.router.keep_running`
    /// vetoes unconditionally, `shutdown.{verify,max_age}` gate acceptance).
    fn handle_shutdown(&mut self, message: &Message) {
        let now_ms = shutdown::now_millis();
        let verified = shutdown::verification_ok(message.verification);
        if let Some(request) = shutdown::decode_request(&message.content, message.source_id, now_ms, verified) {
            self.shutdown.handle_request(self.keep_running, request);
        }
    }

    /// Forwarding algorithm for a user (or control-but-also-forwarded)
    /// message received on `from_link`: age/hop-count check, then
    /// broadcast-by-subscription or targeted delivery.
    fn forward_user_message(&mut self, from_link: LinkId, mut message: Message, elapsed: Duration) {
        if !message.forward_hop(elapsed) {
            self.stats.dropped += 1;
            warn!("dropping message {:?}, hop count exceeded", message.id);
            return;
        }
        self.stats.record_age(message.age_ms);

        if message.target_id.is_broadcast() {
            let targets: Vec<LinkId> = self
                .links
                .iter()
                .enumerate()
                .filter(|(i, slot)| *i != from_link && slot.as_ref().is_some_and(|l| l.subscriptions.wants(message.id)))
                .map(|(i, _)| i)
                .collect();
            for link_id in targets {
                if let Some(Some(link)) = self.links.get_mut(link_id) {
                    if link.connection.send(message.clone()) {
                        self.stats.forwarded += 1;
                    }
                }
            }
            return;
        }

        if self.disconnected.contains_key(&message.target_id) {
            self.stats.dropped += 1;
            return;
        }

        let Some(info) = self.endpoints.get(&message.target_id) else {
            self.stats.dropped += 1;
            return;
        };
        let target_link = info.link_id;
        if let Some(Some(link)) = self.links.get_mut(target_link) {
            if link.connection.send(message) {
                self.stats.forwarded += 1;
            }
        }
    }

    fn expire_pending(&mut self) {
        let now = Instant::now();
        for slot in self.links.iter_mut() {
            if let Some(link) = slot {
                if link.pending_since.is_some_and(|t| now.duration_since(t) > PENDING_TIMEOUT) {
                    link.connection.cleanup();
                }
            }
        }
    }

    fn expire_disconnected(&mut self) {
        let now = Instant::now();
        self.disconnected.retain(|_, since| now.duration_since(*since) < DISCONNECTED_SHADOW);
    }

    fn expire_outdated(&mut self) {
        let now = Instant::now();
        self.endpoints.retain(|_, info| now.duration_since(info.last_seen) < OUTDATED_TIMEOUT);
    }

    /// Whether the router has had no connections for `no_connection_timeout`
    /// and may report itself done.
    pub fn is_done(&self) -> bool {
        self.links.iter().all(Option::is_none) && self.last_activity.elapsed() > NO_CONNECTION_TIMEOUT
    }

    pub fn stats(&self) -> DirectionStats {
        self.stats
    }

    pub fn should_publish_stats(&self) -> bool {
        self.last_stats_update.elapsed() >= STATS_UPDATE_INTERVAL
    }

    pub fn mark_stats_published(&mut self) {
        self.last_stats_update = Instant::now();
    }

    pub fn link_count(&self) -> usize {
        self.links.iter().filter(|l| l.is_some()).count()
    }
}

fn decode_message_id(payload: &[u8]) -> Option<MessageId> {
    if payload.len() < 16 {
        return None;
    }
    let class = u64::from_be_bytes(payload[0..8].try_into().ok()?);
    let method = u64::from_be_bytes(payload[8..16].try_into().ok()?);
    Some(MessageId { class: Identifier::from_raw(class), method: Identifier::from_raw(method) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::inprocess::loopback_pair;

    fn confirm(router: &mut Router, link_id: LinkId, id: EndpointId) {
        let mut msg = Message::new(MessageId::control("confirmId"), id, router.own_id(), id.0.to_be_bytes().to_vec());
        msg.sequence = 0;
        router.handle_confirm_id(link_id, &msg);
    }

    #[test]
    fn broadcast_delivers_only_to_subscribed_non_source_links() {
        let ctx = Context::new();
        let id_seq = GlobalIdSequence::new();
        let mut router = Router::new(ctx, &id_seq);

        let (router_a, mut ep_a) = loopback_pair();
        let (router_b, mut ep_b) = loopback_pair();
        router.accept_connection(Box::new(router_a), LinkRole::Endpoint);
        router.accept_connection(Box::new(router_b), LinkRole::Endpoint);

        let id_a = EndpointId(100);
        let id_b = EndpointId(101);
        confirm(&mut router, 0, id_a);
        confirm(&mut router, 1, id_b);

        let msg_id = MessageId::new("StrUtilReq", "Reverse");
        let mut sub = Message::new(MessageId::control("subscribTo"), id_b, router.own_id(), {
            let mut p = msg_id.class.value().to_be_bytes().to_vec();
            p.extend_from_slice(&msg_id.method.value().to_be_bytes());
            p
        });
        sub.sequence = 0;
        router.handle_control(1, &mut sub, Duration::ZERO);

        let mut broadcast = Message::new(msg_id, id_a, EndpointId::BROADCAST, b"hi".to_vec());
        broadcast.sequence = 0;
        router.forward_user_message(0, broadcast, Duration::ZERO);

        let mut received_a = Vec::new();
        ep_a.fetch(&mut |m| {
            received_a.push(m);
            true
        });
        assert!(received_a.is_empty(), "source link must not receive its own broadcast");

        let mut received_b = Vec::new();
        ep_b.fetch(&mut |m| {
            received_b.push(m);
            true
        });
        assert_eq!(1, received_b.len());
    }

    #[test]
    fn targeted_message_to_disconnected_endpoint_is_dropped() {
        let ctx = Context::new();
        let id_seq = GlobalIdSequence::new();
        let mut router = Router::new(ctx, &id_seq);
        router.disconnected.insert(EndpointId(5), Instant::now());

        let msg = Message::new(MessageId::new("a", "b"), EndpointId(1), EndpointId(5), vec![]);
        router.forward_user_message(usize::MAX, msg, Duration::ZERO);
        assert_eq!(1, router.stats().dropped);
    }

    #[test]
    fn keep_running_vetoes_shutdown_request() {
        let ctx = Context::new();
        let id_seq = GlobalIdSequence::new();
        let mut config = Config::new();
        config.set(keys::ROUTER_KEEP_RUNNING, true);
        let mut router = Router::from_config(ctx, &id_seq, &config);

        let now_ms = shutdown::now_millis();
        let mut msg = Message::new(MessageId::control("shutdown"), EndpointId(1), router.own_id(), now_ms.to_be_bytes().to_vec());
        router.handle_control(0, &mut msg, Duration::ZERO);

        assert!(!router.wants_shutdown());
    }

    #[test]
    fn shutdown_request_is_honored_after_its_delay() {
        let ctx = Context::new();
        let id_seq = GlobalIdSequence::new();
        let mut config = Config::new();
        config.set(keys::ROUTER_SHUTDOWN_DELAY, 0i64);
        let mut router = Router::from_config(ctx, &id_seq, &config);

        let now_ms = shutdown::now_millis();
        let mut msg = Message::new(MessageId::control("shutdown"), EndpointId(1), router.own_id(), now_ms.to_be_bytes().to_vec());
        router.handle_control(0, &mut msg, Duration::ZERO);

        assert!(router.update());
        assert!(router.wants_shutdown());
    }
}
