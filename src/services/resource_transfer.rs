// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! BLOB-backed resource streaming and a generic sequence-keyed RPC
//! invoker/skeleton.
//!
//! `ResourceServer`/`ResourceConsumer` sit one hop from a router (a single
//! outbound [`Connection`]) and let the router's normal forwarding fan a
//! single server out to many simultaneous consumers, rather than owning a
//! connection per peer themselves.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::blob::{BlobManipulator, BufferSink, TargetIo};
use crate::config::{keys, Config};
use crate::connection::Connection;
use crate::identifier::{EndpointId, Identifier, IdSequence, MessageId};
use crate::message::Priority;

fn request_id() -> MessageId {
    MessageId::new("ResourceReq", "query")
}
fn found_id() -> MessageId {
    MessageId::new("ResourceRes", "found")
}
fn missing_id() -> MessageId {
    MessageId::new("ResourceRes", "missing")
}
fn data_class() -> Identifier {
    Identifier::new("ResourceDt")
}

type Provider = Box<dyn Fn(&str) -> Option<Vec<u8>>>;

/// Serves resource BLOBs by URL to any number of consumers at once,
/// multiplexed by the router on the other end of `connection`.
pub struct ResourceServer {
    own_id: EndpointId,
    connection: Box<dyn Connection>,
    blob: BlobManipulator,
    providers: Vec<(String, Provider)>,
    default_deadline: Duration,
}

impl ResourceServer {
    pub fn new(own_id: EndpointId, connection: Box<dyn Connection>) -> Self {
        ResourceServer { own_id, connection, blob: BlobManipulator::new(), providers: Vec::new(), default_deadline: Duration::from_secs(300) }
    }

    /// Registers a provider matched by URL prefix; the first match wins.
    pub fn register_provider(&mut self, prefix: &str, provider: impl Fn(&str) -> Option<Vec<u8>> + 'static) {
        self.providers.push((prefix.to_string(), Box::new(provider)));
    }

    /// Registers the `eagires:///random?count=N` provider described in the
    /// resource-stream scenario: returns `N` deterministic pseudo-random
    /// bytes (deterministic so tests can assert on content, not just length).
    pub fn register_random_provider(&mut self) {
        self.register_provider("eagires:///random", |url| {
            let count: usize = url.split("count=").nth(1)?.parse().ok()?;
            Some((0..count).map(|i| (i % 256) as u8).collect())
        });
    }

    fn resolve(&self, url: &str) -> Option<Vec<u8>> {
        self.providers.iter().find(|(prefix, _)| url.starts_with(prefix.as_str())).and_then(|(_, p)| p(url))
    }

    pub fn update(&mut self) -> bool {
        let mut work = self.connection.update();
        work |= self.blob.update_outgoing(self.own_id, &mut *self.connection);

        let mut requests = Vec::new();
        self.connection.fetch(&mut |message| {
            if message.id == request_id() {
                requests.push(message);
            }
            true
        });

        for message in requests {
            work = true;
            let Some((sequence, url)) = decode_request(&message.content) else { continue };
            match self.resolve(&url) {
                Some(data) => {
                    let size = data.len() as u64;
                    let blob_id = self.blob.push_outgoing(message.source_id, data_class(), Box::new(data), Priority::Normal, self.default_deadline);
                    let mut reply = crate::message::Message::new(found_id(), self.own_id, message.source_id, encode_found(sequence, blob_id, size));
                    reply.priority = Priority::Normal;
                    self.connection.send(reply);
                }
                None => {
                    warn!("no provider for resource url '{url}'");
                    let reply = crate::message::Message::new(missing_id(), self.own_id, message.source_id, encode_sequence(sequence));
                    self.connection.send(reply);
                }
            }
        }
        work
    }
}

fn decode_request(content: &[u8]) -> Option<(u64, String)> {
    if content.len() < 8 {
        return None;
    }
    let sequence = u64::from_be_bytes(content[..8].try_into().ok()?);
    let url = String::from_utf8(content[8..].to_vec()).ok()?;
    Some((sequence, url))
}

fn encode_sequence(sequence: u64) -> Vec<u8> {
    sequence.to_be_bytes().to_vec()
}

fn encode_found(sequence: u64, blob_id: u64, size: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&sequence.to_be_bytes());
    out.extend_from_slice(&blob_id.to_be_bytes());
    out.extend_from_slice(&size.to_be_bytes());
    out
}

struct PendingRequest {
    url: String,
    server_id: EndpointId,
    sink: Rc<std::cell::RefCell<BufferSink>>,
    found: bool,
    deadline: Instant,
}

/// Requests resources from a [`ResourceServer`] and reassembles them via a
/// [`BlobManipulator`] sink, one request per peer server in flight at a
/// time (a server handling multiple consumers is the common case; a single
/// consumer juggling multiple in-flight requests to one server is not).
pub struct ResourceConsumer {
    own_id: EndpointId,
    connection: Box<dyn Connection>,
    blob: BlobManipulator,
    sequence: IdSequence,
    pending: HashMap<u64, PendingRequest>,
    timeout: Duration,
}

impl ResourceConsumer {
    pub fn new(own_id: EndpointId, connection: Box<dyn Connection>) -> Self {
        ResourceConsumer { own_id, connection, blob: BlobManipulator::new(), sequence: IdSequence::new(), pending: HashMap::new(), timeout: Duration::from_secs(300) }
    }

    /// Builds a consumer whose per-request deadline comes from
    /// `msgbus.resource_get.blob_timeout`.
    pub fn from_config(own_id: EndpointId, connection: Box<dyn Connection>, config: &Config) -> Self {
        let mut consumer = ResourceConsumer::new(own_id, connection);
        consumer.timeout = config.get_duration_ms(keys::RESOURCE_GET_BLOB_TIMEOUT, consumer.timeout);
        consumer
    }

    /// Sends a resource request, returning the sequence number identifying it.
    pub fn query(&mut self, server_id: EndpointId, url: &str) -> u64 {
        let sequence = self.sequence.next();
        let mut content = sequence.to_be_bytes().to_vec();
        content.extend_from_slice(url.as_bytes());
        let message = crate::message::Message::new(request_id(), self.own_id, server_id, content);
        self.connection.send(message);

        let sink = Rc::new(std::cell::RefCell::new(BufferSink::default()));
        self.pending.insert(sequence, PendingRequest { url: url.to_string(), server_id, sink, found: false, deadline: Instant::now() + self.timeout });
        sequence
    }

    /// The reassembled bytes for `sequence`, once complete.
    pub fn result(&self, sequence: u64) -> Option<Vec<u8>> {
        let pending = self.pending.get(&sequence)?;
        let sink = pending.sink.borrow();
        sink.done.then(|| sink.data.clone())
    }

    pub fn has_pending(&self, sequence: u64) -> bool {
        self.pending.contains_key(&sequence) && self.result(sequence).is_none()
    }

    pub fn update(&mut self) -> bool {
        let mut work = self.connection.update();

        let mut incoming = Vec::new();
        self.connection.fetch(&mut |message| {
            incoming.push(message);
            true
        });

        for message in incoming {
            work = true;
            if message.id == found_id() {
                if let Some((sequence, blob_id, size)) = decode_found(&message.content) {
                    if let Some(pending) = self.pending.get_mut(&sequence) {
                        pending.found = true;
                        let sink = pending.sink.clone();
                        let server_id = pending.server_id;
                        self.blob.register_sink_factory(data_class(), move |from, _declared_size| {
                            if from != server_id {
                                return None;
                            }
                            Some(Box::new(ProxySink(sink.clone())) as Box<dyn TargetIo>)
                        });
                        debug!("resource request {sequence} found as blob {blob_id}, size {size}");
                    }
                }
            } else if message.id == missing_id() {
                if let Some(sequence) = message.content.get(..8).and_then(|b| b.try_into().ok()).map(u64::from_be_bytes) {
                    self.pending.remove(&sequence);
                }
            } else {
                self.blob.handle_control(&message);
            }
        }

        // completion/cancellation is already reflected into the sink by
        // BlobManipulator itself; draining just keeps the event queue bounded.
        self.blob.drain_events();

        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.deadline && !p.sink.borrow().done)
            .map(|(sequence, _)| *sequence)
            .collect();
        for sequence in expired {
            if let Some(p) = self.pending.remove(&sequence) {
                warn!("resource request {sequence} for '{}' timed out waiting on {:?}", p.url, p.server_id);
            }
        }

        work
    }
}

struct ProxySink(Rc<std::cell::RefCell<BufferSink>>);
impl TargetIo for ProxySink {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
        self.0.borrow_mut().write_at(offset, bytes)
    }
    fn finished(&mut self, total_size: u64, age: Duration) {
        self.0.borrow_mut().finished(total_size, age);
    }
    fn cancelled(&mut self, err: crate::error::BlobError) {
        self.0.borrow_mut().cancelled(err);
    }
}

fn decode_found(content: &[u8]) -> Option<(u64, u64, u64)> {
    if content.len() < 24 {
        return None;
    }
    let sequence = u64::from_be_bytes(content[0..8].try_into().ok()?);
    let blob_id = u64::from_be_bytes(content[8..16].try_into().ok()?);
    let size = u64::from_be_bytes(content[16..24].try_into().ok()?);
    Some((sequence, blob_id, size))
}

/// One outstanding RPC call: a sequence number, the deadline it must
/// complete by, and the slot its result lands in.
struct PendingCall {
    deadline: Instant,
    completed: Option<Vec<u8>>,
}

/// Client side of a sequence-number correlated RPC: `call` posts a request
/// and returns a handle; `complete`/`poll` resolve it as replies or
/// timeouts arrive.
#[derive(Default)]
pub struct Invoker {
    calls: HashMap<u64, PendingCall>,
}

impl Invoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_call(&mut self, sequence: u64, timeout: Duration) {
        self.calls.insert(sequence, PendingCall { deadline: Instant::now() + timeout, completed: None });
    }

    pub fn complete(&mut self, sequence: u64, result: Vec<u8>) {
        if let Some(call) = self.calls.get_mut(&sequence) {
            call.completed = Some(result);
        }
    }

    /// Returns `Some(Ok(result))` for a completed call, `Some(Err(()))` for
    /// a timed-out one (removing it either way), or `None` if still pending.
    pub fn poll(&mut self, sequence: u64) -> Option<Result<Vec<u8>, ()>> {
        let call = self.calls.get(&sequence)?;
        if let Some(result) = &call.completed {
            let result = result.clone();
            self.calls.remove(&sequence);
            return Some(Ok(result));
        }
        if Instant::now() >= call.deadline {
            self.calls.remove(&sequence);
            return Some(Err(()));
        }
        None
    }
}

/// Server side of a sequence-number correlated RPC: dispatches calls by
/// message id to registered handlers and builds the reply content.
#[derive(Default)]
pub struct Skeleton {
    handlers: HashMap<MessageId, Box<dyn Fn(&[u8]) -> Vec<u8>>>,
}

impl Skeleton {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: MessageId, handler: impl Fn(&[u8]) -> Vec<u8> + 'static) {
        self.handlers.insert(id, Box::new(handler));
    }

    pub fn invoke(&self, id: MessageId, args: &[u8]) -> Option<Vec<u8>> {
        self.handlers.get(&id).map(|h| h(args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::inprocess::loopback_pair;

    #[test]
    fn consumer_queries_server_and_reassembles_random_resource() {
        let (server_side, consumer_side) = loopback_pair();
        let mut server = ResourceServer::new(EndpointId(1), Box::new(server_side));
        server.register_random_provider();
        let mut consumer = ResourceConsumer::new(EndpointId(2), Box::new(consumer_side));

        let sequence = consumer.query(EndpointId(1), "eagires:///random?count=4096");

        for _ in 0..50 {
            server.update();
            consumer.update();
            if !consumer.has_pending(sequence) {
                break;
            }
        }

        let result = consumer.result(sequence).expect("resource should have completed");
        assert_eq!(4096, result.len());
        assert_eq!(0u8, result[0]);
        assert_eq!(255u8, result[255]);
    }

    #[test]
    fn from_config_evicts_pending_request_past_blob_timeout() {
        let (_server_side, consumer_side) = loopback_pair();
        let mut config = Config::new();
        config.set(keys::RESOURCE_GET_BLOB_TIMEOUT, 5i64);
        let mut consumer = ResourceConsumer::from_config(EndpointId(2), Box::new(consumer_side), &config);

        let sequence = consumer.query(EndpointId(1), "eagires:///random?count=4");
        assert!(consumer.has_pending(sequence));

        std::thread::sleep(Duration::from_millis(15));
        consumer.update();

        assert!(!consumer.has_pending(sequence));
        assert!(consumer.result(sequence).is_none());
    }

    #[test]
    fn invoker_reports_timeout_for_uncompleted_call() {
        let mut invoker = Invoker::new();
        invoker.start_call(1, Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(Some(Err(())), invoker.poll(1));
    }

    #[test]
    fn skeleton_dispatches_registered_handler() {
        let mut skeleton = Skeleton::new();
        let id = MessageId::new("Calc", "double");
        skeleton.register(id, |args| vec![args[0] * 2]);
        assert_eq!(Some(vec![8]), skeleton.invoke(id, &[4]));
        assert_eq!(None, skeleton.invoke(MessageId::new("Calc", "triple"), &[4]));
    }
}
