// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The connection contract: a bidirectional, message-framed link that a
//! router, bridge or endpoint drives by repeated, non-blocking calls.
//!
//! A concrete transport (in-process queue, TCP stream, POSIX mqueue, MQTT
//! gateway) implements [`Connection`]; the core never depends on a
//! transport's internals, only on this trait.

use crate::message::Message;

/// Broad category of link, used by the router to prefer cheaper paths and
/// to decide default fragment sizes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnectionKind {
    InProcess,
    LocalInterProcess,
    RemoteInterProcess,
}

/// Network-address family a connection's endpoint lives on, surfaced for
/// diagnostics and topology reporting; distinct from `ConnectionKind`
/// because e.g. both TCP and UDP are `RemoteInterProcess`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AddressKind {
    None,
    Loopback,
    Ipv4,
    Ipv6,
    Filesystem,
}

/// Outcome of a non-blocking step: whether it moved the connection forward.
pub type WorkDone = bool;

/// A handler invoked once per buffered incoming message by [`Connection::fetch`].
/// Returns whether the message was consumed; an unconsumed message is still
/// removed from the connection's buffer (fetch does not retry a frame that
/// was already handed to the router).
pub trait FetchHandler: FnMut(Message) -> bool {}
impl<F: FnMut(Message) -> bool> FetchHandler for F {}

/// Bidirectional, message-framed, non-blocking link.
///
/// Single-threaded per connection: a connection must be driven from one
/// thread at a time, but different connections held by the same router may
/// be driven concurrently only if the router itself serialises access to
/// each one.
pub trait Connection {
    /// Advances transport I/O and handshakes. Must not invoke any router or
    /// endpoint-level handler directly.
    fn update(&mut self) -> WorkDone;

    /// Enqueues `message` for the next flush. Returns `false` if the
    /// connection's outgoing channel is saturated (back-pressure); `send`
    /// never blocks.
    fn send(&mut self, message: Message) -> bool;

    /// Drains buffered incoming frames, calling `handler` for each.
    fn fetch(&mut self, handler: &mut dyn FnMut(Message) -> bool) -> WorkDone;

    /// Maximum payload bytes encodable in one frame; `0` means unknown /
    /// unbounded (the caller should pick a conservative default).
    fn max_data_size(&self) -> usize {
        0
    }

    /// Used by the router to prefer one peer over another when multiple
    /// links reach the same endpoint.
    fn routing_weight(&self) -> f32 {
        1.0
    }

    /// Whether the connection is still viable; once `false` the holder
    /// should call `cleanup` and drop it.
    fn is_usable(&self) -> bool;

    /// Releases any transport resources. Idempotent.
    fn cleanup(&mut self) {}

    fn kind(&self) -> ConnectionKind;

    fn address_kind(&self) -> AddressKind {
        AddressKind::None
    }

    /// Short transport tag (`"inprocess"`, `"tcp"`, `"udp"`, `"mqueue"`, `"mqtt"`),
    /// used in logging and statistics.
    fn type_id(&self) -> &'static str;
}

/// Factory of connections produced by listening for peers. An acceptor's
/// `update` should be cheap to call every router tick even when no peer is
/// waiting.
pub trait Acceptor {
    /// Polls for and returns at most one newly accepted connection per call.
    fn update(&mut self) -> Option<Box<dyn Connection>>;

    fn type_id(&self) -> &'static str;
}

impl std::fmt::Debug for dyn Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(self.type_id()).finish()
    }
}

/// Produces [`Connection`]s that initiate a link rather than accept one
/// (used by endpoints and bridges when the bus process is the dialing
/// side).
pub trait Connector {
    fn connect(&mut self) -> std::io::Result<Box<dyn Connection>>;

    fn type_id(&self) -> &'static str;
}
