// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Subscriber and handler-map dispatch.

use std::collections::HashMap;

use crate::identifier::{EndpointId, MessageId};
use crate::message::{Message, VerificationBits};

/// Per-call context handed to a handler alongside the received message.
#[derive(Clone, Copy, Debug)]
pub struct HandlerContext {
    pub source_id: EndpointId,
    pub sequence: u64,
    pub verification: VerificationBits,
}

/// A handler reacting to one message id. Returns whether the message was
/// consumed (an unconsumed message may still be seen by other subscribers
/// attached to the same endpoint).
pub trait Handler {
    fn handle(&mut self, ctx: &HandlerContext, message: &Message) -> bool;
}

impl<F> Handler for F
where
    F: FnMut(&HandlerContext, &Message) -> bool,
{
    fn handle(&mut self, ctx: &HandlerContext, message: &Message) -> bool {
        self(ctx, message)
    }
}

/// Dispatch table from message id to handler.
#[derive(Default)]
pub struct HandlerMap {
    handlers: HashMap<MessageId, Box<dyn Handler>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        HandlerMap { handlers: HashMap::new() }
    }

    pub fn insert(&mut self, id: MessageId, handler: Box<dyn Handler>) {
        self.handlers.insert(id, handler);
    }

    pub fn remove(&mut self, id: MessageId) -> bool {
        self.handlers.remove(&id).is_some()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.handlers.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = MessageId> + '_ {
        self.handlers.keys().copied()
    }

    /// Returns `None` when no handler is registered for the message's id
    /// (the caller should treat this as "not subscribed", e.g. reply
    /// `notSubTo`); `Some(consumed)` otherwise.
    pub fn dispatch(&mut self, ctx: &HandlerContext, message: &Message) -> Option<bool> {
        self.handlers.get_mut(&message.id).map(|h| h.handle(ctx, message))
    }
}

/// An object attached to an endpoint that owns a [`HandlerMap`] and
/// publishes/retracts its subscription set as handlers are added/removed.
pub struct Subscriber {
    handlers: HandlerMap,
    /// Message ids added since the last call to `drain_subscribed`/`drain_unsubscribed`.
    pending_subscribe: Vec<MessageId>,
    pending_unsubscribe: Vec<MessageId>,
}

impl Subscriber {
    pub fn new() -> Self {
        Subscriber {
            handlers: HandlerMap::new(),
            pending_subscribe: Vec::new(),
            pending_unsubscribe: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, id: MessageId, handler: Box<dyn Handler>) {
        self.handlers.insert(id, handler);
        self.pending_subscribe.push(id);
    }

    pub fn unsubscribe(&mut self, id: MessageId) {
        if self.handlers.remove(id) {
            self.pending_unsubscribe.push(id);
        }
    }

    pub fn subscribed_ids(&self) -> impl Iterator<Item = MessageId> + '_ {
        self.handlers.ids()
    }

    pub fn handles(&self, id: MessageId) -> bool {
        self.handlers.contains(id)
    }

    pub fn dispatch(&mut self, ctx: &HandlerContext, message: &Message) -> Option<bool> {
        self.handlers.dispatch(ctx, message)
    }

    /// Takes and clears the list of ids newly subscribed since the last
    /// drain; the endpoint uses this to publish `subscribTo`.
    pub fn drain_subscribed(&mut self) -> Vec<MessageId> {
        std::mem::take(&mut self.pending_subscribe)
    }

    /// Takes and clears the list of ids newly unsubscribed since the last
    /// drain; the endpoint uses this to publish `unsubFrom`.
    pub fn drain_unsubscribed(&mut self) -> Vec<MessageId> {
        std::mem::take(&mut self.pending_unsubscribe)
    }
}

impl Default for Subscriber {
    fn default() -> Self {
        Subscriber::new()
    }
}
