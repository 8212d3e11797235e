// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Subscriber discovery: `subscribTo` / `unsubFrom` / `notSubTo` / `stillAlive`
//! observation, collected into a live table of who handles what.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;

use crate::endpoint::Endpoint;
use crate::identifier::{EndpointId, Identifier, MessageId, ProcessInstanceId};
use crate::message::Message;

use super::Service;

/// Basic identity of a remote endpoint as observed through discovery
/// traffic: its id, its process instance id (to detect restarts), and the
/// hop distance the observing router/bridge reported.
#[derive(Clone, Copy, Debug)]
pub struct SubscriberInfo {
    pub endpoint_id: EndpointId,
    pub instance_id: Option<ProcessInstanceId>,
    pub hop_count: u8,
}

#[derive(Clone, Copy, Debug)]
pub enum DiscoveryEvent {
    Alive(SubscriberInfo),
    Subscribed(SubscriberInfo, MessageId),
    Unsubscribed(SubscriberInfo, MessageId),
    NotSubscribed(SubscriberInfo, MessageId),
}

/// Observes discovery control messages and accumulates a live
/// endpoint-id → subscribed-message-ids table.
#[derive(Default)]
pub struct SubscriberDiscovery {
    known: HashMap<EndpointId, (SubscriberInfo, Instant)>,
    subscriptions: HashMap<EndpointId, Vec<MessageId>>,
    events: Vec<DiscoveryEvent>,
    received: Rc<RefCell<VecDeque<Message>>>,
}

impl SubscriberDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn known_endpoints(&self) -> impl Iterator<Item = EndpointId> + '_ {
        self.known.keys().copied()
    }

    pub fn subscriptions_of(&self, endpoint: EndpointId) -> &[MessageId] {
        self.subscriptions.get(&endpoint).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn drain_events(&mut self) -> Vec<DiscoveryEvent> {
        std::mem::take(&mut self.events)
    }

    fn note_alive(&mut self, info: SubscriberInfo) {
        self.known.insert(info.endpoint_id, (info, Instant::now()));
        self.events.push(DiscoveryEvent::Alive(info));
    }

    pub fn on_still_alive(&mut self, source: EndpointId, instance_id: ProcessInstanceId, hop_count: u8) {
        self.note_alive(SubscriberInfo { endpoint_id: source, instance_id: Some(instance_id), hop_count });
    }

    pub fn on_subscribed(&mut self, source: EndpointId, hop_count: u8, message_type: MessageId) {
        let info = SubscriberInfo { endpoint_id: source, instance_id: None, hop_count };
        self.subscriptions.entry(source).or_default().push(message_type);
        self.events.push(DiscoveryEvent::Subscribed(info, message_type));
    }

    pub fn on_unsubscribed(&mut self, source: EndpointId, hop_count: u8, message_type: MessageId) {
        let info = SubscriberInfo { endpoint_id: source, instance_id: None, hop_count };
        if let Some(list) = self.subscriptions.get_mut(&source) {
            list.retain(|id| *id != message_type);
        }
        self.events.push(DiscoveryEvent::Unsubscribed(info, message_type));
    }

    pub fn on_not_subscribed(&mut self, source: EndpointId, hop_count: u8, message_type: MessageId) {
        let info = SubscriberInfo { endpoint_id: source, instance_id: None, hop_count };
        self.events.push(DiscoveryEvent::NotSubscribed(info, message_type));
    }
}

impl Service for SubscriberDiscovery {
    fn attach(&mut self, endpoint: &mut Endpoint) {
        for method in ["stillAlive", "subscribTo", "unsubFrom", "notSubTo"] {
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
            let method = message.id.method;
            if method == Identifier::new("stillAlive") && message.content.len() == 4 {
                let raw = u32::from_be_bytes(message.content[..4].try_into().unwrap());
                self.on_still_alive(message.source_id, ProcessInstanceId(raw), message.hop_count);
            } else if let Some(id) = decode_message_id(&message.content) {
                if method == Identifier::new("subscribTo") {
                    self.on_subscribed(message.source_id, message.hop_count, id);
                } else if method == Identifier::new("unsubFrom") {
                    self.on_unsubscribed(message.source_id, message.hop_count, id);
                } else if method == Identifier::new("notSubTo") {
                    self.on_not_subscribed(message.source_id, message.hop_count, id);
                }
            }
        }
        work
    }
}

/// Decodes a `subscribTo`/`unsubFrom` payload produced by
/// [`crate::endpoint::Endpoint::subscribe`] back into a [`MessageId`].
pub fn decode_message_id(payload: &[u8]) -> Option<MessageId> {
    if payload.len() < 16 {
        return None;
    }
    let class = crate::identifier::Identifier::from_raw(u64::from_be_bytes(payload[0..8].try_into().ok()?));
    let method = crate::identifier::Identifier::from_raw(u64::from_be_bytes(payload[8..16].try_into().ok()?));
    Some(MessageId { class, method })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn still_alive_then_subscribe_populates_table() {
        let mut discovery = SubscriberDiscovery::new();
        let ep = EndpointId(5);
        discovery.on_still_alive(ep, ProcessInstanceId(42), 1);
        discovery.on_subscribed(ep, 1, MessageId::new("StrUtilReq", "Reverse"));
        assert_eq!(vec![ep], discovery.known_endpoints().collect::<Vec<_>>());
        assert_eq!(1, discovery.subscriptions_of(ep).len());
        assert_eq!(2, discovery.drain_events().len());
    }

    #[test]
    fn unsubscribe_removes_from_table() {
        let mut discovery = SubscriberDiscovery::new();
        let ep = EndpointId(5);
        let id = MessageId::new("a", "b");
        discovery.on_subscribed(ep, 1, id);
        discovery.on_unsubscribed(ep, 1, id);
        assert!(discovery.subscriptions_of(ep).is_empty());
    }
}
