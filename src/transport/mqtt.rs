// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! MQTT gateway transport: the outer side of an [`crate::bridge::MqttBridge`].
//! Topic encodes `(class, method, target)`; payload bytes are opaque to the
//! broker. `rumqttc`'s event loop is blocking, so it runs on its own
//! thread and forwards decoded publishes through a channel that `fetch`
//! drains without blocking.

use std::io;
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use log::warn;
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};

use crate::connection::{AddressKind, Connection, ConnectionKind};
use crate::identifier::{EndpointId, Identifier, MessageId};
use crate::message::Message;

const MQTT_FRAGMENT_SIZE: usize = 200_000;
const TOPIC_PREFIX: &str = "relaybus";

pub fn topic_for(id: MessageId, target: EndpointId) -> String {
    format!("{TOPIC_PREFIX}/{:016x}/{:016x}/{:016x}", id.class.value(), id.method.value(), target.0)
}

pub fn parse_topic(topic: &str) -> Option<(MessageId, EndpointId)> {
    let rest = topic.strip_prefix(TOPIC_PREFIX)?.trim_start_matches('/');
    let mut parts = rest.split('/');
    let class = u64::from_str_radix(parts.next()?, 16).ok()?;
    let method = u64::from_str_radix(parts.next()?, 16).ok()?;
    let target = u64::from_str_radix(parts.next()?, 16).ok()?;
    Some((MessageId { class: Identifier::from_raw(class), method: Identifier::from_raw(method) }, EndpointId(target)))
}

pub struct MqttConnection {
    client: Client,
    incoming: Receiver<Message>,
    usable: bool,
}

impl MqttConnection {
    pub fn connect(client_id: &str, host: &str, port: u16) -> io::Result<Self> {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(15));

        let (client, mut connection) = Client::new(options, 256);
        client
            .subscribe(format!("{TOPIC_PREFIX}/#"), QoS::AtMostOnce)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let (tx, rx) = channel();
        thread::spawn(move || {
            for notification in connection.iter() {
                match notification {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if let Some((id, target)) = parse_topic(&publish.topic) {
                            let message = Message::new(id, EndpointId::BROADCAST, target, publish.payload.to_vec());
                            if tx.send(message).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt event loop error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(MqttConnection { client, incoming: rx, usable: true })
    }
}

impl Connection for MqttConnection {
    fn update(&mut self) -> bool {
        self.usable
    }

    fn send(&mut self, message: Message) -> bool {
        let topic = topic_for(message.id, message.target_id);
        self.client.try_publish(topic, QoS::AtMostOnce, false, message.content).is_ok()
    }

    fn fetch(&mut self, handler: &mut dyn FnMut(Message) -> bool) -> bool {
        let mut work = false;
        loop {
            match self.incoming.try_recv() {
                Ok(message) => {
                    handler(message);
                    work = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.usable = false;
                    break;
                }
            }
        }
        work
    }

    fn max_data_size(&self) -> usize {
        MQTT_FRAGMENT_SIZE
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::RemoteInterProcess
    }

    fn address_kind(&self) -> AddressKind {
        AddressKind::None
    }

    fn type_id(&self) -> &'static str {
        "mqtt"
    }
}
