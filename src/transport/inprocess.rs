// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! In-process transport: a pair of connections backed by shared
//! `crossbeam-channel` queues. No serialization happens on this path
//! (messages are moved directly), which is why a loopback string-reverse
//! test can run entirely on one thread.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::connection::{Connection, ConnectionKind};
use crate::message::Message;

pub struct InProcessConnection {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    closed: bool,
}

impl InProcessConnection {
    fn new(tx: Sender<Message>, rx: Receiver<Message>) -> Self {
        InProcessConnection { tx, rx, closed: false }
    }
}

impl Connection for InProcessConnection {
    fn update(&mut self) -> bool {
        false
    }

    fn send(&mut self, message: Message) -> bool {
        if self.closed {
            return false;
        }
        self.tx.send(message).is_ok()
    }

    fn fetch(&mut self, handler: &mut dyn FnMut(Message) -> bool) -> bool {
        let mut work = false;
        loop {
            match self.rx.try_recv() {
                Ok(message) => {
                    handler(message);
                    work = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        work
    }

    fn max_data_size(&self) -> usize {
        0 // unbounded: no framing limit on this path
    }

    fn routing_weight(&self) -> f32 {
        // in-process is always the cheapest path available
        2.0
    }

    fn is_usable(&self) -> bool {
        !self.closed
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::InProcess
    }

    fn type_id(&self) -> &'static str {
        "inprocess"
    }
}

/// Builds a connected pair of in-process connections sharing two channels,
/// one per direction.
pub fn loopback_pair() -> (InProcessConnection, InProcessConnection) {
    let (tx_a, rx_a) = unbounded();
    let (tx_b, rx_b) = unbounded();
    (InProcessConnection::new(tx_a, rx_b), InProcessConnection::new(tx_b, rx_a))
}
