// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! POSIX message queue transport (unix only): a *local-inter-process*
//! connection kind, grounded in the same "every message is one whole unit"
//! framing idea as the UDP transport but backed by `mq_send`/`mq_receive`.

use std::collections::VecDeque;
use std::ffi::CString;
use std::io;

use log::warn;
use nix::errno::Errno;
use nix::mqueue::{mq_close, mq_open, mq_receive, mq_send, MQ_OFlag, MqAttr, MqdT};
use nix::sys::stat::Mode;

use crate::connection::{AddressKind, Acceptor, Connection, ConnectionKind, Connector};
use crate::message::Message;

const MQUEUE_MAX_MSG_SIZE: usize = 8192;
const MQUEUE_MAX_MSGS: i64 = 64;
const MQUEUE_FRAGMENT_SIZE: usize = MQUEUE_MAX_MSG_SIZE - 64;

pub struct MqueueConnection {
    name: String,
    send_mqd: Option<MqdT>,
    recv_mqd: Option<MqdT>,
    pending_in: VecDeque<Message>,
    usable: bool,
}

impl MqueueConnection {
    /// Opens (creating if absent) the named queue pair used for one
    /// direction of traffic each: `{name}.to` for what we send, `{name}.from`
    /// for what we receive, so two peers using the same base name talk past
    /// each other without colliding on one queue.
    pub fn open(base_name: &str, create: bool) -> io::Result<Self> {
        let (send_name, recv_name) = if create {
            (format!("{base_name}.from"), format!("{base_name}.to"))
        } else {
            (format!("{base_name}.to"), format!("{base_name}.from"))
        };

        let attr = MqAttr::new(0, MQUEUE_MAX_MSGS, MQUEUE_MAX_MSG_SIZE as i64, 0);
        let oflag = if create {
            MQ_OFlag::O_CREAT | MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK
        } else {
            MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK
        };
        let mode = Mode::from_bits_truncate(0o600);

        let send_mqd = open_queue(&send_name, oflag, mode, &attr)?;
        let recv_mqd = open_queue(&recv_name, oflag, mode, &attr)?;

        Ok(MqueueConnection {
            name: base_name.to_string(),
            send_mqd: Some(send_mqd),
            recv_mqd: Some(recv_mqd),
            pending_in: VecDeque::new(),
            usable: true,
        })
    }
}

fn open_queue(name: &str, oflag: MQ_OFlag, mode: Mode, attr: &MqAttr) -> io::Result<MqdT> {
    let cname = CString::new(format!("/{name}")).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "queue name contains NUL"))?;
    mq_open(cname.as_c_str(), oflag, mode, Some(attr)).map_err(errno_to_io)
}

fn errno_to_io(e: Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

impl Connection for MqueueConnection {
    fn update(&mut self) -> bool {
        if !self.usable {
            return false;
        }
        let Some(mqd) = self.recv_mqd.as_ref() else { return false };
        let mut work = false;
        let mut buf = vec![0u8; MQUEUE_MAX_MSG_SIZE];
        let mut priority: u32 = 0;
        loop {
            match mq_receive(mqd, &mut buf, &mut priority) {
                Ok(n) if n > 8 => match Message::decode(&mut &buf[8..n]) {
                    Ok(message) => {
                        self.pending_in.push_back(message);
                        work = true;
                    }
                    Err(e) => warn!("dropping malformed mqueue message on '{}': {e}", self.name),
                },
                Ok(_) => {}
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    warn!("mqueue receive failed on '{}': {e}", self.name);
                    self.usable = false;
                    break;
                }
            }
        }
        work
    }

    fn send(&mut self, message: Message) -> bool {
        let Some(mqd) = self.send_mqd.as_ref() else { return false };
        let mut buf = Vec::new();
        if message.encode(&mut buf).is_err() || buf.len() > MQUEUE_MAX_MSG_SIZE {
            return false;
        }
        match mq_send(mqd, &buf, 0) {
            Ok(()) => true,
            Err(Errno::EAGAIN) => false,
            Err(e) => {
                warn!("mqueue send failed on '{}': {e}", self.name);
                self.usable = false;
                false
            }
        }
    }

    fn fetch(&mut self, handler: &mut dyn FnMut(Message) -> bool) -> bool {
        let work = !self.pending_in.is_empty();
        while let Some(m) = self.pending_in.pop_front() {
            handler(m);
        }
        work
    }

    fn max_data_size(&self) -> usize {
        MQUEUE_FRAGMENT_SIZE
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    fn cleanup(&mut self) {
        if let Some(mqd) = self.send_mqd.take() {
            let _ = mq_close(mqd);
        }
        if let Some(mqd) = self.recv_mqd.take() {
            let _ = mq_close(mqd);
        }
        self.usable = false;
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::LocalInterProcess
    }

    fn address_kind(&self) -> AddressKind {
        AddressKind::Filesystem
    }

    fn type_id(&self) -> &'static str {
        "mqueue"
    }
}

impl Drop for MqueueConnection {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Hands back a connection already open on `address`'s queue pair: there is
/// no `mq_accept`, so "accepting" just means the local side created the
/// queues and is waiting for a peer to open the other end of the same pair.
pub struct MqueueAcceptor {
    connection: Option<MqueueConnection>,
}

impl MqueueAcceptor {
    pub fn open(base_name: &str) -> io::Result<Self> {
        Ok(MqueueAcceptor { connection: Some(MqueueConnection::open(base_name, true)?) })
    }
}

impl Acceptor for MqueueAcceptor {
    fn update(&mut self) -> Option<Box<dyn Connection>> {
        self.connection.take().map(|c| Box::new(c) as Box<dyn Connection>)
    }

    fn type_id(&self) -> &'static str {
        "mqueue"
    }
}

pub struct MqueueConnector {
    base_name: String,
}

impl MqueueConnector {
    pub fn new(base_name: &str) -> Self {
        MqueueConnector { base_name: base_name.to_string() }
    }
}

impl Connector for MqueueConnector {
    fn connect(&mut self) -> io::Result<Box<dyn Connection>> {
        Ok(Box::new(MqueueConnection::open(&self.base_name, false)?))
    }

    fn type_id(&self) -> &'static str {
        "mqueue"
    }
}
