// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! UDP transport. Datagram boundaries already delimit messages, so no
//! incremental frame reader is needed here — each datagram carries exactly
//! one length-prefixed message produced by [`crate::message::Message::encode`].

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use byteorder::{BigEndian, ReadBytesExt};
use log::warn;
use mio::net::UdpSocket;

use crate::connection::{AddressKind, Acceptor, Connection, ConnectionKind, Connector};
use crate::message::Message;

const UDP_FRAGMENT_SIZE: usize = 1200; // keeps a frame under typical path MTU
const MAX_DATAGRAM: usize = 65_507;

pub struct UdpConnection {
    socket: UdpSocket,
    peer: SocketAddr,
    pending_in: VecDeque<Message>,
    usable: bool,
}

impl UdpConnection {
    pub fn new(socket: UdpSocket, peer: SocketAddr) -> Self {
        UdpConnection { socket, peer, pending_in: VecDeque::new(), usable: true }
    }
}

impl Connection for UdpConnection {
    fn update(&mut self) -> bool {
        if !self.usable {
            return false;
        }
        let mut work = false;
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv(&mut buf) {
                Ok(n) if n > 8 => {
                    let len = (&buf[..8]).read_u64::<BigEndian>().unwrap_or(0) as usize;
                    if n == 8 + len {
                        match Message::decode(&mut &buf[8..n]) {
                            Ok(message) => {
                                self.pending_in.push_back(message);
                                work = true;
                            }
                            Err(e) => warn!("dropping malformed udp datagram: {e}"),
                        }
                    } else {
                        warn!("dropping truncated udp datagram ({n} bytes, expected {})", 8 + len);
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("udp recv failed: {e}");
                    break;
                }
            }
        }
        work
    }

    fn send(&mut self, message: Message) -> bool {
        if !self.usable {
            return false;
        }
        let mut buf = Vec::new();
        if message.encode(&mut buf).is_err() || buf.len() > MAX_DATAGRAM {
            return false;
        }
        match self.socket.send_to(&buf, self.peer) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => {
                warn!("udp send failed: {e}");
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
        UDP_FRAGMENT_SIZE
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    fn cleanup(&mut self) {
        self.usable = false;
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::RemoteInterProcess
    }

    fn address_kind(&self) -> AddressKind {
        match self.peer {
            SocketAddr::V4(_) => AddressKind::Ipv4,
            SocketAddr::V6(_) => AddressKind::Ipv6,
        }
    }

    fn type_id(&self) -> &'static str {
        "udp"
    }
}

/// Binds once and hands back exactly one connection, fixed to whoever sent
/// the first datagram: UDP has no per-client accept semantics, so a fresh
/// peer needs a fresh acceptor (a fresh local port) rather than this one
/// being reused.
pub struct UdpAcceptor {
    socket: Option<UdpSocket>,
}

impl UdpAcceptor {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Ok(UdpAcceptor { socket: Some(socket) })
    }
}

impl Acceptor for UdpAcceptor {
    fn update(&mut self) -> Option<Box<dyn Connection>> {
        let socket = self.socket.as_ref()?;
        let mut buf = [0u8; MAX_DATAGRAM];
        match socket.peek_from(&mut buf) {
            Ok((_, peer)) => {
                let socket = self.socket.take()?;
                if let Err(e) = socket.connect(peer) {
                    warn!("udp acceptor failed to fix peer {peer}: {e}");
                    return None;
                }
                Some(Box::new(UdpConnection::new(socket, peer)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                warn!("udp acceptor recv failed: {e}");
                None
            }
        }
    }

    fn type_id(&self) -> &'static str {
        "udp"
    }
}

pub struct UdpConnector {
    target: SocketAddr,
}

impl UdpConnector {
    pub fn new(target: SocketAddr) -> Self {
        UdpConnector { target }
    }
}

impl Connector for UdpConnector {
    fn connect(&mut self) -> io::Result<Box<dyn Connection>> {
        let local: SocketAddr = if self.target.is_ipv4() { "0.0.0.0:0".parse().unwrap() } else { "[::]:0".parse().unwrap() };
        let socket = UdpSocket::bind(local)?;
        socket.connect(self.target)?;
        Ok(Box::new(UdpConnection::new(socket, self.target)))
    }

    fn type_id(&self) -> &'static str {
        "udp"
    }
}
