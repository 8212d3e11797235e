// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! TCP transport: connector, acceptor and connection built on `mio`'s
//! non-blocking `TcpStream`/`TcpListener`.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use log::{debug, warn};
use mio::net::{TcpListener, TcpStream};

use crate::connection::{Acceptor, AddressKind, Connection, ConnectionKind, Connector};
use crate::message::Message;
use crate::transport::FramedIo;

const TCP_FRAGMENT_SIZE: usize = 60_000;

pub struct TcpConnection {
    stream: TcpStream,
    io: FramedIo,
    pending_in: VecDeque<Message>,
    usable: bool,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        TcpConnection { stream, io: FramedIo::new(), pending_in: VecDeque::new(), usable: true }
    }
}

impl Connection for TcpConnection {
    fn update(&mut self) -> bool {
        if !self.usable {
            return false;
        }
        let mut work = false;
        match self.io.try_flush(&mut self.stream) {
            Ok(n) => work |= n > 0,
            Err(e) => {
                warn!("tcp connection write failed: {e}");
                self.usable = false;
                return work;
            }
        }
        match self.io.try_fill(&mut self.stream) {
            Ok(frames) => {
                work |= !frames.is_empty();
                self.pending_in.extend(frames);
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.usable = false;
            }
            Err(e) => {
                warn!("tcp connection read failed: {e}");
                self.usable = false;
            }
        }
        work
    }

    fn send(&mut self, message: Message) -> bool {
        if !self.usable {
            return false;
        }
        self.io.queue(&message).is_ok()
    }

    fn fetch(&mut self, handler: &mut dyn FnMut(Message) -> bool) -> bool {
        let work = !self.pending_in.is_empty();
        while let Some(message) = self.pending_in.pop_front() {
            handler(message);
        }
        work
    }

    fn max_data_size(&self) -> usize {
        TCP_FRAGMENT_SIZE
    }

    fn routing_weight(&self) -> f32 {
        1.0
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
        match self.stream.peer_addr() {
            Ok(SocketAddr::V4(_)) => AddressKind::Ipv4,
            Ok(SocketAddr::V6(_)) => AddressKind::Ipv6,
            Err(_) => AddressKind::None,
        }
    }

    fn type_id(&self) -> &'static str {
        "tcp"
    }
}

pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        debug!("tcp acceptor listening on {addr}");
        Ok(TcpAcceptor { listener })
    }
}

impl Acceptor for TcpAcceptor {
    fn update(&mut self) -> Option<Box<dyn Connection>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                debug!("tcp acceptor accepted connection from {peer}");
                Some(Box::new(TcpConnection::new(stream)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                warn!("tcp acceptor failed: {e}");
                None
            }
        }
    }

    fn type_id(&self) -> &'static str {
        "tcp"
    }
}

pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        TcpConnector { addr }
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self) -> io::Result<Box<dyn Connection>> {
        let stream = TcpStream::connect(self.addr)?;
        Ok(Box::new(TcpConnection::new(stream)))
    }

    fn type_id(&self) -> &'static str {
        "tcp"
    }
}
