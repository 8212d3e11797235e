// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Concrete transports implementing the [`crate::connection::Connection`]
//! contract. Only the contract is part of the core; these modules are the
//! pluggable external collaborators the setup registry (`crate::setup`)
//! wires up.

pub mod inprocess;
pub mod tcp;
pub mod udp;
pub mod mqtt;

#[cfg(unix)]
pub mod mqueue;

use std::io::{self, Read, Write};

use crate::message::{FrameReader, Message};

/// Shared outgoing-buffer / incoming-framer pair used by every byte-stream
/// transport (TCP, UDP, POSIX mqueue) so each only has to plug in its raw
/// `Read`/`Write` half, buffering outgoing bytes and framing incoming ones.
#[derive(Default)]
pub struct FramedIo {
    out_buf: Vec<u8>,
    out_pos: usize,
    reader: FrameReader,
}

impl FramedIo {
    pub fn new() -> Self {
        FramedIo::default()
    }

    pub fn queue(&mut self, message: &Message) -> io::Result<()> {
        message.encode(&mut self.out_buf)
    }

    pub fn has_pending_write(&self) -> bool {
        self.out_pos < self.out_buf.len()
    }

    /// Writes as much of the pending buffer as `writer` accepts without
    /// blocking. Returns bytes written; `WouldBlock` is swallowed.
    pub fn try_flush<W: Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while self.out_pos < self.out_buf.len() {
            match writer.write(&self.out_buf[self.out_pos..]) {
                Ok(0) => break,
                Ok(n) => {
                    self.out_pos += n;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        if self.out_pos == self.out_buf.len() {
            self.out_buf.clear();
            self.out_pos = 0;
        }
        Ok(total)
    }

    /// Reads as much as `reader` offers without blocking, returning every
    /// frame that became complete. `WouldBlock` is swallowed and reported
    /// as "no new frames".
    pub fn try_fill<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Vec<Message>> {
        let mut buf = [0u8; 8192];
        let mut frames = Vec::new();
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for raw in self.reader.push(&buf[..n])? {
                        frames.push(Message::decode(&mut &raw[..])?);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(frames)
    }
}
