// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Wire-level message record and its length-prefixed frame codec.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::identifier::{EndpointId, MessageId, Identifier};

/// Relative send priority. Higher priority is never preempted by lower
/// priority within one endpoint's send tick, but ordering across hops is
/// only weakly guaranteed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(u8)]
pub enum Priority {
    Idle = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Idle,
    ];

    fn from_u8(v: u8) -> io::Result<Priority> {
        Ok(match v {
            0 => Priority::Idle,
            1 => Priority::Low,
            2 => Priority::Normal,
            3 => Priority::High,
            4 => Priority::Critical,
            _ => return Err(crate::global::invalid_data_io_error("unknown priority value")),
        })
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

bitflags::bitflags! {
    /// Flags recording which identity attributes of a message could be
    /// validated: source endpoint id, source certificate, source private
    /// key signature, and the message id itself.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct VerificationBits: u8 {
        const SOURCE_ID = 0b0001;
        const SOURCE_CERTIFICATE = 0b0010;
        const SOURCE_PRIVATE_KEY = 0b0100;
        const MESSAGE_ID = 0b1000;
    }
}

/// Maximum number of router/bridge hops a message may traverse before it is
/// dropped; hop count is monotonically non-decreasing.
pub const MAX_HOP_COUNT: u8 = 127;

/// A message in transit: a tagged record carrying a typed payload plus the
/// addressing, sequencing and accounting fields the bus needs.
#[derive(Clone, Debug)]
pub struct Message {
    pub id: MessageId,
    pub source_id: EndpointId,
    pub target_id: EndpointId,
    pub sequence: u64,
    pub priority: Priority,
    pub hop_count: u8,
    /// Age, in milliseconds, accumulated since the message was created;
    /// updated by every router/bridge hop.
    pub age_ms: u64,
    pub serializer_tag: u8,
    pub signature: Option<Vec<u8>>,
    pub verification: VerificationBits,
    pub content: Vec<u8>,
}

impl Message {
    pub fn new(id: MessageId, source_id: EndpointId, target_id: EndpointId, content: Vec<u8>) -> Self {
        Message {
            id,
            source_id,
            target_id,
            sequence: 0,
            priority: Priority::Normal,
            hop_count: 0,
            age_ms: 0,
            serializer_tag: 0,
            signature: None,
            verification: VerificationBits::empty(),
            content,
        }
    }

    pub fn is_special(&self) -> bool {
        self.id.is_special()
    }

    /// Advances hop count and accumulates elapsed time since `created`.
    /// Returns `false` (and leaves the message unchanged) if the hop would
    /// push the count past `MAX_HOP_COUNT`.
    pub fn forward_hop(&mut self, elapsed: Duration) -> bool {
        if self.hop_count >= MAX_HOP_COUNT {
            return false;
        }
        self.hop_count += 1;
        self.age_ms = self.age_ms.saturating_add(elapsed.as_millis() as u64);
        true
    }

    pub fn age(&self) -> Duration {
        Duration::from_millis(self.age_ms)
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        let mut body = Vec::with_capacity(64 + self.content.len());
        body.write_u64::<BigEndian>(self.id.class.value())?;
        body.write_u64::<BigEndian>(self.id.method.value())?;
        body.write_u64::<BigEndian>(self.source_id.0)?;
        body.write_u64::<BigEndian>(self.target_id.0)?;
        body.write_u64::<BigEndian>(self.sequence)?;
        body.write_u8(self.priority as u8)?;
        body.write_u8(self.hop_count)?;
        body.write_u64::<BigEndian>(self.age_ms)?;
        body.write_u8(self.serializer_tag)?;
        body.write_u8(self.verification.bits())?;
        match &self.signature {
            Some(sig) => {
                body.write_u32::<BigEndian>(sig.len() as u32)?;
                body.write_all(sig)?;
            }
            None => body.write_u32::<BigEndian>(0)?,
        }
        body.write_u32::<BigEndian>(self.content.len() as u32)?;
        body.write_all(&self.content)?;

        out.write_u64::<BigEndian>(body.len() as u64)?;
        out.write_all(&body)?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> io::Result<Message> {
        let class = Identifier::from_raw(r.read_u64::<BigEndian>()?);
        let method = Identifier::from_raw(r.read_u64::<BigEndian>()?);
        let source_id = EndpointId(r.read_u64::<BigEndian>()?);
        let target_id = EndpointId(r.read_u64::<BigEndian>()?);
        let sequence = r.read_u64::<BigEndian>()?;
        let priority = Priority::from_u8(r.read_u8()?)?;
        let hop_count = r.read_u8()?;
        let age_ms = r.read_u64::<BigEndian>()?;
        let serializer_tag = r.read_u8()?;
        let verification = VerificationBits::from_bits_truncate(r.read_u8()?);
        let sig_len = r.read_u32::<BigEndian>()? as usize;
        let signature = if sig_len == 0 {
            None
        } else {
            let mut buf = vec![0u8; sig_len];
            r.read_exact(&mut buf)?;
            Some(buf)
        };
        let content_len = r.read_u32::<BigEndian>()? as usize;
        let mut content = vec![0u8; content_len];
        r.read_exact(&mut content)?;

        Ok(Message {
            id: MessageId { class, method },
            source_id,
            target_id,
            sequence,
            priority,
            hop_count,
            age_ms,
            serializer_tag,
            signature,
            verification,
            content,
        })
    }
}

/// Wall-clock-free stopwatch used to compute `age_ms` deltas between hops.
pub fn elapsed_since(start: Instant) -> Duration {
    start.elapsed()
}

/// Incremental frame reader: buffers bytes from a non-blocking source until
/// a full length-prefixed frame (an 8-byte big-endian length, then that many
/// body bytes) is available.
#[derive(Default)]
pub struct FrameReader {
    prefix: [u8; 8],
    prefix_read: usize,
    body: Vec<u8>,
    body_read: usize,
    body_len: usize,
    in_body: bool,
}

impl FrameReader {
    pub fn new() -> Self {
        FrameReader::default()
    }

    /// Feeds newly-received bytes in; returns every frame that became
    /// complete as a result (usually zero or one, but a burst of bytes can
    /// complete several frames at once).
    pub fn push(&mut self, mut data: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        let mut frames = Vec::new();
        while !data.is_empty() {
            if !self.in_body {
                let need = 8 - self.prefix_read;
                let take = need.min(data.len());
                self.prefix[self.prefix_read..self.prefix_read + take].copy_from_slice(&data[..take]);
                self.prefix_read += take;
                data = &data[take..];
                if self.prefix_read == 8 {
                    let len = (&self.prefix[..]).read_u64::<BigEndian>()? as usize;
                    self.body_len = len;
                    self.body = vec![0u8; len];
                    self.body_read = 0;
                    self.in_body = true;
                    self.prefix_read = 0;
                }
            } else {
                let need = self.body_len - self.body_read;
                let take = need.min(data.len());
                self.body[self.body_read..self.body_read + take].copy_from_slice(&data[..take]);
                self.body_read += take;
                data = &data[take..];
                if self.body_read == self.body_len {
                    frames.push(std::mem::take(&mut self.body));
                    self.in_body = false;
                    self.body_read = 0;
                    self.body_len = 0;
                }
            }
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::MessageId;

    #[test]
    fn message_round_trips_through_wire_frame() {
        let mut msg = Message::new(
            MessageId::new("StrUtilReq", "Reverse"),
            EndpointId(7),
            EndpointId(9),
            b"hello".to_vec(),
        );
        msg.sequence = 42;
        msg.priority = Priority::High;
        msg.hop_count = 3;
        msg.age_ms = 150;
        msg.verification = VerificationBits::SOURCE_ID | VerificationBits::MESSAGE_ID;
        msg.signature = Some(vec![1, 2, 3, 4]);

        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();

        let mut reader = FrameReader::new();
        let frames = reader.push(&buf).unwrap();
        assert_eq!(1, frames.len());

        let decoded = Message::decode(&mut &frames[0][..]).unwrap();
        assert_eq!(msg.id, decoded.id);
        assert_eq!(msg.source_id, decoded.source_id);
        assert_eq!(msg.target_id, decoded.target_id);
        assert_eq!(msg.sequence, decoded.sequence);
        assert_eq!(msg.priority, decoded.priority);
        assert_eq!(msg.hop_count, decoded.hop_count);
        assert_eq!(msg.age_ms, decoded.age_ms);
        assert_eq!(msg.verification, decoded.verification);
        assert_eq!(msg.signature, decoded.signature);
        assert_eq!(msg.content, decoded.content);
    }

    #[test]
    fn frame_reader_handles_split_and_coalesced_writes() {
        let mut msg = Message::new(MessageId::new("a", "b"), EndpointId(1), EndpointId(2), vec![9; 10]);
        msg.sequence = 1;
        let mut one = Vec::new();
        msg.encode(&mut one).unwrap();
        msg.sequence = 2;
        let mut two = Vec::new();
        msg.encode(&mut two).unwrap();

        let mut reader = FrameReader::new();
        let (a, b) = one.split_at(5);
        assert!(reader.push(a).unwrap().is_empty());
        let mut frames = reader.push(b).unwrap();
        assert_eq!(1, frames.len());

        // two frames arriving back to back in a single push
        let mut both = two.clone();
        both.extend_from_slice(&two);
        frames = reader.push(&both).unwrap();
        assert_eq!(2, frames.len());
    }

    #[test]
    fn forward_hop_stops_at_max_hop_count() {
        let mut msg = Message::new(MessageId::new("a", "b"), EndpointId(1), EndpointId(2), vec![]);
        msg.hop_count = MAX_HOP_COUNT;
        assert!(!msg.forward_hop(Duration::from_millis(1)));
        assert_eq!(MAX_HOP_COUNT, msg.hop_count);
    }
}
