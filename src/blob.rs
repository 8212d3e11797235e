// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! BLOB manipulator: fragments and reassembles arbitrary-size byte
//! sequences over the bounded-payload message bus.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::connection::Connection;
use crate::error::BlobError;
use crate::identifier::{EndpointId, Identifier, IdSequence, MessageId};
use crate::message::{Message, Priority};

/// A random-access readable source for an outgoing BLOB.
pub trait SourceIo {
    fn size(&self) -> u64;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize>;
}

impl SourceIo for Vec<u8> {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let offset = offset as usize;
        if offset >= self.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.len() - offset);
        buf[..n].copy_from_slice(&self[offset..offset + n]);
        Ok(n)
    }
}

/// An append-capable sink for an incoming BLOB.
pub trait TargetIo {
    fn expected_size(&self) -> Option<u64> {
        None
    }
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> std::io::Result<()>;
    fn finished(&mut self, _total_size: u64, _age: Duration) {}
    fn cancelled(&mut self, _err: BlobError) {}
}

/// Sink that accumulates fragments into one contiguous buffer, growing as
/// needed; used by tests and by simple consumers with no streaming needs.
#[derive(Default)]
pub struct BufferSink {
    pub data: Vec<u8>,
    pub done: bool,
    pub cancelled: Option<BlobError>,
}

impl TargetIo for BufferSink {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
        let end = offset as usize + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[offset as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    fn finished(&mut self, _total_size: u64, _age: Duration) {
        self.done = true;
    }

    fn cancelled(&mut self, err: BlobError) {
        self.cancelled = Some(err);
    }
}

const DEFAULT_FRAGMENT_SIZE: usize = 8192;
const DEFAULT_GAP_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_WATERMARK_BYTES: u64 = 1 << 20; // 1 MiB in flight per destination

struct OutgoingBlob {
    blob_id: u64,
    target_id: EndpointId,
    class_id: Identifier,
    source: Box<dyn SourceIo>,
    priority: Priority,
    deadline: Instant,
    offset: u64,
    size: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct Range {
    start: u64,
    end: u64,
}

struct IncomingBlob {
    source_id: EndpointId,
    class_id: Identifier,
    target: Box<dyn TargetIo>,
    received: Vec<Range>,
    expected_size: Option<u64>,
    last_fragment_last: bool,
    started: Instant,
    last_activity: Instant,
    deadline: Instant,
    gap_notified: bool,
}

impl IncomingBlob {
    /// Inserts `[offset, offset+len)` into the received-range set, merging
    /// adjacent/overlapping ranges so contiguous coverage can be queried in
    /// O(ranges) instead of O(bytes).
    fn mark_received(&mut self, offset: u64, len: u64) {
        let new = Range { start: offset, end: offset + len };
        self.received.push(new);
        self.received.sort();
        let mut merged: Vec<Range> = Vec::with_capacity(self.received.len());
        for r in self.received.drain(..) {
            if let Some(last) = merged.last_mut() {
                if r.start <= last.end {
                    last.end = last.end.max(r.end);
                    continue;
                }
            }
            merged.push(r);
        }
        self.received = merged;
    }

    fn is_complete(&self) -> bool {
        match self.expected_size {
            Some(size) => self.last_fragment_last && self.received.len() == 1 && self.received[0] == (Range { start: 0, end: size }),
            None => false,
        }
    }

    fn first_gap_end(&self) -> Option<u64> {
        self.received.first().filter(|r| r.start > 0).map(|_| 0).or_else(|| {
            if self.received.len() > 1 {
                Some(self.received[0].end)
            } else {
                None
            }
        })
    }
}

/// Completion/cancellation signals emitted locally for observers (e.g. a
/// resource-transfer service) that want to react without polling `TargetIo`.
pub enum BlobEvent {
    Finished { blob_id: u64, source_id: EndpointId, total_size: u64, age: Duration },
    Cancelled { blob_id: u64, source_id: EndpointId, err: BlobError },
}

type SinkFactory = Box<dyn Fn(EndpointId, u64) -> Option<Box<dyn TargetIo>>>;

/// Fragments outgoing BLOBs and reassembles incoming ones, with flow
/// control, priority preemption and deadline cancellation.
pub struct BlobManipulator {
    outgoing: Vec<OutgoingBlob>,
    incoming: HashMap<(EndpointId, u64), IncomingBlob>,
    sink_factories: HashMap<Identifier, SinkFactory>,
    id_seq: IdSequence,
    in_flight: HashMap<EndpointId, u64>,
    watermark: u64,
    gap_timeout: Duration,
    events: Vec<BlobEvent>,
}

impl BlobManipulator {
    pub fn new() -> Self {
        BlobManipulator {
            outgoing: Vec::new(),
            incoming: HashMap::new(),
            sink_factories: HashMap::new(),
            id_seq: IdSequence::new(),
            in_flight: HashMap::new(),
            watermark: DEFAULT_WATERMARK_BYTES,
            gap_timeout: DEFAULT_GAP_TIMEOUT,
            events: Vec::new(),
        }
    }

    pub fn set_watermark(&mut self, bytes: u64) {
        self.watermark = bytes;
    }

    /// Registers a sink factory for incoming BLOBs of `class_id`; called
    /// with `(source_id, declared_size)` on first fragment of an unknown
    /// blob. Returning `None` drops the BLOB.
    pub fn register_sink_factory(
        &mut self,
        class_id: Identifier,
        factory: impl Fn(EndpointId, u64) -> Option<Box<dyn TargetIo>> + 'static,
    ) {
        self.sink_factories.insert(class_id, Box::new(factory));
    }

    /// Enqueues a BLOB for outgoing transfer. Returns the blob id used in
    /// `blobFrgmnt`/`blobResend` messages.
    pub fn push_outgoing(
        &mut self,
        target_id: EndpointId,
        class_id: Identifier,
        source: Box<dyn SourceIo>,
        priority: Priority,
        deadline_from_now: Duration,
    ) -> u64 {
        let blob_id = self.id_seq.next();
        let size = source.size();
        self.outgoing.push(OutgoingBlob {
            blob_id,
            target_id,
            class_id,
            source,
            priority,
            deadline: Instant::now() + deadline_from_now,
            offset: 0,
            size,
        });
        blob_id
    }

    pub fn drain_events(&mut self) -> Vec<BlobEvent> {
        std::mem::take(&mut self.events)
    }

    /// Emits as many `blobFrgmnt` messages onto `connection` as its send
    /// capacity and the flow-control watermark allow, highest priority
    /// first, then cancels any outgoing transfer past its deadline.
    pub fn update_outgoing(&mut self, source_id: EndpointId, connection: &mut dyn Connection) -> bool {
        let mut work = false;
        let fragment_size = match connection.max_data_size() {
            0 => DEFAULT_FRAGMENT_SIZE,
            n => n.min(DEFAULT_FRAGMENT_SIZE * 4),
        };

        let now = Instant::now();
        self.outgoing.retain(|b| {
            if now >= b.deadline {
                warn!("outgoing blob {} past deadline, cancelling", b.blob_id);
                false
            } else {
                true
            }
        });

        self.outgoing.sort_by(|a, b| b.priority.cmp(&a.priority));

        for blob in self.outgoing.iter_mut() {
            let in_flight = *self.in_flight.get(&blob.target_id).unwrap_or(&0);
            if in_flight >= self.watermark {
                trace!("flow control: suspending blob {} to {:?}", blob.blob_id, blob.target_id);
                continue;
            }
            if blob.offset >= blob.size {
                continue;
            }
            let mut buf = vec![0u8; fragment_size];
            let n = match blob.source.read_at(blob.offset, &mut buf) {
                Ok(n) => n,
                Err(e) => {
                    warn!("read error on outgoing blob {}: {e}", blob.blob_id);
                    continue;
                }
            };
            if n == 0 {
                continue;
            }
            buf.truncate(n);
            let last = blob.offset + n as u64 >= blob.size;
            let payload = encode_fragment(blob.blob_id, blob.offset, &buf, last);
            let mut message = Message::new(MessageId { class: blob.class_id, method: Identifier::new("blobFrgmnt") }, source_id, blob.target_id, payload);
            message.priority = blob.priority;
            if connection.send(message) {
                blob.offset += n as u64;
                *self.in_flight.entry(blob.target_id).or_insert(0) += n as u64;
                work = true;
            }
        }

        for blob in self.outgoing.iter().filter(|b| b.offset >= b.size) {
            if let Some(in_flight) = self.in_flight.get_mut(&blob.target_id) {
                *in_flight = in_flight.saturating_sub(blob.size);
            }
        }
        self.outgoing.retain(|b| b.offset < b.size);
        work
    }

    /// Accounts for a flow-info update lowering the in-flight estimate for
    /// `target`, as periodically emitted by routers alongside their stats.
    /// `update_outgoing` already releases a blob's own contribution once it
    /// finishes sending; this is for a sharper estimate from the receiving
    /// side when one is available.
    pub fn on_flow_info(&mut self, target: EndpointId, in_flight_bytes: u64) {
        self.in_flight.insert(target, in_flight_bytes);
    }

    /// Handles one `blobFrgmnt` or `blobResend` control message addressed
    /// to the local manipulator. Returns a `blobResend` message to send
    /// back, if a gap was detected.
    pub fn handle_control(&mut self, message: &Message) -> Option<Message> {
        if message.id.method == Identifier::new("blobFrgmnt") {
            self.handle_fragment(message)
        } else if message.id.method == Identifier::new("blobResend") {
            self.handle_resend(message);
            None
        } else {
            None
        }
    }

    /// Rewinds the matching outgoing blob's offset so `update_outgoing`
    /// resends from the gap the peer reported, rather than continuing to
    /// read forward from where it left off.
    fn handle_resend(&mut self, message: &Message) {
        let Some((blob_id, offset, _size)) = decode_resend_request(&message.content) else { return };
        if let Some(blob) = self.outgoing.iter_mut().find(|b| b.blob_id == blob_id && b.target_id == message.source_id) {
            if offset < blob.offset {
                debug!("rewinding outgoing blob {blob_id} to offset {offset} on resend request");
                blob.offset = offset;
            }
        }
    }

    fn handle_fragment(&mut self, message: &Message) -> Option<Message> {
        let (blob_id, offset, bytes, last) = decode_fragment(&message.content)?;
        let key = (message.source_id, blob_id);

        if !self.incoming.contains_key(&key) {
            let factory = self.sink_factories.get(&message.id.class)?;
            let declared_size = if last { offset + bytes.len() as u64 } else { 0 };
            let sink = factory(message.source_id, declared_size)?;
            self.incoming.insert(
                key,
                IncomingBlob {
                    source_id: message.source_id,
                    class_id: message.id.class,
                    target: sink,
                    received: Vec::new(),
                    expected_size: None,
                    last_fragment_last: false,
                    started: Instant::now(),
                    last_activity: Instant::now(),
                    deadline: Instant::now() + Duration::from_secs(300),
                    gap_notified: false,
                },
            );
        }

        let blob = self.incoming.get_mut(&key)?;
        if blob.target.write_at(offset, &bytes).is_err() {
            self.events.push(BlobEvent::Cancelled { blob_id, source_id: message.source_id, err: BlobError::SinkRejected { offset } });
            self.incoming.remove(&key);
            return None;
        }
        blob.mark_received(offset, bytes.len() as u64);
        blob.last_activity = Instant::now();
        if last {
            blob.last_fragment_last = true;
            blob.expected_size = Some(offset + bytes.len() as u64);
        }

        if blob.is_complete() {
            let size = blob.expected_size.unwrap();
            let age = blob.started.elapsed();
            blob.target.finished(size, age);
            self.events.push(BlobEvent::Finished { blob_id, source_id: blob.source_id, total_size: size, age });
            self.incoming.remove(&key);
            return None;
        }

        if let Some(gap_end) = blob.first_gap_end() {
            if blob.last_activity.elapsed() >= self.gap_timeout && !blob.gap_notified {
                blob.gap_notified = true;
                debug!("requesting resend for blob {blob_id} from offset {gap_end}");
                let payload = encode_resend_request(blob_id, gap_end, DEFAULT_FRAGMENT_SIZE as u32);
                return Some(Message::new(
                    MessageId { class: blob.class_id, method: Identifier::new("blobResend") },
                    EndpointId::UNASSIGNED,
                    blob.source_id,
                    payload,
                ));
            }
        }
        None
    }

    /// Cancels incoming transfers past their deadline, notifying their sink.
    pub fn expire_incoming(&mut self) {
        let now = Instant::now();
        let expired: Vec<_> = self.incoming.iter().filter(|(_, b)| now >= b.deadline).map(|(k, _)| *k).collect();
        for key in expired {
            if let Some(mut blob) = self.incoming.remove(&key) {
                blob.target.cancelled(BlobError::DeadlineExceeded(key.1));
                self.events.push(BlobEvent::Cancelled { blob_id: key.1, source_id: key.0, err: BlobError::DeadlineExceeded(key.1) });
            }
        }
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing.len()
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }
}

impl Default for BlobManipulator {
    fn default() -> Self {
        BlobManipulator::new()
    }
}

fn encode_fragment(blob_id: u64, offset: u64, bytes: &[u8], last: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(17 + bytes.len());
    out.extend_from_slice(&blob_id.to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.push(last as u8);
    out.extend_from_slice(bytes);
    out
}

fn decode_fragment(buf: &[u8]) -> Option<(u64, u64, Vec<u8>, bool)> {
    if buf.len() < 17 {
        return None;
    }
    let blob_id = u64::from_be_bytes(buf[0..8].try_into().ok()?);
    let offset = u64::from_be_bytes(buf[8..16].try_into().ok()?);
    let last = buf[16] != 0;
    Some((blob_id, offset, buf[17..].to_vec(), last))
}

fn encode_resend_request(blob_id: u64, offset: u64, size: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    out.extend_from_slice(&blob_id.to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(&size.to_be_bytes());
    out
}

fn decode_resend_request(buf: &[u8]) -> Option<(u64, u64, u32)> {
    if buf.len() < 20 {
        return None;
    }
    let blob_id = u64::from_be_bytes(buf[0..8].try_into().ok()?);
    let offset = u64::from_be_bytes(buf[8..16].try_into().ok()?);
    let size = u32::from_be_bytes(buf[16..20].try_into().ok()?);
    Some((blob_id, offset, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::inprocess::loopback_pair;

    #[test]
    fn round_trips_a_blob_across_a_loopback_connection() {
        let mut sender = BlobManipulator::new();
        let mut receiver = BlobManipulator::new();
        let class = Identifier::new("TestBlob");
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();

        let (mut a, mut b) = loopback_pair();
        sender.push_outgoing(EndpointId(2), class, Box::new(data.clone()), Priority::Normal, Duration::from_secs(5));

        let received = std::rc::Rc::new(std::cell::RefCell::new(BufferSink::default()));
        let received2 = received.clone();
        receiver.register_sink_factory(class, move |_src, _size| {
            Some(Box::new(ProxySink(received2.clone())) as Box<dyn TargetIo>)
        });

        for _ in 0..20 {
            sender.update_outgoing(EndpointId(1), &mut a);
            let mut frames = Vec::new();
            b.fetch(&mut |m| {
                frames.push(m);
                true
            });
            for f in frames {
                receiver.handle_control(&f);
            }
            if received.borrow().done {
                break;
            }
        }

        assert!(received.borrow().done);
        assert_eq!(data, received.borrow().data);
    }

    struct ProxySink(std::rc::Rc<std::cell::RefCell<BufferSink>>);
    impl TargetIo for ProxySink {
        fn write_at(&mut self, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
            self.0.borrow_mut().write_at(offset, bytes)
        }
        fn finished(&mut self, total_size: u64, age: Duration) {
            self.0.borrow_mut().finished(total_size, age);
        }
        fn cancelled(&mut self, err: BlobError) {
            self.0.borrow_mut().cancelled(err);
        }
    }

    #[test]
    fn blob_resend_request_rewinds_outgoing_offset() {
        let mut sender = BlobManipulator::new();
        let class = Identifier::new("ResendBlob");
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let (mut a, mut b) = loopback_pair();
        let blob_id = sender.push_outgoing(EndpointId(2), class, Box::new(data), Priority::Normal, Duration::from_secs(5));

        sender.update_outgoing(EndpointId(1), &mut a);
        let mut frames = Vec::new();
        b.fetch(&mut |m| {
            frames.push(m);
            true
        });
        assert_eq!(1, frames.len());
        let (_, offset, _, _) = decode_fragment(&frames[0].content).unwrap();
        assert_eq!(0, offset);

        let resend = Message::new(
            MessageId { class, method: Identifier::new("blobResend") },
            EndpointId(2),
            EndpointId(1),
            encode_resend_request(blob_id, 1000, DEFAULT_FRAGMENT_SIZE as u32),
        );
        sender.handle_control(&resend);

        sender.update_outgoing(EndpointId(1), &mut a);
        let mut frames = Vec::new();
        b.fetch(&mut |m| {
            frames.push(m);
            true
        });
        assert_eq!(1, frames.len());
        let (_, offset, _, _) = decode_fragment(&frames[0].content).unwrap();
        assert_eq!(1000, offset, "resend request should have rewound the sender's offset");
    }

    #[test]
    fn completed_blob_releases_its_watermark_contribution() {
        let mut sender = BlobManipulator::new();
        sender.set_watermark(20);
        let class = Identifier::new("WatermarkBlob");

        let (mut a, _b) = loopback_pair();
        sender.push_outgoing(EndpointId(2), class, Box::new(vec![1u8; 20]), Priority::Normal, Duration::from_secs(5));
        sender.push_outgoing(EndpointId(2), class, Box::new(vec![2u8; 20]), Priority::Normal, Duration::from_secs(5));

        // the first blob alone saturates the watermark, so the second is
        // held back even though the first also completes within this call.
        assert!(sender.update_outgoing(EndpointId(1), &mut a));
        assert_eq!(1, sender.outgoing_count());

        // completing the first released its contribution, so the second can go.
        assert!(sender.update_outgoing(EndpointId(1), &mut a));
        assert_eq!(0, sender.outgoing_count());
    }

    #[test]
    fn mark_received_merges_overlapping_and_adjacent_ranges() {
        let mut blob = IncomingBlob {
            source_id: EndpointId(1),
            class_id: Identifier::new("x"),
            target: Box::new(BufferSink::default()),
            received: Vec::new(),
            expected_size: Some(30),
            last_fragment_last: true,
            started: Instant::now(),
            last_activity: Instant::now(),
            deadline: Instant::now() + Duration::from_secs(1),
            gap_notified: false,
        };
        blob.mark_received(10, 10);
        blob.mark_received(0, 10);
        blob.mark_received(20, 10);
        assert_eq!(vec![Range { start: 0, end: 30 }], blob.received);
        assert!(blob.is_complete());
    }
}
