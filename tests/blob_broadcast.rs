// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! One BLOB queued with a broadcast target reaches every connection it is
//! pushed across, each side reassembling its own independent copy.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use relaybus::prelude::*;
use relaybus::transport::inprocess::loopback_pair;

#[test]
fn one_outgoing_blob_reassembles_identically_on_two_receivers() {
    let class = Identifier::new("FirmwarePush");
    let data: Vec<u8> = (0..20_000u32).map(|i| (i % 241) as u8).collect();

    let mut sender = BlobManipulator::new();
    sender.push_outgoing(EndpointId::BROADCAST, class, Box::new(data.clone()), Priority::Normal, Duration::from_secs(5));

    let (mut link_a_near, mut link_a_far) = loopback_pair();
    let (mut link_b_near, mut link_b_far) = loopback_pair();

    let sink_a = Rc::new(RefCell::new(BufferSink::default()));
    let sink_b = Rc::new(RefCell::new(BufferSink::default()));
    let mut receiver_a = BlobManipulator::new();
    let mut receiver_b = BlobManipulator::new();
    {
        let sink_a = sink_a.clone();
        receiver_a.register_sink_factory(class, move |_src, _size| Some(Box::new(ProxySink(sink_a.clone())) as Box<dyn TargetIo>));
    }
    {
        let sink_b = sink_b.clone();
        receiver_b.register_sink_factory(class, move |_src, _size| Some(Box::new(ProxySink(sink_b.clone())) as Box<dyn TargetIo>));
    }

    for _ in 0..30 {
        sender.update_outgoing(EndpointId(1), &mut link_a_near);
        sender.update_outgoing(EndpointId(1), &mut link_b_near);

        let mut frames_a = Vec::new();
        link_a_far.fetch(&mut |m| {
            frames_a.push(m);
            true
        });
        for f in frames_a {
            receiver_a.handle_control(&f);
        }

        let mut frames_b = Vec::new();
        link_b_far.fetch(&mut |m| {
            frames_b.push(m);
            true
        });
        for f in frames_b {
            receiver_b.handle_control(&f);
        }

        if sink_a.borrow().done && sink_b.borrow().done {
            break;
        }
    }

    assert!(sink_a.borrow().done);
    assert!(sink_b.borrow().done);
    assert_eq!(data, sink_a.borrow().data);
    assert_eq!(data, sink_b.borrow().data);
}

struct ProxySink(Rc<RefCell<BufferSink>>);
impl TargetIo for ProxySink {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
        self.0.borrow_mut().write_at(offset, bytes)
    }
    fn finished(&mut self, total_size: u64, age: std::time::Duration) {
        self.0.borrow_mut().finished(total_size, age);
    }
    fn cancelled(&mut self, err: relaybus::error::BlobError) {
        self.0.borrow_mut().cancelled(err);
    }
}
