// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! An endpoint queries network topology through its router and sees itself
//! and its sibling endpoint reported back.

use relaybus::prelude::*;
use relaybus::router::LinkRole;
use relaybus::services::topology::TopologyTracker;
use relaybus::services::Service;
use relaybus::transport::inprocess::loopback_pair;

fn drive(router: &mut Router, endpoints: &mut [&mut Endpoint], ticks: usize) {
    for _ in 0..ticks {
        router.update();
        for ep in endpoints.iter_mut() {
            ep.update();
            ep.process_all();
        }
    }
}

#[test]
fn discover_reports_both_endpoints_connected_to_the_router() {
    let context = Context::new();
    let id_seq = GlobalIdSequence::new();
    let mut router = Router::new(context.clone(), &id_seq);

    let (router_side_a, observer_side) = loopback_pair();
    let (router_side_b, other_side) = loopback_pair();
    router.accept_connection(Box::new(router_side_a), LinkRole::Endpoint);
    router.accept_connection(Box::new(router_side_b), LinkRole::Endpoint);

    let mut observer = Endpoint::new(context.clone());
    observer.add_connection(Box::new(observer_side));
    let mut other = Endpoint::new(context.clone());
    other.add_connection(Box::new(other_side));

    let mut tracker = TopologyTracker::new();
    tracker.attach(&mut observer);

    drive(&mut router, &mut [&mut observer, &mut other], 5);
    let other_id = other.id().expect("other endpoint should have an assigned id by now");

    tracker.discover(&mut observer);
    drive(&mut router, &mut [&mut observer, &mut other], 3);
    tracker.update(&mut observer);

    let observed = tracker.drain();
    assert_eq!(2, observed.len());
    assert!(observed.iter().all(|i| i.kind == relaybus::services::topology::NodeKind::Endpoint));
    assert!(observed.iter().any(|i| i.peer_id == other_id));
}
