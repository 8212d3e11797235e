// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! A trigger asks a target endpoint to shut down through a router; the
//! target accepts a fresh request and, separately, refuses a stale one.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use relaybus::prelude::*;
use relaybus::router::LinkRole;
use relaybus::services::shutdown::{ShutdownPolicy, ShutdownState, ShutdownTarget, ShutdownTrigger};
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

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}

#[test]
fn fresh_request_is_accepted_and_shuts_the_target_down() {
    let context = Context::new();
    let id_seq = GlobalIdSequence::new();
    let mut router = Router::new(context.clone(), &id_seq);

    let (router_side_a, trigger_side) = loopback_pair();
    let (router_side_b, target_side) = loopback_pair();
    router.accept_connection(Box::new(router_side_a), LinkRole::Endpoint);
    router.accept_connection(Box::new(router_side_b), LinkRole::Endpoint);

    let mut trigger = Endpoint::new(context.clone());
    trigger.add_connection(Box::new(trigger_side));
    let mut target = Endpoint::new(context.clone());
    target.add_connection(Box::new(target_side));

    let mut shutdown = ShutdownTarget::new(ShutdownPolicy { verify: false, max_age: Duration::from_secs(5), delay: Duration::from_millis(0) });
    shutdown.attach(&mut target);

    drive(&mut router, &mut [&mut trigger, &mut target], 5);
    let target_id = target.id().expect("target should have an assigned id by now");

    ShutdownTrigger::send(&mut trigger, target_id, now_ms());
    drive(&mut router, &mut [&mut trigger, &mut target], 3);
    assert!(shutdown.update(&mut target));

    let accepted = shutdown.drain_accepted();
    assert_eq!(1, accepted.len());
    assert_eq!(ShutdownState::ShuttingDown, shutdown.state());
}

#[test]
fn stale_request_past_max_age_is_refused() {
    let context = Context::new();
    let id_seq = GlobalIdSequence::new();
    let mut router = Router::new(context.clone(), &id_seq);

    let (router_side_a, trigger_side) = loopback_pair();
    let (router_side_b, target_side) = loopback_pair();
    router.accept_connection(Box::new(router_side_a), LinkRole::Endpoint);
    router.accept_connection(Box::new(router_side_b), LinkRole::Endpoint);

    let mut trigger = Endpoint::new(context.clone());
    trigger.add_connection(Box::new(trigger_side));
    let mut target = Endpoint::new(context.clone());
    target.add_connection(Box::new(target_side));

    let mut shutdown = ShutdownTarget::new(ShutdownPolicy { verify: false, max_age: Duration::from_millis(5), delay: Duration::from_secs(30) });
    shutdown.attach(&mut target);

    drive(&mut router, &mut [&mut trigger, &mut target], 5);
    let target_id = target.id().expect("target should have an assigned id by now");

    let stale_ms = now_ms().saturating_sub(1000);
    ShutdownTrigger::send(&mut trigger, target_id, stale_ms);
    drive(&mut router, &mut [&mut trigger, &mut target], 3);
    shutdown.update(&mut target);

    assert_eq!(1, shutdown.drain_refused().len());
    assert_eq!(ShutdownState::Running, shutdown.state());
}
