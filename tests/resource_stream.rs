// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! A single resource server, multiplexed by one router across two
//! simultaneous consumers; a separate scenario reports a missing resource
//! without leaving a dangling pending request.

use relaybus::connection::Connection;
use relaybus::prelude::*;
use relaybus::router::LinkRole;
use relaybus::services::resource_transfer::{ResourceConsumer, ResourceServer};
use relaybus::transport::inprocess::loopback_pair;

/// Seeds the router's endpoint table the same way a live `confirmId`
/// handshake would, before the connection is handed off to a server or
/// consumer that doesn't speak the endpoint identity protocol itself.
fn confirm(raw: &mut impl Connection, id: EndpointId, router_id: EndpointId) {
    let mut msg = Message::new(MessageId::control("confirmId"), id, router_id, id.0.to_be_bytes().to_vec());
    msg.sequence = 0;
    raw.send(msg);
}

#[test]
fn one_server_answers_two_consumers_multiplexed_through_one_router() {
    let context = Context::new();
    let id_seq = GlobalIdSequence::new();
    let mut router = Router::new(context, &id_seq);

    let server_id = EndpointId(1);
    let consumer_a_id = EndpointId(2);
    let consumer_b_id = EndpointId(3);

    let (router_side_server, mut server_conn) = loopback_pair();
    let (router_side_a, mut consumer_a_conn) = loopback_pair();
    let (router_side_b, mut consumer_b_conn) = loopback_pair();

    confirm(&mut server_conn, server_id, router.own_id());
    confirm(&mut consumer_a_conn, consumer_a_id, router.own_id());
    confirm(&mut consumer_b_conn, consumer_b_id, router.own_id());

    router.accept_connection(Box::new(router_side_server), LinkRole::Endpoint);
    router.accept_connection(Box::new(router_side_a), LinkRole::Endpoint);
    router.accept_connection(Box::new(router_side_b), LinkRole::Endpoint);
    router.update();

    let mut server = ResourceServer::new(server_id, Box::new(server_conn));
    server.register_random_provider();
    let mut consumer_a = ResourceConsumer::new(consumer_a_id, Box::new(consumer_a_conn));
    let mut consumer_b = ResourceConsumer::new(consumer_b_id, Box::new(consumer_b_conn));

    let seq_a = consumer_a.query(server_id, "eagires:///random?count=1024");
    let seq_b = consumer_b.query(server_id, "eagires:///random?count=4096");

    for _ in 0..60 {
        router.update();
        server.update();
        consumer_a.update();
        consumer_b.update();
        if !consumer_a.has_pending(seq_a) && !consumer_b.has_pending(seq_b) {
            break;
        }
    }

    let result_a = consumer_a.result(seq_a).expect("consumer a's resource should have completed");
    let result_b = consumer_b.result(seq_b).expect("consumer b's resource should have completed");
    assert_eq!(1024, result_a.len());
    assert_eq!(4096, result_b.len());
    assert_eq!((1023 % 256) as u8, *result_a.last().unwrap());
    assert_eq!((4095 % 256) as u8, *result_b.last().unwrap());
}

#[test]
fn query_for_unknown_resource_is_reported_as_missing() {
    let (server_conn, consumer_conn) = loopback_pair();

    let mut server = ResourceServer::new(EndpointId(1), Box::new(server_conn));
    server.register_random_provider();
    let mut consumer = ResourceConsumer::new(EndpointId(2), Box::new(consumer_conn));

    let sequence = consumer.query(EndpointId(1), "eagires:///does-not-exist");

    for _ in 0..10 {
        server.update();
        consumer.update();
    }

    assert!(!consumer.has_pending(sequence));
    assert!(consumer.result(sequence).is_none());
}
