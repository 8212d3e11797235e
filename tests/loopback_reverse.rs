// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Two endpoints joined through one router: a client sends a string and a
//! server replies with it reversed, request and reply riding distinct
//! classes so class asymmetry between a query and its answer is exercised,
//! not just method asymmetry.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use relaybus::prelude::*;
use relaybus::router::LinkRole;
use relaybus::transport::inprocess::loopback_pair;

fn request_id() -> MessageId {
    MessageId::new("StrUtilReq", "Reverse")
}

fn response_id() -> MessageId {
    MessageId::new("StrUtilRes", "Reverse")
}

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
fn client_receives_each_string_reversed_under_a_distinct_response_class() {
    let context = Context::new();
    let id_seq = GlobalIdSequence::new();
    let mut router = Router::new(context.clone(), &id_seq);

    let (router_side_a, client_side) = loopback_pair();
    let (router_side_b, server_side) = loopback_pair();
    router.accept_connection(Box::new(router_side_a), LinkRole::Endpoint);
    router.accept_connection(Box::new(router_side_b), LinkRole::Endpoint);

    let mut client = Endpoint::new(context.clone());
    client.add_connection(Box::new(client_side));

    let mut server = Endpoint::new(context.clone());
    server.add_connection(Box::new(server_side));

    let requests: Rc<RefCell<VecDeque<Message>>> = Rc::new(RefCell::new(VecDeque::new()));
    let requests2 = requests.clone();
    server.subscribe(
        request_id(),
        Box::new(move |_ctx: &HandlerContext, msg: &Message| {
            requests2.borrow_mut().push_back(msg.clone());
            true
        }),
    );

    let replies: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let replies2 = replies.clone();
    client.subscribe(
        response_id(),
        Box::new(move |_ctx: &HandlerContext, msg: &Message| {
            replies2.borrow_mut().push(msg.content.clone());
            true
        }),
    );

    // drive a few ticks so both endpoints get their ids assigned before
    // the client sends its requests.
    drive(&mut router, &mut [&mut client, &mut server], 5);
    assert!(client.id().is_some());
    assert!(server.id().is_some());

    for word in ["foo", "bar", "baz", "qux"] {
        client.broadcast(request_id(), Priority::Normal, word.as_bytes().to_vec());
        drive(&mut router, &mut [&mut client, &mut server], 3);

        let mut pending = requests.borrow_mut();
        while let Some(req) = pending.pop_front() {
            let mut reversed = req.content.clone();
            reversed.reverse();
            server.respond_to(&req, response_id(), reversed);
        }
        drop(pending);

        drive(&mut router, &mut [&mut client, &mut server], 3);
    }

    let expected: Vec<Vec<u8>> = ["oof", "rab", "zab", "xuq"].iter().map(|s| s.as_bytes().to_vec()).collect();
    assert_eq!(expected, *replies.borrow());
}
