// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Shutdown request/trigger pair: a policy-gated state machine deciding
//! whether to honor a peer's request to stop, and the counterpart that
//! sends such requests.
//!
//! A trigger posts a `shutdown` control message carrying a monotonic
//! timestamp; a target decides whether to honor it based on a verify flag,
//! a maximum acceptable age, and a delay before actually shutting down.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::endpoint::Endpoint;
use crate::identifier::{EndpointId, MessageId};
use crate::message::{Message, Priority, VerificationBits};

use super::Service;

fn shutdown_id() -> MessageId {
    MessageId::control("shutdown")
}

/// A decoded shutdown request, as seen by the target.
#[derive(Clone, Copy, Debug)]
pub struct ShutdownRequest {
    pub source_id: EndpointId,
    pub age: Duration,
    pub verified: bool,
}

/// Policy a [`ShutdownTarget`] enforces before honoring a request
/// (`msgbus.{router,bridge,endpoint}.shutdown.{verify,max_age,delay}`).
#[derive(Clone, Copy, Debug)]
pub struct ShutdownPolicy {
    pub verify: bool,
    pub max_age: Duration,
    pub delay: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        ShutdownPolicy { verify: false, max_age: Duration::from_secs(2), delay: Duration::from_secs(0) }
    }
}

/// Whether a target is still running, counting down to shutdown, or done.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShutdownState {
    Running,
    Pending(Instant),
    ShuttingDown,
}

/// Accepts or refuses `shutdown` requests per [`ShutdownPolicy`], entering a
/// delayed shutdown state on acceptance.
pub struct ShutdownTarget {
    pub policy: ShutdownPolicy,
    /// Vetoes any accepted request regardless of policy (`msgbus.*.keep_running`).
    pub keep_running: bool,
    state: ShutdownState,
    accepted: Vec<ShutdownRequest>,
    refused: Vec<ShutdownRequest>,
    received: Rc<RefCell<VecDeque<Message>>>,
}

impl ShutdownTarget {
    pub fn new(policy: ShutdownPolicy) -> Self {
        ShutdownTarget {
            policy,
            keep_running: false,
            state: ShutdownState::Running,
            accepted: Vec::new(),
            refused: Vec::new(),
            received: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.state
    }

    /// Evaluates a decoded request against policy, transitioning state on
    /// acceptance. `keep_running` (`msgbus.*.keep_running`) vetoes any
    /// shutdown unconditionally.
    pub fn handle_request(&mut self, keep_running: bool, request: ShutdownRequest) {
        if keep_running {
            self.refused.push(request);
            return;
        }
        if self.policy.verify && !request.verified {
            self.refused.push(request);
            return;
        }
        if request.age > self.policy.max_age {
            self.refused.push(request);
            return;
        }
        self.state = ShutdownState::Pending(Instant::now() + self.policy.delay);
        self.accepted.push(request);
    }

    pub fn drain_accepted(&mut self) -> Vec<ShutdownRequest> {
        std::mem::take(&mut self.accepted)
    }

    pub fn drain_refused(&mut self) -> Vec<ShutdownRequest> {
        std::mem::take(&mut self.refused)
    }

    /// Advances a pending shutdown to `ShuttingDown` once its delay elapses.
    pub fn poll(&mut self) -> bool {
        if let ShutdownState::Pending(at) = self.state {
            if Instant::now() >= at {
                self.state = ShutdownState::ShuttingDown;
                return true;
            }
        }
        false
    }
}

impl Service for ShutdownTarget {
    fn attach(&mut self, endpoint: &mut Endpoint) {
        let received = self.received.clone();
        endpoint.subscribe(
            shutdown_id(),
            Box::new(move |_ctx: &crate::subscriber::HandlerContext, message: &Message| {
                received.borrow_mut().push_back(message.clone());
                true
            }),
        );
    }

    fn update(&mut self, _endpoint: &mut Endpoint) -> bool {
        let messages: Vec<Message> = self.received.borrow_mut().drain(..).collect();
        let mut work = !messages.is_empty();
        let now_ms = now_millis();
        for message in messages {
            let verified = verification_ok(message.verification);
            if let Some(request) = decode_request(&message.content, message.source_id, now_ms, verified) {
                self.handle_request(self.keep_running, request);
            }
        }
        work |= self.poll();
        work
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Decodes a `shutdown` payload (an 8-byte big-endian monotonic millisecond
/// timestamp) into the age relative to `now_ms`.
pub fn decode_request(content: &[u8], source_id: EndpointId, now_ms: u64, verified: bool) -> Option<ShutdownRequest> {
    let sent_ms = u64::from_be_bytes(content.get(..8)?.try_into().ok()?);
    let age = Duration::from_millis(now_ms.saturating_sub(sent_ms));
    Some(ShutdownRequest { source_id, age, verified })
}

/// Sends a `shutdown` request to `target`, stamping it with `now_ms`.
pub struct ShutdownTrigger;

impl ShutdownTrigger {
    pub fn send(endpoint: &mut Endpoint, target: EndpointId, now_ms: u64) {
        endpoint.send_to(target, shutdown_id(), Priority::High, now_ms.to_be_bytes().to_vec());
    }
}

pub fn verification_ok(bits: VerificationBits) -> bool {
    bits.contains(VerificationBits::SOURCE_PRIVATE_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_max_age_and_no_verify_required_is_accepted_after_delay() {
        let mut target = ShutdownTarget::new(ShutdownPolicy { verify: false, max_age: Duration::from_millis(2500), delay: Duration::from_millis(10) });
        let request = decode_request(&500u64.to_be_bytes(), EndpointId(1), 500, false).unwrap();
        assert_eq!(Duration::from_millis(0), request.age);
        target.handle_request(false, request);
        assert_eq!(1, target.drain_accepted().len());
        assert!(matches!(target.state(), ShutdownState::Pending(_)));
        std::thread::sleep(Duration::from_millis(15));
        assert!(target.poll());
        assert_eq!(ShutdownState::ShuttingDown, target.state());
    }

    #[test]
    fn request_older_than_max_age_is_refused() {
        let mut target = ShutdownTarget::new(ShutdownPolicy { verify: false, max_age: Duration::from_millis(2500), delay: Duration::from_secs(30) });
        let request = ShutdownRequest { source_id: EndpointId(2), age: Duration::from_secs(3), verified: false };
        target.handle_request(false, request);
        assert_eq!(1, target.drain_refused().len());
        assert_eq!(ShutdownState::Running, target.state());
    }

    #[test]
    fn verify_required_refuses_unverified_request() {
        let mut target = ShutdownTarget::new(ShutdownPolicy { verify: true, max_age: Duration::from_secs(5), delay: Duration::from_secs(0) });
        let request = ShutdownRequest { source_id: EndpointId(3), age: Duration::from_millis(10), verified: false };
        target.handle_request(false, request);
        assert_eq!(1, target.drain_refused().len());
    }

    #[test]
    fn keep_running_vetoes_any_request() {
        let mut target = ShutdownTarget::new(ShutdownPolicy::default());
        let request = ShutdownRequest { source_id: EndpointId(4), age: Duration::from_millis(1), verified: true };
        target.handle_request(true, request);
        assert_eq!(1, target.drain_refused().len());
        assert_eq!(ShutdownState::Running, target.state());
    }

    #[test]
    fn update_drains_queued_request_and_accepts_it() {
        use crate::context::Context;

        let ctx = Context::new();
        let mut endpoint = Endpoint::new(ctx);

        let mut target = ShutdownTarget::new(ShutdownPolicy { verify: false, max_age: Duration::from_secs(60), delay: Duration::from_secs(0) });
        target.attach(&mut endpoint);

        let message = Message::new(shutdown_id(), EndpointId(9), EndpointId(1), now_millis().to_be_bytes().to_vec());
        target.received.borrow_mut().push_back(message);

        assert!(target.update(&mut endpoint));
        assert_eq!(1, target.drain_accepted().len());
        assert!(target.received.borrow().is_empty());
    }
}
