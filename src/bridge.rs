// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Bridge: a point-to-point forwarder joining two routers.
//!
//! The outer side is just another [`Connection`], so the MQTT gateway
//! specialization is a thin constructor (`Bridge::mqtt`) rather than a
//! separate type — plugging in [`crate::transport::mqtt::MqttConnection`]
//! as the outer connection reuses the exact same forwarding logic.

use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::debug;

use crate::config::{keys, Config};
use crate::connection::Connection;
use crate::context::Context;
use crate::identifier::{EndpointId, GlobalIdSequence, Identifier, MessageId};
use crate::message::Message;
use crate::services::shutdown::{self, ShutdownPolicy, ShutdownState, ShutdownTarget};
use crate::setup::Setup;

#[derive(Default, Clone, Copy, Debug)]
pub struct BridgeStats {
    pub c2o_forwarded: u64,
    pub c2o_dropped: u64,
    pub i2c_forwarded: u64,
    pub i2c_dropped: u64,
    c2o_age_sum: u64,
    c2o_age_count: u64,
    i2c_age_sum: u64,
    i2c_age_count: u64,
}

impl BridgeStats {
    pub fn c2o_mean_age_ms(&self) -> f64 {
        mean(self.c2o_age_sum, self.c2o_age_count)
    }

    pub fn i2c_mean_age_ms(&self) -> f64 {
        mean(self.i2c_age_sum, self.i2c_age_count)
    }
}

fn mean(sum: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    }
}

/// Direction of travel through the bridge: child-to-outer (toward the far
/// router) or inner-to-child (toward the home router's children).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Direction {
    C2o,
    I2c,
}

/// Joins an inner connection (toward the home router) and an outer
/// connection (toward the far router or broker), translating ids across
/// disjoint id blocks and forwarding everything except control messages
/// addressed to the bridge itself.
pub struct Bridge {
    own_id: EndpointId,
    context: Rc<Context>,
    inner: Box<dyn Connection>,
    outer: Box<dyn Connection>,
    inner_to_outer: HashMap<EndpointId, EndpointId>,
    outer_to_inner: HashMap<EndpointId, EndpointId>,
    next_translated: u64,
    stats: BridgeStats,
    last_tick: Instant,
    shutdown: ShutdownTarget,
    keep_running: bool,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge").field("own_id", &self.own_id).field("stats", &self.stats).finish()
    }
}

impl Bridge {
    pub fn new(context: Rc<Context>, id_sequence: &GlobalIdSequence, inner: Box<dyn Connection>, outer: Box<dyn Connection>) -> Self {
        let own_id = EndpointId(id_sequence.reserve_block(1));
        Bridge {
            own_id,
            context,
            inner,
            outer,
            inner_to_outer: HashMap::new(),
            outer_to_inner: HashMap::new(),
            next_translated: 1,
            stats: BridgeStats::default(),
            last_tick: Instant::now(),
            shutdown: ShutdownTarget::new(ShutdownPolicy::default()),
            keep_running: false,
        }
    }

    /// Builds a bridge whose outer side is an MQTT gateway connection.
    pub fn mqtt(context: Rc<Context>, id_sequence: &GlobalIdSequence, inner: Box<dyn Connection>, mqtt_outer: crate::transport::mqtt::MqttConnection) -> Self {
        Bridge::new(context, id_sequence, inner, Box::new(mqtt_outer))
    }

    /// Builds a bridge from `msgbus.bridge.*` config: shutdown policy
    /// (`shutdown.{verify,max_age,delay}`, `keep_running`), an own
    /// certificate loaded from `msgbus.bridge.cert_path` if set, and an
    /// outer connection dialed from `msgbus.bridge.address` through
    /// `setup` unless `msgbus.direct` is false (in which case the caller
    /// is expected to have built an MQTT outer connection via
    /// [`Bridge::mqtt`] instead, and this constructor is not the right
    /// one to call).
    pub fn from_config(context: Rc<Context>, id_sequence: &GlobalIdSequence, inner: Box<dyn Connection>, config: &Config, setup: &Setup) -> io::Result<Self> {
        if !config.get_bool(keys::DIRECT, true) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "msgbus.direct is disabled, build the outer connection with Bridge::mqtt instead"));
        }
        let address = config.get_str(keys::BRIDGE_ADDRESS).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "msgbus.bridge.address not set"))?;
        let mut connector = setup.setup_connector(address).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let outer = connector.connect()?;
        let mut bridge = Bridge::new(context, id_sequence, inner, outer);
        if let Some(path) = config.get_str(keys::BRIDGE_CERT_PATH) {
            if let Err(e) = bridge.context.load_own_certificate(bridge.own_id, path) {
                debug!("bridge {:?} failed to load certificate from '{path}': {e}", bridge.own_id);
            }
        }
        bridge.shutdown = ShutdownTarget::new(ShutdownPolicy {
            verify: config.get_bool(keys::BRIDGE_SHUTDOWN_VERIFY, false),
            max_age: config.get_duration_ms(keys::BRIDGE_SHUTDOWN_MAX_AGE, Duration::from_secs(2)),
            delay: config.get_duration_ms(keys::BRIDGE_SHUTDOWN_DELAY, Duration::ZERO),
        });
        bridge.keep_running = config.get_bool(keys::BRIDGE_KEEP_RUNNING, false);
        Ok(bridge)
    }

    /// Whether a policy-accepted `shutdown` request's delay has elapsed.
    pub fn wants_shutdown(&self) -> bool {
        matches!(self.shutdown.state(), ShutdownState::ShuttingDown)
    }

    pub fn own_id(&self) -> EndpointId {
        self.own_id
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    fn translate(&mut self, id: EndpointId, from: Direction) -> EndpointId {
        if id.is_broadcast() {
            return id;
        }
        let (forward, backward) = match from {
            Direction::C2o => (&mut self.inner_to_outer, &mut self.outer_to_inner),
            Direction::I2c => (&mut self.outer_to_inner, &mut self.inner_to_outer),
        };
        if let Some(existing) = forward.get(&id) {
            return *existing;
        }
        let translated = EndpointId(0xFFFF_0000_0000_0000 | self.next_translated);
        self.next_translated += 1;
        forward.insert(id, translated);
        backward.insert(translated, id);
        translated
    }

    pub fn update(&mut self) -> bool {
        let mut work = false;
        work |= self.inner.update();
        work |= self.outer.update();

        let elapsed = self.last_tick.elapsed();
        self.last_tick = Instant::now();

        let mut from_inner = Vec::new();
        self.inner.fetch(&mut |m| {
            from_inner.push(m);
            true
        });
        for message in from_inner {
            work = true;
            self.forward(message, Direction::C2o, elapsed);
        }

        let mut from_outer = Vec::new();
        self.outer.fetch(&mut |m| {
            from_outer.push(m);
            true
        });
        for message in from_outer {
            work = true;
            self.forward(message, Direction::I2c, elapsed);
        }

        work |= self.shutdown.poll();

        work
    }

    fn forward(&mut self, mut message: Message, direction: Direction, elapsed: Duration) {
        if message.is_special() && message.target_id == self.own_id && message.id.method == Identifier::new("ping") {
            let pong = Message::new(MessageId::control("pong"), self.own_id, message.source_id, Vec::new());
            let out = match direction {
                Direction::C2o => &mut self.inner,
                Direction::I2c => &mut self.outer,
            };
            out.send(pong);
            return;
        }
        if message.is_special() && message.id.method.to_name().starts_with("byeByeBrdg") {
            debug!("bridge {:?} received byeByeBrdg, not forwarding further", self.own_id);
            return;
        }
        if message.is_special() && message.target_id == self.own_id && message.id.method == Identifier::new("shutdown") {
            let verified = shutdown::verification_ok(message.verification);
            if let Some(request) = shutdown::decode_request(&message.content, message.source_id, shutdown::now_millis(), verified) {
                self.shutdown.handle_request(self.keep_running, request);
            }
            return;
        }

        if !message.forward_hop(elapsed) {
            self.count_dropped(direction);
            return;
        }

        message.source_id = self.translate(message.source_id, direction);
        if !message.target_id.is_broadcast() {
            message.target_id = self.translate(message.target_id, direction);
        }

        let (out, forwarded, age_sum, age_count) = match direction {
            Direction::C2o => (&mut self.outer, &mut self.stats.c2o_forwarded, &mut self.stats.c2o_age_sum, &mut self.stats.c2o_age_count),
            Direction::I2c => (&mut self.inner, &mut self.stats.i2c_forwarded, &mut self.stats.i2c_age_sum, &mut self.stats.i2c_age_count),
        };
        *age_sum += message.age_ms;
        *age_count += 1;
        if out.send(message) {
            *forwarded += 1;
        } else {
            self.count_dropped(direction);
        }
    }

    fn count_dropped(&mut self, direction: Direction) {
        match direction {
            Direction::C2o => self.stats.c2o_dropped += 1,
            Direction::I2c => self.stats.i2c_dropped += 1,
        }
    }
}
