// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Ambient `msgbus.*` configuration store.
//!
//! A process constructs one [`Config`], populates it from whatever source
//! it likes (environment variables, a file, CLI flags — parsing those is
//! outside this crate), and passes references to it into [`crate::router::Router`],
//! [`crate::bridge::Bridge`] and [`crate::setup::Setup`].

use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
}

impl ConfigValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            ConfigValue::List(l) => Some(l.as_slice()),
            _ => None,
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Str(v.to_string())
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(v: Vec<String>) -> Self {
        ConfigValue::List(v)
    }
}

/// Flat key-value configuration store, keyed by dotted `msgbus.*` names.
#[derive(Clone, Debug, Default)]
pub struct Config {
    values: HashMap<String, ConfigValue>,
}

impl Config {
    pub fn new() -> Self {
        Config { values: HashMap::new() }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(ConfigValue::as_bool).unwrap_or(default)
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(ConfigValue::as_int).unwrap_or(default)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ConfigValue::as_str)
    }

    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key).and_then(ConfigValue::as_list).map(|l| l.to_vec()).unwrap_or_default()
    }

    pub fn get_duration_ms(&self, key: &str, default: Duration) -> Duration {
        match self.get(key).and_then(ConfigValue::as_int) {
            Some(ms) if ms >= 0 => Duration::from_millis(ms as u64),
            _ => default,
        }
    }
}

/// Named `msgbus.*` config keys used by the core, kept as constants so a
/// typo in a key string is caught at the call site, not at runtime.
pub mod keys {
    pub const ROUTER_ADDRESS: &str = "msgbus.router.address";
    pub const ROUTER_SHUTDOWN_DELAY: &str = "msgbus.router.shutdown.delay";
    pub const ROUTER_SHUTDOWN_MAX_AGE: &str = "msgbus.router.shutdown.max_age";
    pub const ROUTER_SHUTDOWN_VERIFY: &str = "msgbus.router.shutdown.verify";
    pub const ROUTER_KEEP_RUNNING: &str = "msgbus.router.keep_running";
    pub const BRIDGE_ADDRESS: &str = "msgbus.bridge.address";
    pub const BRIDGE_SHUTDOWN_DELAY: &str = "msgbus.bridge.shutdown.delay";
    pub const BRIDGE_SHUTDOWN_MAX_AGE: &str = "msgbus.bridge.shutdown.max_age";
    pub const BRIDGE_SHUTDOWN_VERIFY: &str = "msgbus.bridge.shutdown.verify";
    pub const BRIDGE_KEEP_RUNNING: &str = "msgbus.bridge.keep_running";
    pub const ASIO_TCP_IPV4: &str = "msgbus.asio_tcp_ipv4";
    pub const ASIO_UDP_IPV4: &str = "msgbus.asio_udp_ipv4";
    pub const POSIX_MQUEUE: &str = "msgbus.posix_mqueue";
    pub const DIRECT: &str = "msgbus.direct";
    pub const RESOURCE_GET_BLOB_TIMEOUT: &str = "msgbus.resource_get.blob_timeout";
    pub const ROUTER_CERT_PATH: &str = "msgbus.router.cert_path";
    pub const BRIDGE_CERT_PATH: &str = "msgbus.bridge.cert_path";
    pub const ENDPOINT_CERT_PATH: &str = "msgbus.endpoint.cert_path";
}
