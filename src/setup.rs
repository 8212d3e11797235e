// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Connection factory registry, keyed by address scheme.
//!
//! Addresses are plain strings such as `tcp://127.0.0.1:34912` or
//! `mqueue:///relaybus-workers`; setup does not interpret anything past
//! the scheme, it only dispatches to the factory registered for it.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use crate::config::{keys, Config};
use crate::connection::{Acceptor, Connector};
use crate::error::{BusError, BusResult};
use crate::transport::tcp::{TcpAcceptor, TcpConnector};
use crate::transport::udp::{UdpAcceptor, UdpConnector};

#[cfg(unix)]
use crate::transport::mqueue::{MqueueAcceptor, MqueueConnector};

/// Builds an acceptor or connector for addresses under one scheme.
pub trait ConnectionFactory {
    fn build_acceptor(&self, address: &str) -> io::Result<Box<dyn Acceptor>>;
    fn build_connector(&self, address: &str) -> io::Result<Box<dyn Connector>>;
}

struct TcpFactory;

impl ConnectionFactory for TcpFactory {
    fn build_acceptor(&self, address: &str) -> io::Result<Box<dyn Acceptor>> {
        let addr: SocketAddr = address.parse().map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad tcp address"))?;
        Ok(Box::new(TcpAcceptor::bind(addr)?))
    }

    fn build_connector(&self, address: &str) -> io::Result<Box<dyn Connector>> {
        let addr: SocketAddr = address.parse().map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad tcp address"))?;
        Ok(Box::new(TcpConnector::new(addr)))
    }
}

struct UdpFactory;

impl ConnectionFactory for UdpFactory {
    fn build_acceptor(&self, address: &str) -> io::Result<Box<dyn Acceptor>> {
        let addr: SocketAddr = address.parse().map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad udp address"))?;
        Ok(Box::new(UdpAcceptor::bind(addr)?))
    }

    fn build_connector(&self, address: &str) -> io::Result<Box<dyn Connector>> {
        let addr: SocketAddr = address.parse().map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad udp address"))?;
        Ok(Box::new(UdpConnector::new(addr)))
    }
}

#[cfg(unix)]
struct MqueueFactory;

#[cfg(unix)]
impl ConnectionFactory for MqueueFactory {
    fn build_acceptor(&self, address: &str) -> io::Result<Box<dyn Acceptor>> {
        Ok(Box::new(MqueueAcceptor::open(address)?))
    }

    fn build_connector(&self, address: &str) -> io::Result<Box<dyn Connector>> {
        Ok(Box::new(MqueueConnector::new(address)))
    }
}

/// Registry of connection factories indexed by address scheme (`"tcp"`,
/// `"udp"`, `"mqueue"` on unix), built from the
/// `msgbus.{asio_tcp_ipv4,asio_udp_ipv4,posix_mqueue}` config flags.
/// MQTT and in-process transports need extra context (broker credentials, a
/// peer handle) a plain address string can't carry, so they are constructed
/// directly by callers instead of through this registry.
pub struct Setup {
    factories: HashMap<String, Box<dyn ConnectionFactory>>,
}

impl Setup {
    pub fn new() -> Self {
        Setup { factories: HashMap::new() }
    }

    /// Registers the built-in factories enabled by `config`.
    pub fn from_config(config: &Config) -> Self {
        let mut setup = Setup::new();
        if config.get_bool(keys::ASIO_TCP_IPV4, true) {
            setup.register("tcp", Box::new(TcpFactory));
        }
        if config.get_bool(keys::ASIO_UDP_IPV4, false) {
            setup.register("udp", Box::new(UdpFactory));
        }
        #[cfg(unix)]
        if config.get_bool(keys::POSIX_MQUEUE, false) {
            setup.register("mqueue", Box::new(MqueueFactory));
        }
        setup
    }

    pub fn register(&mut self, scheme: &str, factory: Box<dyn ConnectionFactory>) {
        self.factories.insert(scheme.to_string(), factory);
    }

    fn split_scheme(address: &str) -> BusResult<(&str, &str)> {
        address
            .split_once("://")
            .ok_or_else(|| BusError::Config(format!("address '{address}' has no scheme")))
    }

    pub fn setup_acceptor(&self, address: &str) -> BusResult<Box<dyn Acceptor>> {
        let (scheme, rest) = Self::split_scheme(address)?;
        let factory = self.factories.get(scheme).ok_or_else(|| BusError::Config(format!("no connection factory for scheme '{scheme}'")))?;
        factory.build_acceptor(rest).map_err(BusError::Transport)
    }

    pub fn setup_connector(&self, address: &str) -> BusResult<Box<dyn Connector>> {
        let (scheme, rest) = Self::split_scheme(address)?;
        let factory = self.factories.get(scheme).ok_or_else(|| BusError::Config(format!("no connection factory for scheme '{scheme}'")))?;
        factory.build_connector(rest).map_err(BusError::Transport)
    }
}

impl Default for Setup {
    fn default() -> Self {
        Setup::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_scheme_is_a_config_error() {
        let setup = Setup::new();
        let err = setup.setup_acceptor("quic://127.0.0.1:1").unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[test]
    fn malformed_address_is_a_config_error() {
        let setup = Setup::new();
        let err = setup.setup_acceptor("not-an-address").unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[test]
    fn tcp_factory_registers_when_enabled() {
        let mut config = Config::new();
        config.set(keys::ASIO_TCP_IPV4, true);
        let setup = Setup::from_config(&config);
        // binding to port 0 lets the OS pick a free one, keeping this hermetic
        let acceptor = setup.setup_acceptor("tcp://127.0.0.1:0");
        assert!(acceptor.is_ok());
    }

    #[test]
    fn udp_factory_is_opt_in() {
        let config = Config::new();
        let setup = Setup::from_config(&config);
        let err = setup.setup_acceptor("udp://127.0.0.1:0").unwrap_err();
        assert!(matches!(err, BusError::Config(_)));

        let mut config = Config::new();
        config.set(keys::ASIO_UDP_IPV4, true);
        let setup = Setup::from_config(&config);
        assert!(setup.setup_acceptor("udp://127.0.0.1:0").is_ok());
    }
}
