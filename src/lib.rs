// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! A typed message bus for in-process, inter-process, and inter-host
//! communication between cooperating endpoints.
//!
//! Endpoints exchange typed messages, subscribe to message kinds, query and
//! ping each other, request shutdown, and transfer large binary objects in
//! fragments. Topology is formed by connecting endpoints through routers
//! (local switches) and bridges (long-haul links between routers, including
//! an MQTT gateway). On top of this substrate, [`services`] provides
//! discovery, topology reporting, statistics, node tracking, resource
//! streaming and RPC-style invocation.
//!
//! The core pieces, bottom-up: [`message`] (wire record and codec),
//! [`identifier`] (compact addressing types), [`connection`] (the
//! transport-agnostic contract), [`subscriber`] (dispatch by message id),
//! [`endpoint`] (a bus node), [`blob`] (BLOB fragmentation/reassembly),
//! [`router`] (the local switch) and [`bridge`] (router-to-router
//! forwarding).

pub mod blob;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod identifier;
pub mod message;
pub mod registry;
pub mod router;
pub mod services;
pub mod setup;
pub mod subscriber;
pub mod transport;

mod global;

/// Re-exports of the types most callers reach for first.
pub mod prelude {
    pub use crate::blob::{BlobManipulator, BufferSink, SourceIo, TargetIo};
    pub use crate::bridge::Bridge;
    pub use crate::config::{keys, Config};
    pub use crate::connection::{Acceptor, Connection, Connector};
    pub use crate::context::Context;
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{BusError, BusResult};
    pub use crate::identifier::{EndpointId, GlobalIdSequence, Identifier, MessageId};
    pub use crate::message::{Message, Priority, VerificationBits};
    pub use crate::registry::Registry;
    pub use crate::router::Router;
    pub use crate::setup::Setup;
    pub use crate::subscriber::{Handler, HandlerContext, Subscriber};
}
