// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Colocates many endpoints with one router on a single thread, driving
//! their `update()` calls in turn.

use crate::endpoint::Endpoint;
use crate::router::Router;

pub struct Registry {
    router: Router,
    endpoints: Vec<Endpoint>,
}

impl Registry {
    pub fn new(router: Router) -> Self {
        Registry { router, endpoints: Vec::new() }
    }

    pub fn add_endpoint(&mut self, endpoint: Endpoint) -> usize {
        self.endpoints.push(endpoint);
        self.endpoints.len() - 1
    }

    pub fn endpoint(&self, index: usize) -> &Endpoint {
        &self.endpoints[index]
    }

    pub fn endpoint_mut(&mut self, index: usize) -> &mut Endpoint {
        &mut self.endpoints[index]
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    /// Advances the router, then every endpoint's I/O, then dispatches
    /// every endpoint's buffered incoming messages. Returns whether any
    /// component did work.
    pub fn update(&mut self) -> bool {
        let mut work = self.router.update();
        for endpoint in self.endpoints.iter_mut() {
            work |= endpoint.update();
            work |= endpoint.process_all() > 0;
        }
        work
    }

    /// Runs `update` until neither the router nor any endpoint has done
    /// work for `idle_rounds` consecutive calls, or `max_rounds` is hit
    /// (a safety valve for tests that don't want to hang forever).
    pub fn run_until_idle(&mut self, idle_rounds: usize, max_rounds: usize) {
        let mut idle = 0;
        for _ in 0..max_rounds {
            if self.update() {
                idle = 0;
            } else {
                idle += 1;
                if idle >= idle_rounds {
                    break;
                }
            }
        }
    }
}
