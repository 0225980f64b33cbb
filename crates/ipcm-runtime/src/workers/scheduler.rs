//! # Per-Key Lanes
//!
//! Buffered events waiting for a worker, one FIFO lane per ordering key.
//!
//! ```text
//! lanes:  Process(1) [e1 e4 e7]  busy      ← a worker runs e0; e1 waits
//!         Process(2) [e2]        idle  ─┐
//!         Port(9)    [e3 e5]     idle  ─┼─→ ready: [Process(2), Port(9)]
//! ```
//!
//! A key is in `ready` exactly when its lane is non-empty and not busy, so a
//! worker taking from `ready` never runs two events of one key at once and
//! always takes a lane's oldest event first.
//!
//! ## Port Aliases
//!
//! The router keys a port event by its process when it knows one, else by the
//! port. A deallocation that names only the port can therefore be keyed
//! differently from the allocation still buffered for it. The scheduler pins
//! each port to the lane its first in-flight event went to; later events
//! naming the port join that lane until no event for the port is buffered or
//! running.
//!
//! ```text
//! push alloc(ipcp 1, port 42)  → Process(1)   ports: {42 → Process(1), refs 1}
//! push dealloc(port 42)        → Process(1)   ports: {42 → Process(1), refs 2}
//! ```

use std::collections::{HashMap, VecDeque};

use ipcm_types::{Event, OrderingKey, PortId};

use crate::router::Routed;

/// One event ready to run, with its routing decision.
pub struct Dispatch {
    /// Arrival sequence number, assigned when buffered.
    pub seq: u64,
    pub event: Event,
    pub routed: Routed,
}

#[derive(Default)]
struct Lane {
    queue: VecDeque<Dispatch>,
    busy: bool,
    /// Port of the running event, released on finish.
    running_port: Option<PortId>,
}

/// Lane a port is pinned to, and how many buffered or running events name it.
struct PortAlias {
    key: OrderingKey,
    refs: usize,
}

/// Lane table plus the queue of lanes a worker may start.
#[derive(Default)]
pub struct Scheduler {
    lanes: HashMap<OrderingKey, Lane>,
    ready: VecDeque<OrderingKey>,
    ports: HashMap<PortId, PortAlias>,
    buffered: usize,
    /// Buffered events queued behind a running event of the same key.
    blocked: usize,
    next_seq: u64,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer an event at the tail of its key's lane.
    ///
    /// An event naming a port with events still in flight joins that port's
    /// lane instead of the key it was routed to.
    pub fn push(&mut self, event: Event, mut routed: Routed) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(port) = event.port_id() {
            let alias = self.ports.entry(port).or_insert_with(|| PortAlias {
                key: routed.key.clone(),
                refs: 0,
            });
            alias.refs += 1;
            routed.key = alias.key.clone();
        }

        let key = routed.key.clone();
        let lane = self.lanes.entry(key.clone()).or_default();
        let was_idle = lane.queue.is_empty() && !lane.busy;
        if lane.busy {
            self.blocked += 1;
        }
        lane.queue.push_back(Dispatch { seq, event, routed });
        if was_idle {
            self.ready.push_back(key);
        }
        self.buffered += 1;
        seq
    }

    /// Take the oldest event of the next ready lane and mark the lane busy.
    pub fn take_ready(&mut self) -> Option<Dispatch> {
        while let Some(key) = self.ready.pop_front() {
            let Some(lane) = self.lanes.get_mut(&key) else {
                continue;
            };
            if let Some(dispatch) = lane.queue.pop_front() {
                lane.busy = true;
                lane.running_port = dispatch.event.port_id();
                self.blocked += lane.queue.len();
                self.buffered -= 1;
                return Some(dispatch);
            }
        }
        None
    }

    /// Release `key` after its event ran; requeue the lane if more are waiting.
    pub fn finish(&mut self, key: &OrderingKey) {
        let Some(lane) = self.lanes.get_mut(key) else {
            return;
        };
        lane.busy = false;
        self.blocked -= lane.queue.len();
        let port = lane.running_port.take();
        if lane.queue.is_empty() {
            self.lanes.remove(key);
        } else {
            self.ready.push_back(key.clone());
        }
        if let Some(port) = port {
            self.release_port(port);
        }
    }

    fn release_port(&mut self, port: PortId) {
        if let Some(alias) = self.ports.get_mut(&port) {
            alias.refs -= 1;
            if alias.refs == 0 {
                self.ports.remove(&port);
            }
        }
    }

    /// Events buffered but not yet started.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Buffered events a worker could start now, i.e. not queued behind a
    /// running event of their own key.
    #[must_use]
    pub fn runnable(&self) -> usize {
        self.buffered - self.blocked
    }

    #[cfg(test)]
    fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    #[cfg(test)]
    fn active_lanes(&self) -> usize {
        self.lanes.len()
    }

    #[cfg(test)]
    fn is_busy(&self, key: &OrderingKey) -> bool {
        self.lanes.get(key).map_or(false, |lane| lane.busy)
    }
}
