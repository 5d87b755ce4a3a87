//! Time-aligned accumulation window and its per-client counters.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Whether bytes flowed toward or away from the monitored host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// Inbound/outbound byte pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionCounters {
    pub inbound: u64,
    pub outbound: u64,
}

impl DirectionCounters {
    pub fn add(&mut self, direction: Direction, bytes: u64) {
        match direction {
            Direction::In => self.inbound = self.inbound.saturating_add(bytes),
            Direction::Out => self.outbound = self.outbound.saturating_add(bytes),
        }
    }

    pub fn total(&self) -> u64 {
        self.inbound.saturating_add(self.outbound)
    }
}

/// Running byte counters for a single client within one window.
///
/// `totals` always equals the sum of every entry in `protocols`.
#[derive(Debug, Clone, Default)]
pub struct ClientCounters {
    pub totals: DirectionCounters,
    pub protocols: HashMap<String, DirectionCounters>,
}

impl ClientCounters {
    fn add(&mut self, direction: Direction, bytes: u64, protocol: &str) {
        self.totals.add(direction, bytes);
        // Explicit lookup first: the label is only cloned for a new entry.
        match self.protocols.get_mut(protocol) {
            Some(counters) => counters.add(direction, bytes),
            None => {
                let mut counters = DirectionCounters::default();
                counters.add(direction, bytes);
                self.protocols.insert(protocol.to_string(), counters);
            }
        }
    }
}

/// One fixed-width bucket `[start, end)` in epoch seconds.
#[derive(Debug, Clone)]
pub struct Window {
    pub start: f64,
    pub end: f64,
    pub clients: HashMap<String, ClientCounters>,
    pub pkt_count: u64,
    pub byte_count: u64,
}

impl Window {
    /// Fresh, empty window beginning at `start`.
    pub fn new(start: f64, width: f64) -> Self {
        Self {
            start,
            end: start + width,
            clients: HashMap::new(),
            pkt_count: 0,
            byte_count: 0,
        }
    }

    /// Window that contains `now`, aligned to a multiple of `width` since the epoch.
    pub fn aligned(now: f64, width: f64) -> Self {
        Self::new(align_down(now, width), width)
    }

    /// The empty window that directly follows this one.
    pub fn successor(&self) -> Self {
        Self::new(self.end, self.end - self.start)
    }

    /// Add one observed packet.
    pub fn add(&mut self, client: String, direction: Direction, bytes: u64, protocol: &str) {
        self.clients
            .entry(client)
            .or_default()
            .add(direction, bytes, protocol);
        self.pkt_count += 1;
        self.byte_count = self.byte_count.saturating_add(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.pkt_count == 0
    }
}

/// Largest multiple of `width` that is `<= t`.
pub fn align_down(t: f64, width: f64) -> f64 {
    t - t.rem_euclid(width)
}
