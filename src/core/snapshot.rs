//! Read-only projection of a window, serialized as the ingestion payload.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::PAYLOAD_VERSION;
use crate::core::window::{ClientCounters, DirectionCounters, Window};

/// Host-level metadata attached to every snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub host: Option<String>,
    pub iface: Option<String>,
    pub server_ip: Option<String>,
}

/// Bytes for one protocol label of one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSnapshot {
    #[serde(rename = "in")]
    pub inbound: u64,
    #[serde(rename = "out")]
    pub outbound: u64,
}

impl From<DirectionCounters> for ProtocolSnapshot {
    fn from(c: DirectionCounters) -> Self {
        Self {
            inbound: c.inbound,
            outbound: c.outbound,
        }
    }
}

/// One client's traffic within the window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub protocols: BTreeMap<String, ProtocolSnapshot>,
}

impl From<&ClientCounters> for ClientSnapshot {
    fn from(c: &ClientCounters) -> Self {
        Self {
            in_bytes: c.totals.inbound,
            out_bytes: c.totals.outbound,
            protocols: c
                .protocols
                .iter()
                .map(|(label, counters)| (label.clone(), ProtocolSnapshot::from(*counters)))
                .collect(),
        }
    }
}

/// Immutable, serializable view of a window.
///
/// `total_in`/`total_out` sum the clients that made it into the snapshot;
/// `pkt_count`/`byte_count` describe the whole window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    pub window_start: f64,
    pub window_end: f64,
    pub emitted_at: f64,
    pub host: Option<String>,
    pub iface: Option<String>,
    pub server_ip: Option<String>,
    pub n_clients: usize,
    pub total_in: u64,
    pub total_out: u64,
    pub pkt_count: u64,
    pub byte_count: u64,
    pub clients: BTreeMap<String, ClientSnapshot>,
}

impl Snapshot {
    /// Format `window`, keeping at most `top_k` clients (`0` = all).
    pub fn from_window(
        window: &Window,
        top_k: usize,
        meta: &SnapshotMeta,
        emitted_at: f64,
    ) -> Self {
        let clients: BTreeMap<String, ClientSnapshot> = select_top_clients(window, top_k)
            .into_iter()
            .map(|(id, counters)| (id.to_string(), ClientSnapshot::from(counters)))
            .collect();

        let total_in = clients.values().map(|c| c.in_bytes).sum();
        let total_out = clients.values().map(|c| c.out_bytes).sum();

        Self {
            version: PAYLOAD_VERSION.to_string(),
            window_start: window.start,
            window_end: window.end,
            emitted_at,
            host: meta.host.clone(),
            iface: meta.iface.clone(),
            server_ip: meta.server_ip.clone(),
            n_clients: clients.len(),
            total_in,
            total_out,
            pkt_count: window.pkt_count,
            byte_count: window.byte_count,
            clients,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n_clients == 0
    }
}

/// Rank clients by total traffic and keep the first `limit`.
///
/// Ties are broken by client id so the selection is stable across calls.
fn select_top_clients(window: &Window, limit: usize) -> Vec<(&str, &ClientCounters)> {
    let mut ranked: Vec<(&str, &ClientCounters)> = window
        .clients
        .iter()
        .map(|(id, counters)| (id.as_str(), counters))
        .collect();

    if limit == 0 || ranked.len() <= limit {
        return ranked;
    }

    ranked.sort_by(|(a_id, a), (b_id, b)| match b.totals.total().cmp(&a.totals.total()) {
        Ordering::Equal => a_id.cmp(b_id),
        other => other,
    });
    ranked.truncate(limit);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::window::Direction;

    fn window_with(clients: &[(&str, u64)]) -> Window {
        let mut w = Window::new(0.0, 5.0);
        for (id, bytes) in clients {
            w.add((*id).to_string(), Direction::In, *bytes, "HTTP");
        }
        w
    }

    #[test]
    fn test_top_k_keeps_largest_clients() {
        let w = window_with(&[("A", 1000), ("B", 500), ("C", 100)]);
        let snap = Snapshot::from_window(&w, 2, &SnapshotMeta::default(), 1.0);

        let ids: Vec<&String> = snap.clients.keys().collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(snap.clients["A"].in_bytes, 1000);
        assert_eq!(snap.clients["B"].in_bytes, 500);
        assert_eq!(snap.n_clients, 2);
        assert_eq!(snap.total_in, 1500);
        // Window-level counters still describe all traffic.
        assert_eq!(snap.byte_count, 1600);
        assert_eq!(snap.pkt_count, 3);
    }

    #[test]
    fn test_top_k_ties_are_broken_by_client_id() {
        let w = window_with(&[("z", 10), ("b", 10), ("m", 10)]);
        for _ in 0..5 {
            let snap = Snapshot::from_window(&w, 2, &SnapshotMeta::default(), 1.0);
            let ids: Vec<&String> = snap.clients.keys().collect();
            assert_eq!(ids, vec!["b", "m"]);
        }
    }

    #[test]
    fn test_zero_limit_keeps_everyone() {
        let w = window_with(&[("A", 1), ("B", 2), ("C", 3)]);
        let snap = Snapshot::from_window(&w, 0, &SnapshotMeta::default(), 1.0);
        assert_eq!(snap.n_clients, 3);
    }

    #[test]
    fn test_limit_above_client_count_keeps_everyone() {
        let w = window_with(&[("A", 1), ("B", 2)]);
        let snap = Snapshot::from_window(&w, 5, &SnapshotMeta::default(), 1.0);
        assert_eq!(snap.n_clients, 2);
    }

    #[test]
    fn test_serialized_payload_shape() {
        let mut w = Window::new(100.0, 5.0);
        w.add("10.0.0.2".into(), Direction::In, 1500, "HTTP");
        w.add("10.0.0.2".into(), Direction::Out, 700, "HTTP");
        let meta = SnapshotMeta {
            host: Some("probe".into()),
            iface: Some("eth0".into()),
            server_ip: None,
        };
        let snap = Snapshot::from_window(&w, 0, &meta, 103.5);
        let json = serde_json::to_value(&snap).unwrap();

        assert_eq!(json["version"], PAYLOAD_VERSION);
        assert_eq!(json["window_start"], 100.0);
        assert_eq!(json["window_end"], 105.0);
        assert_eq!(json["emitted_at"], 103.5);
        assert_eq!(json["host"], "probe");
        assert_eq!(json["iface"], "eth0");
        assert!(json["server_ip"].is_null());
        assert_eq!(json["n_clients"], 1);
        assert_eq!(json["total_in"], 1500);
        assert_eq!(json["total_out"], 700);
        assert_eq!(json["pkt_count"], 2);
        assert_eq!(json["byte_count"], 2200);
        assert_eq!(json["clients"]["10.0.0.2"]["in_bytes"], 1500);
        assert_eq!(json["clients"]["10.0.0.2"]["out_bytes"], 700);
        assert_eq!(json["clients"]["10.0.0.2"]["protocols"]["HTTP"]["in"], 1500);
        assert_eq!(json["clients"]["10.0.0.2"]["protocols"]["HTTP"]["out"], 700);
    }
}
