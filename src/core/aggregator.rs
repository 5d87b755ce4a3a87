//! Windowed per-client traffic accounting.
//!
//! A single mutex guards the current [`Window`]. Capture workers call
//! [`Aggregator::record`]; the orchestrator drains with
//! [`Aggregator::take_snapshot_and_advance`] once per window width, which
//! hands every recorded byte to exactly one snapshot.

use std::sync::{Mutex, MutexGuard};

use crate::core::anonymizer::Anonymizer;
use crate::core::snapshot::{Snapshot, SnapshotMeta};
use crate::core::window::{Direction, Window};

/// Thread-safe window aggregator. Share it behind an `Arc`.
pub struct Aggregator {
    width: f64,
    top_k: usize,
    anonymizer: Option<Anonymizer>,
    current: Mutex<Window>,
}

impl Aggregator {
    /// Create an aggregator whose first window contains the current time.
    ///
    /// `top_k == 0` keeps every client in snapshots.
    pub fn new(width_secs: u64, top_k: usize, anonymizer: Option<Anonymizer>) -> Self {
        Self::starting_at(crate::config::unix_now(), width_secs, top_k, anonymizer)
    }

    /// Create an aggregator whose first window contains `now`.
    pub fn starting_at(
        now: f64,
        width_secs: u64,
        top_k: usize,
        anonymizer: Option<Anonymizer>,
    ) -> Self {
        let width = width_secs.max(1) as f64;
        Self {
            width,
            top_k,
            anonymizer,
            current: Mutex::new(Window::aligned(now, width)),
        }
    }

    pub fn width_secs(&self) -> f64 {
        self.width
    }

    /// End boundary of the window that is current right now.
    pub fn current_window_end(&self) -> f64 {
        self.lock().end
    }

    /// Count one packet.
    ///
    /// Rolls the window forward first when `timestamp` is at or past its end.
    /// A timestamp that belongs to an already superseded window lands in the
    /// current one; windows never move backwards.
    pub fn record(
        &self,
        timestamp: f64,
        client_id: &str,
        direction: Direction,
        byte_length: u64,
        protocol: &str,
    ) {
        let client = match &self.anonymizer {
            Some(anon) => anon.anonymize(client_id),
            None => client_id.to_string(),
        };

        let mut window = self.lock();
        roll_forward(&mut window, timestamp, self.width);
        window.add(client, direction, byte_length, protocol);
    }

    /// Format the current window without advancing it.
    pub fn peek_snapshot(&self, meta: &SnapshotMeta) -> Snapshot {
        let window = self.lock();
        Snapshot::from_window(&window, self.top_k, meta, crate::config::unix_now())
    }

    /// Format the current window and replace it with the next one, atomically.
    pub fn take_snapshot_and_advance(&self, meta: &SnapshotMeta) -> Snapshot {
        let mut window = self.lock();
        let snapshot = Snapshot::from_window(&window, self.top_k, meta, crate::config::unix_now());
        *window = window.successor();
        snapshot
    }

    /// Move an empty window that has already ended to the window containing
    /// `now`. A window holding traffic is left for the next drain.
    pub fn skip_idle_windows(&self, now: f64) {
        let mut window = self.lock();
        if window.is_empty() {
            roll_forward(&mut window, now, self.width);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        // A poisoned lock means a writer panicked mid-update; counters are no longer trustworthy.
        self.current
            .lock()
            .expect("aggregation window lock poisoned")
    }
}

/// Advance `window` until it contains `timestamp`, skipping empty windows in one step.
fn roll_forward(window: &mut Window, timestamp: f64, width: f64) {
    if !timestamp.is_finite() || timestamp < window.end {
        return;
    }
    let skipped = ((timestamp - window.end) / width).floor();
    *window = Window::new(window.end + skipped * width, width);
    while timestamp >= window.end {
        *window = window.successor();
    }
}
