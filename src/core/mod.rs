//! Core logic: classification, windowed aggregation, snapshots.
//!
//! - [`Aggregator`]: mutex-guarded current window with roll/drain operations
//! - [`Window`] / [`ClientCounters`]: per-client, per-protocol byte counters
//! - [`Snapshot`]: serializable projection of a window with top-K selection
//! - [`classify`]: transport layer + ports to protocol label
//! - [`Anonymizer`]: keyed hashing of client identifiers

pub mod aggregator;
pub mod anonymizer;
pub mod classifier;
pub mod snapshot;
pub mod window;

pub use aggregator::Aggregator;
pub use anonymizer::{Anonymizer, KeySource};
pub use classifier::{classify, TransportLayer};
pub use snapshot::{ClientSnapshot, ProtocolSnapshot, Snapshot, SnapshotMeta};
pub use window::{ClientCounters, Direction, DirectionCounters, Window};
