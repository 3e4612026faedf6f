//! Phase orchestration for the coapbench load generator: a pool of virtual
//! clients is resized per concurrency level, run for a fixed time and
//! summarised into one record per phase.

pub mod latency;
pub mod manager;
pub mod metrics;
pub mod sink;

pub use latency::LatencyBuffer;
pub use manager::{ClientManager, ManagerConfig};
pub use metrics::{LatencySummary, PhaseResult, PERCENTILES};
pub use sink::{LogFileSink, MemorySink, StatsSink};
