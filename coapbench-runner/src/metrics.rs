use std::fmt;
use std::time::Duration;

use coapbench_client::ClientSnapshot;

use crate::latency::LatencyBuffer;

/// Percentiles reported for every phase, in output order.
pub const PERCENTILES: [u32; 16] = [0, 10, 20, 30, 40, 50, 60, 66, 70, 75, 80, 90, 95, 98, 99, 100];

/// Column header matching the `Display` output of a full record.
pub const RECORD_HEADER: &str = "Timeouts, Concurrency, Time, Completed, Throughput | 0%, 10%, 20%, 30%, 40%, 50%, 60%, 66%, 70%, 75%, 80%, 90%, 95%, 98%, 99%, 100%, stdev(ms)";

/// Latency distribution of one phase; only exists when samples were taken.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencySummary {
    /// One value per entry of [`PERCENTILES`].
    pub percentiles: [u32; 16],
    pub mean_ms: f64,
    pub stdev_ms: f64,
    pub samples: usize,
}

impl LatencySummary {
    /// `None` for an empty buffer.
    pub fn from_buffer(buffer: LatencyBuffer) -> Option<Self> {
        if buffer.is_empty() {
            return None;
        }
        let sorted = buffer.into_sorted();
        let mut percentiles = [0; 16];
        for (slot, &p) in percentiles.iter_mut().zip(PERCENTILES.iter()) {
            *slot = percentile(&sorted, p);
        }
        let mean_ms = mean(&sorted);
        Some(Self {
            percentiles,
            mean_ms,
            stdev_ms: population_stdev(&sorted, mean_ms),
            samples: sorted.len(),
        })
    }

    /// Value for a percentile of [`PERCENTILES`].
    pub fn get(&self, p: u32) -> Option<u32> {
        PERCENTILES.iter().position(|&q| q == p).map(|i| self.percentiles[i])
    }
}

/// Aggregate of one concurrency phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseResult {
    pub concurrency: usize,
    pub elapsed: Duration,
    pub completed: u64,
    pub timeouts: u64,
    pub throughput: f64,
    pub latency: Option<LatencySummary>,
    /// URI the pool was aimed at, reported when there is no latency data.
    pub target: String,
}

impl PhaseResult {
    pub fn aggregate(
        concurrency: usize,
        elapsed: Duration,
        snapshots: &[ClientSnapshot],
        target: impl Into<String>,
    ) -> Self {
        let completed = snapshots.iter().map(|s| s.count).sum::<u64>();
        let timeouts = snapshots.iter().map(|s| s.timeouts).sum::<u64>();

        let mut buffer = LatencyBuffer::with_capacity(snapshots.iter().map(|s| s.latencies.len()).sum());
        for snapshot in snapshots {
            buffer.merge(&snapshot.latencies);
        }

        Self {
            concurrency,
            elapsed,
            completed,
            timeouts,
            throughput: throughput(completed, elapsed),
            latency: LatencySummary::from_buffer(buffer),
            target: target.into(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

impl fmt::Display for PhaseResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.elapsed.as_secs_f64();
        match &self.latency {
            Some(latency) => {
                write!(
                    f,
                    "{}, {}, {:.3}, {}, {:.2} |",
                    self.timeouts, self.concurrency, secs, self.completed, self.throughput
                )?;
                for value in latency.percentiles {
                    write!(f, " {value},")?;
                }
                write!(f, " {:.1}", latency.stdev_ms)
            }
            None => write!(
                f,
                "c={}, t={:.3}, received={}, timeouts={}, throughput={:.2}, uri={}",
                self.concurrency, secs, self.completed, self.timeouts, self.throughput, self.target
            ),
        }
    }
}

/// Completed requests per second.
pub fn throughput(completed: u64, elapsed: Duration) -> f64 {
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    if elapsed_ms <= 0.0 {
        return 0.0;
    }
    completed as f64 * 1000.0 / elapsed_ms
}

/// Element at index `floor(n * p / 100)` of an ascending slice; the 100th
/// percentile is the last element. Returns 0 for an empty slice.
pub fn percentile(sorted: &[u32], p: u32) -> u32 {
    if sorted.is_empty() {
        return 0;
    }
    let n = sorted.len();
    if p >= 100 {
        return sorted[n - 1];
    }
    let idx = n * p as usize / 100;
    sorted[idx.min(n - 1)]
}

pub fn mean(samples: &[u32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|&s| s as u64).sum::<u64>() as f64 / samples.len() as f64
}

/// Standard deviation over the whole population (divides by n).
pub fn population_stdev(samples: &[u32], mean: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let variance = samples
        .iter()
        .map(|&s| {
            let d = s as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / samples.len() as f64;
    variance.sqrt()
}
