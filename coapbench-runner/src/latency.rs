/// Millisecond latency samples merged from every client of a phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyBuffer {
    samples: Vec<u32>,
}

impl LatencyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { samples: Vec::with_capacity(capacity) }
    }

    pub fn push(&mut self, latency_ms: u32) {
        self.samples.push(latency_ms);
    }

    /// Append another client's samples, keeping their order.
    pub fn merge(&mut self, samples: &[u32]) {
        self.samples.extend_from_slice(samples);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.samples
    }

    /// Consume the buffer and return the samples in ascending order.
    pub fn into_sorted(mut self) -> Vec<u32> {
        self.samples.sort_unstable();
        self.samples
    }
}

impl From<Vec<u32>> for LatencyBuffer {
    fn from(samples: Vec<u32>) -> Self {
        Self { samples }
    }
}
