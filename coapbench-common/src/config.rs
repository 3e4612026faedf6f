use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::{BenchError, Method, Result};

/// Port used when the target URI does not name one.
pub const DEFAULT_COAP_PORT: u16 = 5683;

/// How long a virtual client waits for the response to one request.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Pause after a phase before the next one starts.
pub const SETTLE_INTERVAL: Duration = Duration::from_millis(5_000);

/// Pause after the last phase of a series.
pub const FINAL_SETTLE_INTERVAL: Duration = Duration::from_millis(1_000);

/// Extra time, on top of the receive timeout, granted to clients to report after stop.
pub const DRAIN_GRACE: Duration = Duration::from_millis(1_000);

pub const DEFAULT_PHASE_SECS: u64 = 30;
pub const DEFAULT_CLIENTS: usize = 1;
pub const DEFAULT_METHOD: Method = Method::Get;

/// Registration lifetime bounds (seconds).
pub const MIN_LIFETIME_SECS: u64 = 60;
pub const MAX_LIFETIME_SECS: u64 = 86_400;

/// Base name of the summary log file.
pub const LOG_FILE: &str = "coapbench";

/// Local address selection for the client pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "addr", rename_all = "snake_case")]
pub enum BindMode {
    /// Let the OS choose.
    #[default]
    System,
    /// Every client binds to this address (port 0 picks a free port).
    Shared(SocketAddr),
    /// Client `i` binds to the base address plus `i`.
    Sequential(IpAddr),
}

impl BindMode {
    pub fn address_for(&self, index: usize) -> Option<SocketAddr> {
        match *self {
            BindMode::System => None,
            BindMode::Shared(addr) => Some(addr),
            BindMode::Sequential(IpAddr::V4(base)) => {
                let ip = Ipv4Addr::from(u32::from(base).wrapping_add(index as u32));
                Some(SocketAddr::new(IpAddr::V4(ip), 0))
            }
            BindMode::Sequential(IpAddr::V6(base)) => {
                let ip = Ipv6Addr::from(u128::from(base).wrapping_add(index as u128));
                Some(SocketAddr::new(IpAddr::V6(ip), 0))
            }
        }
    }
}

/// Registration settings: every client registers as `<endpoint><index>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub endpoint: String,
    #[serde(default)]
    pub lifetime_secs: Option<u64>,
}

/// Benchmark settings, loadable from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub target: String,
    pub bind: BindMode,
    pub method: Method,
    pub payload: Option<String>,
    pub latency: bool,
    pub registration: Option<Registration>,
    pub series: Vec<usize>,
    pub duration_secs: u64,
    pub receive_timeout_ms: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            bind: BindMode::System,
            method: DEFAULT_METHOD,
            payload: None,
            latency: false,
            registration: None,
            series: vec![DEFAULT_CLIENTS],
            duration_secs: DEFAULT_PHASE_SECS,
            receive_timeout_ms: RECEIVE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl BenchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target.is_empty() {
            return Err(BenchError::Config("no target specified".to_string()));
        }
        if self.duration_secs == 0 {
            return Err(BenchError::Config("phase duration must be positive".to_string()));
        }
        if self.receive_timeout_ms == 0 {
            return Err(BenchError::Config("receive timeout must be positive".to_string()));
        }
        validate_series(&self.series)
    }

    /// Method of the first request; registrations are always POSTs.
    pub fn effective_method(&self) -> Method {
        if self.registration.is_some() {
            Method::Post
        } else {
            self.method
        }
    }

    /// The URI the pool is built against: the registration URI in registration mode.
    pub fn pool_target(&self) -> String {
        match &self.registration {
            Some(reg) => {
                let lifetime = clamp_lifetime(reg.lifetime_secs.unwrap_or(0), self.duration_secs);
                registration_uri(&self.target, &reg.endpoint, lifetime)
            }
            None => self.target.clone(),
        }
    }
}

/// Parse a comma separated list of concurrency levels, e.g. `1,10,50`.
pub fn parse_series(list: &str) -> Result<Vec<usize>> {
    let series = list
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<usize>()
                .map_err(|_| BenchError::InvalidSeries(format!("{part:?} is not a client count")))
        })
        .collect::<Result<Vec<_>>>()?;
    validate_series(&series)?;
    Ok(series)
}

pub fn validate_series(series: &[usize]) -> Result<()> {
    if series.is_empty() {
        return Err(BenchError::InvalidSeries("empty".to_string()));
    }
    if series.contains(&0) {
        return Err(BenchError::InvalidSeries("levels must be positive".to_string()));
    }
    Ok(())
}

/// Clamp a requested registration lifetime; anything below the minimum falls
/// back to the phase duration when that is long enough.
pub fn clamp_lifetime(requested_secs: u64, phase_secs: u64) -> u64 {
    if requested_secs > MAX_LIFETIME_SECS {
        MAX_LIFETIME_SECS
    } else if requested_secs < MIN_LIFETIME_SECS {
        phase_secs.clamp(MIN_LIFETIME_SECS, MAX_LIFETIME_SECS)
    } else {
        requested_secs
    }
}

/// `<target>/rd?lt=<lifetime>&ep=<endpoint>`; the pool appends the client index.
pub fn registration_uri(target: &str, endpoint: &str, lifetime_secs: u64) -> String {
    format!("{}rd?lt={}&ep={}", with_trailing_slash(target), lifetime_secs, endpoint)
}

/// `<scheme>/rd/<location>`, the target of registration updates.
pub fn registration_update_uri(scheme: &str, location: &str) -> String {
    format!("{}rd/{}", with_trailing_slash(scheme), location)
}

fn with_trailing_slash(uri: &str) -> String {
    if uri.ends_with('/') {
        uri.to_string()
    } else {
        format!("{uri}/")
    }
}
