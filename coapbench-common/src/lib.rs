use thiserror::Error;

pub mod config;
pub mod wire;

pub use wire::{CorrelationToken, Method, ResponseCode, ResponseView};

/// Error types for coapbench operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BenchError {
    #[error("Cannot bind to {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Unknown host: {0}")]
    UnresolvedHost(String),

    #[error("Invalid URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    /// The target answered with a status code that is not a success for the method.
    #[error("Protocol violation: unexpected response code {code} to {method}")]
    ProtocolViolation { code: ResponseCode, method: Method },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Virtual client {0} did not report before the drain deadline")]
    ClientUnresponsive(usize),

    #[error("Invalid concurrency series: {0}")]
    InvalidSeries(String),

    #[error("A phase is already running")]
    PhaseActive,

    #[error("No phase is running")]
    NoActivePhase,

    #[error("Stats sink error: {0}")]
    Sink(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type for coapbench operations
pub type Result<T> = std::result::Result<T, BenchError>;
