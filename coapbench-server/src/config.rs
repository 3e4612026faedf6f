use std::time::Duration;

/// Largest datagram the responder reads; longer requests are truncated.
pub const MAX_DATAGRAM: usize = 1500;

/// Registration ids are handed out from here upward, in hex.
pub const FIRST_REGISTRATION_ID: u32 = 0xa000;

/// Delay applied before answering when none is configured.
pub const DEFAULT_DELAY: Duration = Duration::ZERO;
