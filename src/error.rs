//! Error types for threatmesh.
//!
//! All errors that can occur within the core crate are represented by
//! [`NodeError`]. Errors are propagated via `Result<T, NodeError>` throughout
//! the codebase.
//!
//! # Error Classification
//!
//! Errors are classified into four categories that determine retry behavior:
//! - **Parse** — a single feed item failed to decode. Never retried; the
//!   item is skipped and the poll loop continues.
//! - **Network** — transport or protocol-contract failures talking to the
//!   feed. Retried with backoff inside a single polling pass.
//! - **Configuration** — bad or missing config. Never retried; fails node
//!   startup.
//! - **Internal** — bugs (unhandled classifier state, broken invariants).
//!   Never retried, logged at error level.
//!
//! # Retry Policy
//!
//! [`RetryPolicy`]/[`RetryState`] implement the miner's "uniform random 1-5s
//! backoff, up to `num_retries` attempts" behavior. This
//! is deliberately much simpler than exponential backoff — the source
//! protocol does a bounded number of immediate retries within one pass, not
//! a long-running backoff schedule.

use std::fmt;

/// Primary error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    // ── Parse errors — skip the item, keep polling ───────────────────────
    /// A single feed item could not be decoded into indicator/attribute pairs.
    #[error("parse error: {0}")]
    Parse(String),

    /// An unknown observable or TTP type was encountered.
    #[error("unsupported observable type: {0}")]
    UnsupportedObservable(String),

    // ── Network / protocol errors — retryable within a pass ──────────────
    /// The feed source could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// The pull protocol's discovery/collection handshake failed a contract
    /// check (missing collection management service, unknown collection,
    /// non-data-feed collection, no polling service instance).
    #[error("protocol contract violation: {0}")]
    ProtocolContract(String),

    // ── Configuration errors — fail startup, never retried ───────────────
    /// The node configuration was missing a required field or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An age-out expression could not be parsed.
    #[error("invalid age-out expression {0:?}: {1}")]
    InvalidAgeOut(String, String),

    // ── Internal errors — bugs ────────────────────────────────────────────
    /// An indicator landed in a classifier state with no defined action.
    #[error("unhandled classifier state for indicator {0:?}")]
    UnhandledState(String),

    /// An unexpected internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// Whether this error is retryable by the poller's retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Network(_) | NodeError::ProtocolContract(_))
    }

    /// Classify the error for monitoring/alerting.
    pub fn kind(&self) -> NodeErrorKind {
        match self {
            NodeError::Parse(_) | NodeError::UnsupportedObservable(_) => NodeErrorKind::Parse,
            NodeError::Network(_) | NodeError::ProtocolContract(_) => NodeErrorKind::Network,
            NodeError::Configuration(_) | NodeError::InvalidAgeOut(_, _) => {
                NodeErrorKind::Configuration
            }
            NodeError::UnhandledState(_) | NodeError::Internal(_) => NodeErrorKind::Internal,
        }
    }
}

/// Classification of error severity/kind for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeErrorKind {
    Parse,
    Network,
    Configuration,
    Internal,
}

impl fmt::Display for NodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeErrorKind::Parse => write!(f, "PARSE"),
            NodeErrorKind::Network => write!(f, "NETWORK"),
            NodeErrorKind::Configuration => write!(f, "CONFIGURATION"),
            NodeErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

// ── Retry policy ───────────────────────────────────────────────────────────

/// Retry policy for a single polling pass: a bounded number of attempts with
/// a uniform random 1-5 second delay between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts for one polling pass (the first attempt
    /// counts as attempt 1).
    pub num_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { num_retries: 2 }
    }
}

impl RetryPolicy {
    /// Uniform random backoff delay in milliseconds for the next retry.
    pub fn backoff_delay_ms(&self) -> u64 {
        use rand::Rng;
        rand::thread_rng().gen_range(1_000..=5_000)
    }
}

/// Per-pass retry bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryState {
    pub attempt: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// Record a failed attempt. Returns `true` if another attempt should be
    /// made under `policy`.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> bool {
        self.attempt += 1;
        self.attempt < policy.num_retries
    }
}
