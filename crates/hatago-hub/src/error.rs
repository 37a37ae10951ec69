//! Typed error surface for the hub core.
//!
//! `HubError` is the surface the router converts into a JSON-RPC error
//! payload. Internal plumbing (config loading, process spawning, socket
//! binding) stays on `anyhow::Result` and is folded into a `HubError`
//! only at the boundary where it becomes visible to a caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    /// Malformed JSON-RPC, missing required field, wrong argument type.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Public name or URI does not resolve.
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    /// I/O failure on an upstream connector.
    #[error("transport error on upstream '{upstream}': {message}")]
    TransportError { upstream: String, message: String },

    /// Upstream rejected or timed out during MCP initialisation.
    #[error("handshake error on upstream '{upstream}': {message}")]
    HandshakeError { upstream: String, message: String },

    /// Upstream answered with a JSON-RPC error; relayed verbatim.
    #[error("upstream '{upstream}' returned an error: {message}")]
    UpstreamError { upstream: String, message: String },

    /// Local deadline expired.
    #[error("request to upstream '{upstream}' timed out after {timeout_secs}s")]
    Timeout { upstream: String, timeout_secs: u64 },

    /// Upstream rejected credentials.
    #[error("unauthorised on upstream '{upstream}': {message}")]
    Unauthorised { upstream: String, message: String },

    /// Hub-level invariant violation; never auto-recovered.
    #[error("fatal hub error: {0}")]
    Fatal(String),
}

impl HubError {
    /// JSON-RPC error code reported to the caller for this kind.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            Self::InvalidInput(_) => -32602,
            Self::UnknownTarget(_) => -32601,
            Self::TransportError { .. } => -32000,
            Self::HandshakeError { .. } => -32001,
            Self::UpstreamError { .. } => -32002,
            Self::Timeout { .. } => -32003,
            Self::Unauthorised { .. } => -32004,
            Self::Fatal(_) => -32603,
        }
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
