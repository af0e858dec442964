//! Error taxonomy.
//!
//! Per-peer transport errors are isolated and counted, never surfaced
//! verbatim to clients. `CoreError` is the boundary type returned from
//! the public operations of each component; `anyhow` is used above that
//! boundary (config loading, startup) the way `freeq-server::main` does.

use thiserror::Error;

use crate::model::PrefixedError;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Connect/dial/read/write failure talking to an upstream peer.
    #[error("transport error talking to {peer}: {reason}")]
    PeerTransport { peer: String, reason: String },

    /// A machine-readable prefixed rejection from an upstream relay.
    #[error("{0}")]
    PeerSemantic(PrefixedError),

    /// Size/tag/timestamp/kind violation caught before fan-out.
    #[error("blocked: {0}")]
    ClientPolicy(String),

    /// Connection- or filter-rate-limit violation.
    #[error("rate limited: {0}")]
    LimiterDenial(String),

    /// No peer supports the requested capability (COUNT). Not a hard
    /// error — callers that hit this should return a zero count, not
    /// propagate a failure.
    #[error("no peer supports the requested capability")]
    CapabilityAbsent,

    /// Every peer failed a fan-out operation; `errors` holds one entry
    /// per peer that was attempted.
    #[error("all {} peers failed: {}", errors.len(), join_errors(errors))]
    AllPeersFailed { errors: Vec<PrefixedError> },

    /// Startup-only inconsistency (bad config, empty peer list).
    #[error("internal error: {0}")]
    Internal(String),
}

fn join_errors(errors: &[PrefixedError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl CoreError {
    /// The first prefixed error observed, if any, else `None` — used by the
    /// broadcast store's all-fail path: success if any peer accepted,
    /// else the first recognized rejection, else a joined list of all of
    /// them.
    pub fn first_prefixed(errors: &[PrefixedError]) -> Option<&PrefixedError> {
        errors.iter().find(|e| e.prefix.is_some())
    }
}
