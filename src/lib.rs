//! polis Sentinel - ICAP inspection services for AI agent egress.
//!
//! Two services plug into an ICAP host framework in front of the forward
//! proxy that carries agent traffic:
//!
//! - [`reqmod::ReqmodService`] (`polis_dlp`, REQMOD): scans outbound
//!   request bodies for credential patterns, enforces the dynamic
//!   new-domain policy, and rewrites embedded approve commands so that a
//!   live request id is replaced by a single-use token.
//! - [`respmod::RespmodService`] (`polis_sentinel_resp`, RESPMOD): virus
//!   scans inbound response bodies, and for allowlisted messaging
//!   channels consumes approval tokens, releasing previously blocked
//!   requests through an audit-first commit.
//!
//! Shared state lives in a Valkey store reached over mutual TLS with
//! three least-privilege identities; antivirus verdicts come from a
//! clamd-compatible daemon behind a circuit breaker. The ICAP host
//! itself is consumed through the callback contract in [`icap`].

pub mod audit;
pub mod body;
pub mod clamav;
pub mod config;
pub mod domains;
pub mod gzip;
pub mod icap;
pub mod patterns;
pub mod policy;
pub mod reqmod;
pub mod respmod;
pub mod store;
pub mod token;

pub use config::Config;
pub use icap::{IcapService, IcapVector, ModVerdict, PreviewVerdict, WriteOutcome};
pub use reqmod::ReqmodService;
pub use respmod::RespmodService;

/// Install the process-wide log subscriber, honouring `RUST_LOG`. Host
/// adapters call this once before registering services; repeated calls
/// are harmless.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
