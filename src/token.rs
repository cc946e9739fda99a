//! Token generation from the kernel entropy source.
//!
//! Two token shapes are produced: one-time tokens (`ott-` + 8 alphanumeric
//! characters) that stand in for request identifiers on the wire, and
//! request identifiers (`req-` + 8 lowercase hex characters) minted when a
//! request is blocked. Both draw exclusively from kernel entropy; there is
//! no userspace PRNG fallback. Any entropy failure aborts the caller's
//! operation (fail-closed).

use thiserror::Error;

/// Total length of a one-time token: "ott-" plus 8 characters.
pub const OTT_LEN: usize = 12;

/// Total length of a request identifier: "req-" plus 8 hex characters.
pub const REQUEST_ID_LEN: usize = 12;

const OTT_RANDOM_BYTES: usize = 8;

/// 62-character alphanumeric alphabet for token code characters.
/// One entropy byte maps to one character via modulo 62; the reduction
/// slightly overweights the last four alphabet positions, accepted for a
/// short-TTL namespace with set-if-absent collision retry.
const OTT_CHARSET: &[u8; 62] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("kernel entropy source failed: {0}")]
    Entropy(getrandom::Error),
}

impl From<getrandom::Error> for TokenError {
    fn from(e: getrandom::Error) -> Self {
        TokenError::Entropy(e)
    }
}

/// Generate a one-time token of the form `ott-[A-Za-z0-9]{8}`.
pub fn generate_ott() -> Result<String, TokenError> {
    let mut raw = [0u8; OTT_RANDOM_BYTES];
    getrandom::getrandom(&mut raw)?;

    let mut out = String::with_capacity(OTT_LEN);
    out.push_str("ott-");
    for byte in raw {
        out.push(OTT_CHARSET[(byte % 62) as usize] as char);
    }
    Ok(out)
}

/// Generate a request identifier of the form `req-[a-f0-9]{8}`.
pub fn generate_request_id() -> Result<String, TokenError> {
    let mut raw = [0u8; 4];
    getrandom::getrandom(&mut raw)?;
    Ok(format!("req-{}", hex::encode(raw)))
}

/// Strict format check for a request identifier before it is trusted as a
/// key component: exactly `req-` followed by 8 lowercase hex characters.
pub fn is_valid_request_id(candidate: &str) -> bool {
    let bytes = candidate.as_bytes();
    bytes.len() == REQUEST_ID_LEN
        && bytes.starts_with(b"req-")
        && bytes[4..]
            .iter()
            .all(|c| matches!(c, b'0'..=b'9' | b'a'..=b'f'))
}

// ── Tests ───────────────────────────────────────────────────────
