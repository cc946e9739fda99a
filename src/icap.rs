//! ICAP host-framework contract.
//!
//! The ICAP server itself (listener, parser, preview negotiation, chunked
//! transfer) is an external collaborator. This module defines the callback
//! surface it drives: per-request data lifecycle, the preview and
//! end-of-data verdicts, and the body I/O exchange.
//!
//! Contract notes for host adapters:
//! - Every body byte, preview included, is delivered through
//!   [`IcapService::service_io`]. `check_preview` exists for early verdicts
//!   (e.g. bodyless requests), not for accumulation.
//! - Per-request data is owned by the thread currently servicing the
//!   request; the host may move a request between threads across callback
//!   invocations but never runs two callbacks for one request concurrently.
//! - Dropping the `Data` value is the release point for all per-request
//!   resources.

use std::io;

/// Which ICAP vector a service registers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcapVector {
    Reqmod,
    Respmod,
}

/// Verdict from the preview callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewVerdict {
    /// Keep streaming the body; the service decides at end-of-data.
    Continue,
    /// Unmodified; the host answers 204 without transferring the body.
    Allow204,
}

/// Verdict from the end-of-data callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModVerdict {
    /// The service produced (or passes through) a body via `service_io`.
    Done,
    /// Unmodified; the host answers 204.
    Allow204,
}

/// Result of the write half of a `service_io` exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// No verdict yet; the host should keep feeding body data.
    NotReady,
    /// `n` bytes were placed in the write buffer.
    Data(usize),
    /// The outbound body is complete.
    Eof,
}

#[derive(Debug, thiserror::Error)]
pub enum IcapError {
    #[error("body passthrough I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Case-insensitive HTTP header view, as handed over by the host.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// An HTTP response synthesized by a service in place of the original
/// message. The host serializes it ahead of the error body streamed out
/// through `service_io`.
#[derive(Debug, Clone)]
pub struct SynthesizedResponse {
    pub status_line: String,
    pub headers: Vec<(String, String)>,
}

impl SynthesizedResponse {
    pub fn new(status_line: impl Into<String>) -> Self {
        Self {
            status_line: status_line.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The host's per-request view handed to every callback.
#[derive(Debug, Clone)]
pub struct IcapRequest {
    /// Headers of the encapsulated HTTP request.
    pub request_headers: HeaderMap,
    /// Headers of the encapsulated HTTP response (RESPMOD only).
    pub response_headers: Option<HeaderMap>,
    /// Whether an encapsulated body follows.
    pub has_body: bool,
    /// Filled by the service when it replaces the message outright.
    pub synthesized: Option<SynthesizedResponse>,
}

impl IcapRequest {
    pub fn reqmod(request_headers: HeaderMap, has_body: bool) -> Self {
        Self {
            request_headers,
            response_headers: None,
            has_body,
            synthesized: None,
        }
    }

    pub fn respmod(request_headers: HeaderMap, response_headers: HeaderMap) -> Self {
        Self {
            request_headers,
            response_headers: Some(response_headers),
            has_body: true,
            synthesized: None,
        }
    }
}

/// The callback contract an inspection service implements.
///
/// Service construction plays the role of `init_service` (fallible, runs
/// once); dropping the service is `close_service`.
pub trait IcapService: Send + Sync {
    /// Per-request state, created fresh for every request.
    type Data: Send;

    fn name(&self) -> &'static str;

    fn vector(&self) -> IcapVector;

    fn init_request_data(&self, req: &IcapRequest) -> Self::Data;

    fn check_preview(
        &self,
        data: &mut Self::Data,
        req: &mut IcapRequest,
        preview: &[u8],
    ) -> PreviewVerdict;

    fn end_of_data(&self, data: &mut Self::Data, req: &mut IcapRequest) -> ModVerdict;

    /// Exchange body data. `rbuf` carries inbound bytes when present,
    /// `eof` marks the end of the inbound stream, and `wbuf` (when
    /// present) receives outbound bytes per the returned [`WriteOutcome`].
    fn service_io(
        &self,
        data: &mut Self::Data,
        rbuf: Option<&[u8]>,
        wbuf: Option<&mut [u8]>,
        eof: bool,
    ) -> Result<WriteOutcome, IcapError>;
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let headers = HeaderMap::from_pairs([("Host", "api.telegram.org")]);
        assert_eq!(headers.get("host"), Some("api.telegram.org"));
        assert_eq!(headers.get("HOST"), Some("api.telegram.org"));
        assert_eq!(headers.get("Content-Type"), None);
    }

    #[test]
    fn test_header_first_value_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Test", "one");
        headers.insert("x-test", "two");
        assert_eq!(headers.get("X-Test"), Some("one"));
    }

    #[test]
    fn test_synthesized_response_builder() {
        let resp = SynthesizedResponse::new("HTTP/1.1 403 Forbidden")
            .header("X-polis-Block", "true")
            .header("Content-Type", "text/html");
        assert_eq!(resp.get_header("x-polis-block"), Some("true"));
        assert_eq!(resp.headers.len(), 2);
    }
}
