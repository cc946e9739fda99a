//! REQMOD service `polis_dlp` - outbound DLP with approve-command rewrite.
//!
//! Every outbound request body is screened against the credential catalog
//! and the new-domain policy. Blocked requests receive a synthesized 403
//! carrying a freshly minted request id for the approval workflow. On the
//! allowed path, a `/polis-approve req-xxxxxxxx` command embedded in the
//! body is rewritten in place: the request id is swapped for a single-use
//! token registered in the shared store, so the live id never reaches the
//! messaging channel.

use std::path::Path;

use anyhow::Context;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit;
use crate::body::{BodyAccumulator, REQMOD_SCAN_CAP};
use crate::config::Config;
use crate::domains;
use crate::icap::{
    IcapError, IcapRequest, IcapService, IcapVector, ModVerdict, PreviewVerdict,
    SynthesizedResponse, WriteOutcome,
};
use crate::patterns::PatternRegistry;
use crate::policy::{self, PolicyAction, PolicyPoller};
use crate::store::{
    keys, valkey_connector, StoreCoordinator, StoreError, StoreIdentity, ValkeyConfig,
};
use crate::token;

pub const SERVICE_NAME: &str = "polis_dlp";

/// TTL of a registered one-time token.
const OTT_TTL_SECS: u64 = 600;

/// TTL of the per-request-id rewrite lock.
const OTT_LOCK_TTL_SECS: u64 = 30;

const UNAVAILABLE_BODY: &str =
    "Approval service temporarily unavailable. Please retry in a moment.\n";

pub struct ReqmodService {
    patterns: PatternRegistry,
    policy: PolicyPoller,
    gov_store: StoreCoordinator,
    approve_re: regex::bytes::Regex,
    time_gate_secs: i64,
}

pub struct ReqmodData {
    body: BodyAccumulator,
    host: String,
    blocked: bool,
    matched_pattern: String,
    request_id: String,
    ott_rewritten: bool,
    rewritten_sent: usize,
    error_page: Vec<u8>,
    error_sent: usize,
    eof: bool,
}

enum RewriteOutcome {
    NotApplicable,
    Rewritten,
    ServiceUnavailable,
}

impl ReqmodService {
    pub fn new(
        patterns: PatternRegistry,
        policy: PolicyPoller,
        gov_store: StoreCoordinator,
        time_gate_secs: i64,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !patterns.is_empty(),
            "credential catalog is empty, refusing to start"
        );
        let approve_re = regex::bytes::Regex::new(r"/polis-approve\s+(req-[a-f0-9]{8})")
            .context("failed to compile approve command regex")?;
        Ok(Self {
            patterns,
            policy,
            gov_store,
            approve_re,
            time_gate_secs,
        })
    }

    /// Production wiring: catalog from disk, both store identities over
    /// mutual TLS.
    pub fn from_config(cfg: &Config, catalog: &Path) -> anyhow::Result<Self> {
        let patterns = PatternRegistry::load(catalog)?;
        let policy = PolicyPoller::new(StoreCoordinator::new(
            StoreIdentity::DlpReader,
            valkey_connector(ValkeyConfig::from_config(cfg, StoreIdentity::DlpReader)),
        ));
        let gov_store = StoreCoordinator::new(
            StoreIdentity::GovReqmod,
            valkey_connector(ValkeyConfig::from_config(cfg, StoreIdentity::GovReqmod)),
        );
        Self::new(patterns, policy, gov_store, cfg.time_gate_secs)
    }

    fn apply_policy(&self, host: &str, has_credential: bool) -> PolicyAction {
        let level = self.policy.current_level();
        policy::apply(level, domains::is_known_domain(host), has_credential)
    }

    fn synthesize_block(&self, data: &mut ReqmodData, req: &mut IcapRequest) {
        match token::generate_request_id() {
            Ok(rid) => data.request_id = rid,
            // The id header is simply omitted; the block itself stands.
            Err(e) => warn!(error = %e, "request id generation failed"),
        }

        let body = format!(
            "<html><head><title>403 Forbidden</title></head>\
             <body><h1>403 Forbidden</h1>\
             <p>Request blocked by DLP: {}</p></body></html>",
            data.matched_pattern
        );
        data.error_page = body.into_bytes();

        let mut resp = SynthesizedResponse::new("HTTP/1.1 403 Forbidden")
            .header("Server", "polis-dlp")
            .header("Content-Type", "text/html")
            .header("Connection", "close")
            .header("Content-Length", data.error_page.len().to_string())
            .header("X-polis-Block", "true")
            .header("X-polis-Reason", data.matched_pattern.as_str())
            .header("X-polis-Pattern", data.matched_pattern.as_str());
        if !data.request_id.is_empty() {
            resp = resp.header("X-polis-Request-Id", data.request_id.as_str());
        }
        req.synthesized = Some(resp);

        info!(
            host = %data.host,
            pattern = %data.matched_pattern,
            request_id = %data.request_id,
            "request blocked"
        );
    }

    fn synthesize_unavailable(&self, data: &mut ReqmodData, req: &mut IcapRequest) {
        warn!(
            host = %data.host,
            "approval store unreachable, blocking approve command so the request id cannot leak"
        );
        data.blocked = true;
        data.error_page = UNAVAILABLE_BODY.as_bytes().to_vec();
        req.synthesized = Some(
            SynthesizedResponse::new("HTTP/1.1 403 Forbidden")
                .header("X-polis-Block", "approval_service_unavailable")
                .header("Content-Type", "text/plain")
                .header("Content-Length", data.error_page.len().to_string()),
        );
    }

    /// Allowed-pass rewrite: swap an embedded approve-command request id
    /// for a registered one-time token, length-preserving.
    fn try_ott_rewrite(&self, data: &mut ReqmodData) -> RewriteOutcome {
        let (request_id, span) = {
            let Some(caps) = self.approve_re.captures(data.body.scan_buf()) else {
                return RewriteOutcome::NotApplicable;
            };
            let Some(m) = caps.get(1) else {
                return RewriteOutcome::NotApplicable;
            };
            (String::from_utf8_lossy(m.as_bytes()).into_owned(), m.range())
        };

        debug!(request_id = %request_id, "approve command found");

        if !token::is_valid_request_id(&request_id) {
            warn!("request id format invalid, skipping rewrite");
            return RewriteOutcome::NotApplicable;
        }
        if data.host.is_empty() {
            warn!("approve command without Host header, skipping rewrite");
            return RewriteOutcome::NotApplicable;
        }
        if data.body.overflowed() {
            // The rewritten scan buffer doubles as the replay source, so
            // a body past the scan cap cannot be rewritten.
            warn!(
                total = data.body.total_len(),
                "body exceeds scan cap, skipping rewrite"
            );
            return RewriteOutcome::NotApplicable;
        }

        let now = chrono::Utc::now().timestamp();
        let armed_after = now + self.time_gate_secs;
        let host = data.host.clone();
        let rid = request_id.clone();

        let registered = self.gov_store.with_conn(|conn| {
            if !conn.set_nx_ex(&keys::ott_lock(&rid), "1", OTT_LOCK_TTL_SECS)? {
                debug!(request_id = %rid, "rewrite lock contention, skipping");
                return Ok(None);
            }
            if !conn.exists(&keys::blocked(&rid))? {
                debug!(request_id = %rid, "no blocked record, skipping rewrite");
                return Ok(None);
            }

            let mut ott = match token::generate_ott() {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "token generation failed, abandoning rewrite");
                    return Ok(None);
                }
            };
            let mut mapping = ott_mapping(&ott, &rid, armed_after, &host);
            if !conn.set_nx_ex(&keys::ott(&ott), &mapping, OTT_TTL_SECS)? {
                warn!("token collision, regenerating");
                ott = match token::generate_ott() {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "token regeneration failed, abandoning rewrite");
                        return Ok(None);
                    }
                };
                mapping = ott_mapping(&ott, &rid, armed_after, &host);
                if !conn.set_nx_ex(&keys::ott(&ott), &mapping, OTT_TTL_SECS)? {
                    warn!("token collision on retry, abandoning rewrite");
                    return Ok(None);
                }
            }

            if let Err(e) = audit::append(
                conn,
                now,
                &audit::ott_rewrite_event(&rid, &ott, &host, now),
            ) {
                warn!(error = %e, "audit write failed for rewrite event");
            }
            Ok(Some(ott))
        });

        let ott = match registered {
            Ok(Some(ott)) => ott,
            Ok(None) => return RewriteOutcome::NotApplicable,
            Err(StoreError::Command(e)) => {
                warn!(error = %e, "store command failed during rewrite, skipping");
                return RewriteOutcome::NotApplicable;
            }
            Err(_) => return RewriteOutcome::ServiceUnavailable,
        };

        if span.len() != ott.len() {
            warn!("token length mismatch, abandoning rewrite");
            return RewriteOutcome::NotApplicable;
        }
        let size_before = data.body.scan_buf().len();
        data.body.scan_buf_mut()[span].copy_from_slice(ott.as_bytes());
        if data.body.scan_buf().len() != size_before {
            warn!("buffer size changed during substitution, abandoning rewrite");
            return RewriteOutcome::NotApplicable;
        }

        data.ott_rewritten = true;
        data.rewritten_sent = 0;
        info!(
            request_id = %request_id,
            host = %data.host,
            "approve command rewritten"
        );
        RewriteOutcome::Rewritten
    }
}

fn ott_mapping(ott: &str, request_id: &str, armed_after: i64, origin_host: &str) -> String {
    json!({
        "ott_code": ott,
        "request_id": request_id,
        "armed_after": armed_after,
        "origin_host": origin_host,
    })
    .to_string()
}

impl IcapService for ReqmodService {
    type Data = ReqmodData;

    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn vector(&self) -> IcapVector {
        IcapVector::Reqmod
    }

    fn init_request_data(&self, req: &IcapRequest) -> ReqmodData {
        let host = req
            .request_headers
            .get("Host")
            .unwrap_or_default()
            .to_string();
        debug!(host = %host, "request data initialized");
        ReqmodData {
            body: BodyAccumulator::new(REQMOD_SCAN_CAP),
            host,
            blocked: false,
            matched_pattern: String::new(),
            request_id: String::new(),
            ott_rewritten: false,
            rewritten_sent: 0,
            error_page: Vec::new(),
            error_sent: 0,
            eof: false,
        }
    }

    fn check_preview(
        &self,
        data: &mut ReqmodData,
        req: &mut IcapRequest,
        _preview: &[u8],
    ) -> PreviewVerdict {
        if req.has_body {
            return PreviewVerdict::Continue;
        }

        // Bodyless requests still face the domain policy; without this a
        // GET to an unknown destination would bypass it entirely. A block
        // is deferred to end-of-data where the 403 is synthesized.
        match self.apply_policy(&data.host, false) {
            PolicyAction::Allow => {
                debug!(host = %data.host, "no body, known destination, allowing");
                PreviewVerdict::Allow204
            }
            _ => {
                debug!(host = %data.host, "no body, new destination, deferring");
                PreviewVerdict::Continue
            }
        }
    }

    fn end_of_data(&self, data: &mut ReqmodData, req: &mut IcapRequest) -> ModVerdict {
        // Credential scan over the capped buffer.
        if let Some(name) = self.patterns.evaluate(data.body.scan_buf(), &data.host) {
            data.blocked = true;
            data.matched_pattern = name.to_string();
        }

        // Past the cap, the tail window is the only view of the body's
        // end. NUL bytes split it into independently scanned segments.
        if !data.blocked && data.body.overflowed() {
            debug!(
                total = data.body.total_len(),
                "body exceeds scan cap, scanning tail window"
            );
            let mut tail_hit = None;
            for segment in data.body.tail().split(|&b| b == 0) {
                if segment.is_empty() {
                    continue;
                }
                if let Some(name) = self.patterns.evaluate(segment, &data.host) {
                    tail_hit = Some(name.to_string());
                    break;
                }
            }
            if let Some(name) = tail_hit {
                data.blocked = true;
                data.matched_pattern = name;
            }
        }

        // Compose with the new-domain policy.
        let action = self.apply_policy(&data.host, data.blocked);
        if !data.blocked {
            match action {
                PolicyAction::Block => {
                    data.blocked = true;
                    data.matched_pattern = "new_domain_blocked".into();
                    info!(host = %data.host, "new destination blocked, level strict");
                }
                PolicyAction::Prompt => {
                    data.blocked = true;
                    data.matched_pattern = "new_domain_prompt".into();
                    info!(host = %data.host, "new destination held, level balanced");
                }
                PolicyAction::Allow => {}
            }
        }

        // A recent host-scoped approval clears the block so retries go
        // through after the user approved the original request.
        if data.blocked && !data.host.is_empty() {
            let key = keys::approved_host(&data.host);
            match self.gov_store.with_conn(|c| c.exists(&key)) {
                Ok(true) => {
                    info!(host = %data.host, "active host approval, allowing through");
                    data.blocked = false;
                    data.matched_pattern.clear();
                }
                Ok(false) => {}
                Err(e) => debug!(error = %e, "host approval lookup unavailable"),
            }
        }

        if data.blocked {
            self.synthesize_block(data, req);
            data.eof = true;
            return ModVerdict::Done;
        }

        if let RewriteOutcome::ServiceUnavailable = self.try_ott_rewrite(data) {
            self.synthesize_unavailable(data, req);
        }

        data.eof = true;
        ModVerdict::Done
    }

    fn service_io(
        &self,
        data: &mut ReqmodData,
        rbuf: Option<&[u8]>,
        wbuf: Option<&mut [u8]>,
        _eof: bool,
    ) -> Result<WriteOutcome, IcapError> {
        if let Some(chunk) = rbuf {
            if !chunk.is_empty() {
                data.body.push(chunk)?;
            }
        }

        let Some(wbuf) = wbuf else {
            return Ok(WriteOutcome::NotReady);
        };
        if !data.eof {
            // Decision pending; keep accumulating.
            return Ok(WriteOutcome::NotReady);
        }

        if data.blocked {
            let remaining = &data.error_page[data.error_sent..];
            if remaining.is_empty() {
                return Ok(WriteOutcome::Eof);
            }
            let n = remaining.len().min(wbuf.len());
            wbuf[..n].copy_from_slice(&remaining[..n]);
            data.error_sent += n;
            return Ok(WriteOutcome::Data(n));
        }

        if data.ott_rewritten {
            // The modified scan buffer is the replay source; the
            // passthrough store still holds the unrewritten original.
            let buf = data.body.scan_buf();
            if data.rewritten_sent >= buf.len() {
                return Ok(WriteOutcome::Eof);
            }
            let n = (buf.len() - data.rewritten_sent).min(wbuf.len());
            wbuf[..n].copy_from_slice(&buf[data.rewritten_sent..data.rewritten_sent + n]);
            data.rewritten_sent += n;
            return Ok(WriteOutcome::Data(n));
        }

        let n = data.body.store_mut().read(wbuf)?;
        if n == 0 {
            Ok(WriteOutcome::Eof)
        } else {
            Ok(WriteOutcome::Data(n))
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
