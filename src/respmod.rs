//! RESPMOD service `polis_sentinel_resp` - antivirus plus approval commit.
//!
//! Every inbound response body is scanned against the antivirus daemon.
//! Responses from the allowlisted messaging domains are then searched for
//! one-time tokens; each hit runs the approval commit, releasing the
//! blocked request it maps to, and the token bytes are masked before the
//! body reaches the client.

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::audit;
use crate::body::{BodyAccumulator, RESPMOD_SCAN_CAP};
use crate::clamav::{ClamdClient, ClamdEndpoint, ScanVerdict};
use crate::config::Config;
use crate::domains;
use crate::gzip;
use crate::icap::{
    IcapError, IcapRequest, IcapService, IcapVector, ModVerdict, PreviewVerdict,
    SynthesizedResponse, WriteOutcome,
};
use crate::store::{
    keys, valkey_connector, StoreCoordinator, StoreIdentity, ValkeyConfig,
};

pub const SERVICE_NAME: &str = "polis_sentinel_resp";

/// TTL of the per-request and host-scoped approval keys.
const APPROVAL_TTL_SECS: u64 = 300;

pub struct RespmodService {
    approval_domains: Vec<String>,
    clamd: ClamdClient,
    store: StoreCoordinator,
    ott_re: regex::bytes::Regex,
}

pub struct RespmodData {
    body: BodyAccumulator,
    host: String,
    is_gzip: bool,
    virus_found: bool,
    virus_name: String,
    error_page: Vec<u8>,
    error_sent: usize,
    eof: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApprovalOutcome {
    Approved,
    Skipped,
    Error,
}

/// The stored token mapping. All three consumed fields are required;
/// a record missing any of them is malformed and commits nothing.
#[derive(Deserialize)]
struct OttMapping {
    request_id: String,
    armed_after: i64,
    origin_host: String,
}

impl RespmodService {
    pub fn new(
        approval_domains: Vec<String>,
        clamd: ClamdClient,
        store: StoreCoordinator,
    ) -> anyhow::Result<Self> {
        let ott_re = regex::bytes::Regex::new(r"ott-[A-Za-z0-9]{8}")
            .context("failed to compile token regex")?;
        Ok(Self {
            approval_domains,
            clamd,
            store,
            ott_re,
        })
    }

    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        Self::new(
            cfg.approval_domains.clone(),
            ClamdClient::new(ClamdEndpoint::from_config(cfg)),
            StoreCoordinator::new(
                StoreIdentity::GovRespmod,
                valkey_connector(ValkeyConfig::from_config(cfg, StoreIdentity::GovRespmod)),
            ),
        )
    }

    fn synthesize_virus_block(&self, data: &mut RespmodData, req: &mut IcapRequest, threat: &str) {
        data.virus_found = true;
        data.virus_name = threat.to_string();
        let body = format!(
            "<!DOCTYPE html>\n<html><head><title>Virus Detected</title></head>\n\
             <body>\n<h1>403 Forbidden - Virus Detected</h1>\n\
             <p>The requested content was blocked by antivirus scanning.</p>\n\
             <p>Threat: {threat}</p>\n</body></html>\n"
        );
        data.error_page = body.into_bytes();
        req.synthesized = Some(
            SynthesizedResponse::new("HTTP/1.1 403 Forbidden")
                .header("Content-Type", "text/html")
                .header("Connection", "close")
                .header("Content-Length", data.error_page.len().to_string()),
        );
        info!(
            threat = %data.virus_name,
            host = %data.host,
            "response blocked, virus detected"
        );
    }

    fn synthesize_scanner_unavailable(&self, data: &mut RespmodData, req: &mut IcapRequest) {
        data.virus_found = true;
        let body = "<!DOCTYPE html>\n\
             <html><head><title>Scanner Unavailable</title></head>\n\
             <body>\n<h1>403 Forbidden - Scanner Unavailable</h1>\n\
             <p>The antivirus scanner is temporarily unavailable.</p>\n\
             <p>Please try again later.</p>\n</body></html>\n";
        data.error_page = body.as_bytes().to_vec();
        req.synthesized = Some(
            SynthesizedResponse::new("HTTP/1.1 403 Forbidden")
                .header("Content-Type", "text/html")
                .header("Connection", "close")
                .header("Content-Length", data.error_page.len().to_string()),
        );
    }

    /// The approval commit. Ordered so that a crash at any point loses no
    /// audit data: the log entry is written before any destructive step,
    /// and the token key is deleted last so earlier failures leave it
    /// usable for retry.
    fn process_approval(&self, code: &str, resp_host: &str, now: i64) -> ApprovalOutcome {
        let result = self.store.with_conn(|conn| {
            let Some(raw) = conn.get(&keys::ott(code))? else {
                debug!(code, "token unknown or expired");
                return Ok(ApprovalOutcome::Skipped);
            };

            let mapping: OttMapping = match serde_json::from_str(&raw) {
                Ok(m) => m,
                Err(e) => {
                    warn!(code, error = %e, "malformed token mapping");
                    return Ok(ApprovalOutcome::Error);
                }
            };

            // Time gate: a channel that echoes the sent message reflects
            // the token back instantly; it must not self-approve.
            if now < mapping.armed_after {
                debug!(
                    code,
                    now,
                    armed_after = mapping.armed_after,
                    "time gate not elapsed, ignoring"
                );
                return Ok(ApprovalOutcome::Skipped);
            }

            // Context binding: the response must come from the channel
            // the token was issued through.
            if !resp_host.eq_ignore_ascii_case(&mapping.origin_host) {
                warn!(
                    code,
                    resp_host,
                    origin_host = %mapping.origin_host,
                    "context binding failed, rejecting cross-channel token"
                );
                return Ok(ApprovalOutcome::Skipped);
            }

            let blocked_key = keys::blocked(&mapping.request_id);
            if !conn.exists(&blocked_key)? {
                debug!(
                    request_id = %mapping.request_id,
                    "blocked record gone, token stale or already processed"
                );
                return Ok(ApprovalOutcome::Skipped);
            }

            let record = match conn.get(&blocked_key)? {
                Some(r) if !r.is_empty() => r,
                _ => {
                    warn!(
                        request_id = %mapping.request_id,
                        "blocked record empty, auditing placeholder"
                    );
                    "{}".to_string()
                }
            };
            let dest_host = destination_host(&record);

            audit::append(
                conn,
                now,
                &audit::approved_event(&mapping.request_id, code, &mapping.origin_host, now, &record),
            )?;

            conn.del(&blocked_key)?;
            conn.setex(&keys::approved(&mapping.request_id), APPROVAL_TTL_SECS, "approved")?;

            let approval_host = dest_host.unwrap_or_else(|| mapping.origin_host.clone());
            if let Err(e) = conn.setex(
                &keys::approved_host(&approval_host),
                APPROVAL_TTL_SECS,
                "approved",
            ) {
                // Per-request approval still stands.
                warn!(error = %e, host = %approval_host, "host approval key write failed");
            }

            if let Err(e) = conn.del(&keys::ott(code)) {
                warn!(error = %e, "token delete failed, TTL will reap it");
            }

            info!(
                request_id = %mapping.request_id,
                origin_host = %mapping.origin_host,
                "approval committed"
            );
            Ok(ApprovalOutcome::Approved)
        });

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(code, error = %e, "approval aborted, store operation failed");
                ApprovalOutcome::Error
            }
        }
    }
}

/// Pull the host out of the blocked record's `destination` URL: skip the
/// scheme, cut at the first slash or port colon.
fn destination_host(record: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(record).ok()?;
    let url = value.get("destination")?.as_str()?;
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let host = rest.split(['/', ':']).next().unwrap_or("");
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

fn extract_host(req: &IcapRequest) -> String {
    req.response_headers
        .as_ref()
        .and_then(|h| h.get("Host"))
        .or_else(|| req.request_headers.get("Host"))
        .unwrap_or_default()
        .to_string()
}

fn detect_gzip(req: &IcapRequest) -> bool {
    req.response_headers
        .as_ref()
        .and_then(|h| h.get("Content-Encoding"))
        .map(|v| v.contains("gzip"))
        .unwrap_or(false)
}

impl IcapService for RespmodService {
    type Data = RespmodData;

    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn vector(&self) -> IcapVector {
        IcapVector::Respmod
    }

    fn init_request_data(&self, _req: &IcapRequest) -> RespmodData {
        RespmodData {
            body: BodyAccumulator::new(RESPMOD_SCAN_CAP),
            host: String::new(),
            is_gzip: false,
            virus_found: false,
            virus_name: String::new(),
            error_page: Vec::new(),
            error_sent: 0,
            eof: false,
        }
    }

    fn check_preview(
        &self,
        data: &mut RespmodData,
        req: &mut IcapRequest,
        _preview: &[u8],
    ) -> PreviewVerdict {
        data.host = extract_host(req);
        data.is_gzip = detect_gzip(req);
        debug!(host = %data.host, gzip = data.is_gzip, "response preview");
        PreviewVerdict::Continue
    }

    fn end_of_data(&self, data: &mut RespmodData, req: &mut IcapRequest) -> ModVerdict {
        data.eof = true;

        if data.body.total_len() == 0 {
            debug!("no body, passing through");
            return ModVerdict::Allow204;
        }

        // The host may skip the preview callback entirely; recover the
        // header facts here.
        if data.host.is_empty() {
            data.host = extract_host(req);
            debug!(host = %data.host, "fallback host extraction");
        }
        if !data.is_gzip {
            data.is_gzip = detect_gzip(req);
        }

        // Antivirus first, for every response regardless of domain.
        match self.clamd.scan(data.body.scan_buf()) {
            Ok(ScanVerdict::Infected(threat)) => {
                self.synthesize_virus_block(data, req, &threat);
                return ModVerdict::Done;
            }
            Err(e) => {
                if domains::is_known_package_registry(&data.host) {
                    warn!(
                        host = %data.host,
                        error = %e,
                        "scan failed for known package registry, failing open"
                    );
                } else {
                    warn!(error = %e, "scan failed, failing closed");
                    self.synthesize_scanner_unavailable(data, req);
                    return ModVerdict::Done;
                }
            }
            Ok(ScanVerdict::Clean) => {}
        }

        // Only allowlisted messaging channels carry approval tokens.
        if !domains::matches_domain(&data.host, &self.approval_domains) {
            debug!(host = %data.host, "host not in approval allowlist, passing through");
            return ModVerdict::Allow204;
        }

        let (mut scan_body, was_decompressed) = if data.is_gzip {
            match gzip::inflate_guarded(data.body.scan_buf()) {
                Ok(plain) => (plain, true),
                Err(e) if e.is_bomb() => {
                    warn!(error = %e, "skipping token scan, passing original body");
                    return ModVerdict::Allow204;
                }
                Err(e) => {
                    warn!(error = %e, "decompression failed, passing original body");
                    return ModVerdict::Allow204;
                }
            }
        } else {
            (data.body.scan_buf().to_vec(), false)
        };

        let now = chrono::Utc::now().timestamp();
        let found: Vec<(std::ops::Range<usize>, String)> = self
            .ott_re
            .find_iter(&scan_body)
            .map(|m| (m.range(), String::from_utf8_lossy(m.as_bytes()).into_owned()))
            .collect();

        let mut commits = 0usize;
        for (range, code) in &found {
            match self.process_approval(code, &data.host, now) {
                ApprovalOutcome::Approved => commits += 1,
                ApprovalOutcome::Skipped => debug!(code = %code, "token not consumed"),
                ApprovalOutcome::Error => warn!(code = %code, "token processing failed"),
            }
            // The token must never reach the client.
            scan_body[range.clone()].fill(b'*');
        }

        if !found.is_empty() {
            debug!(found = found.len(), commits, "token scan complete");
        }

        if commits == 0 {
            // Nothing consumed: the original body passes unmodified.
            return ModVerdict::Allow204;
        }

        if was_decompressed {
            match gzip::deflate(&scan_body) {
                Ok(packed) => data.body.store_mut().replace(packed),
                Err(e) => {
                    warn!(error = %e, "recompression failed, passing original body");
                    return ModVerdict::Done;
                }
            }
        } else {
            data.body.store_mut().replace(scan_body);
        }
        ModVerdict::Done
    }

    fn service_io(
        &self,
        data: &mut RespmodData,
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
            return Ok(WriteOutcome::NotReady);
        }

        if data.virus_found {
            let remaining = &data.error_page[data.error_sent..];
            if remaining.is_empty() {
                return Ok(WriteOutcome::Eof);
            }
            let n = remaining.len().min(wbuf.len());
            wbuf[..n].copy_from_slice(&remaining[..n]);
            data.error_sent += n;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clamav::testing::{dead_port, mock_clamd};
    use crate::icap::HeaderMap;
    use crate::store::testing::MemoryStore;
    use serde_json::json;

    const OTT: &str = "ott-ABCDEFGH";
    const RID: &str = "req-12345678";

    fn service(store: &MemoryStore, clamd_port: u16, domains: &[&str]) -> RespmodService {
        RespmodService::new(
            domains.iter().map(|d| d.to_string()).collect(),
            ClamdClient::new(ClamdEndpoint::Tcp {
                host: "127.0.0.1".into(),
                port: clamd_port,
            }),
            StoreCoordinator::new(StoreIdentity::GovRespmod, store.connector()),
        )
        .unwrap()
    }

    fn response_from(host: &str, gzip: bool) -> IcapRequest {
        let mut resp_headers = HeaderMap::from_pairs([("Host", host)]);
        if gzip {
            resp_headers.insert("Content-Encoding", "gzip");
        }
        IcapRequest::respmod(HeaderMap::from_pairs([("Host", host)]), resp_headers)
    }

    fn run(
        svc: &RespmodService,
        req: &mut IcapRequest,
        body: &[u8],
    ) -> (RespmodData, ModVerdict, Vec<u8>) {
        let mut data = svc.init_request_data(req);
        svc.check_preview(&mut data, req, &body[..body.len().min(4096)]);
        svc.service_io(&mut data, Some(body), None, true).unwrap();
        let verdict = svc.end_of_data(&mut data, req);
        let out = drain_output(svc, &mut data);
        (data, verdict, out)
    }

    fn drain_output(svc: &RespmodService, data: &mut RespmodData) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 113];
        loop {
            match svc
                .service_io(data, None, Some(chunk.as_mut_slice()), true)
                .unwrap()
            {
                WriteOutcome::Data(n) => out.extend_from_slice(&chunk[..n]),
                WriteOutcome::Eof => break,
                WriteOutcome::NotReady => panic!("io not ready after end_of_data"),
            }
        }
        out
    }

    fn seed_mapping(store: &MemoryStore, armed_after: i64, origin_host: &str) {
        store.seed(
            &keys::ott(OTT),
            &json!({
                "ott_code": OTT,
                "request_id": RID,
                "armed_after": armed_after,
                "origin_host": origin_host,
            })
            .to_string(),
        );
        store.seed(
            &keys::blocked(RID),
            "{\"destination\":\"https://httpbin.org/post\"}",
        );
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    // ── Approval commit ─────────────────────────────────────────

    #[test]
    fn test_approval_commit_masks_token_and_releases_block() {
        let store = MemoryStore::new();
        seed_mapping(&store, now() - 1, "api.telegram.org");
        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org"]);

        let body = format!("{{\"text\":\"{OTT}\"}}");
        let mut req = response_from("api.telegram.org", false);
        let (_, verdict, out) = run(&svc, &mut req, body.as_bytes());

        assert_eq!(verdict, ModVerdict::Done);
        assert_eq!(out.len(), body.len());
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains(OTT));
        assert!(text.contains("************"));

        // Store transitions: token and blocked record consumed, both
        // approval keys set for five minutes.
        assert!(!store.contains(&keys::ott(OTT)));
        assert!(!store.contains(&keys::blocked(RID)));
        let approved = store.entry(&keys::approved(RID)).unwrap();
        assert_eq!(approved.value, "approved");
        assert_eq!(approved.ttl, Some(300));
        let host_approved = store.entry(&keys::approved_host("httpbin.org")).unwrap();
        assert_eq!(host_approved.ttl, Some(300));

        let events = store.zset_members(keys::AUDIT_LOG);
        assert_eq!(events.len(), 1);
        let event: serde_json::Value = serde_json::from_str(&events[0]).unwrap();
        assert_eq!(event["event"], "approved_via_proxy");
        assert_eq!(event["request_id"], RID);
        assert_eq!(event["blocked_request"]["destination"], "https://httpbin.org/post");
    }

    #[test]
    fn test_approval_commit_through_gzip_roundtrip() {
        let store = MemoryStore::new();
        seed_mapping(&store, now() - 1, "api.telegram.org");
        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org"]);

        let plain = format!("{{\"ok\":true,\"result\":{{\"text\":\"{OTT}\"}}}}");
        let packed = gzip::deflate(plain.as_bytes()).unwrap();
        let mut req = response_from("api.telegram.org", true);
        let (_, verdict, out) = run(&svc, &mut req, &packed);

        assert_eq!(verdict, ModVerdict::Done);
        let unpacked = gzip::inflate_guarded(&out).unwrap();
        let text = String::from_utf8(unpacked).unwrap();
        assert!(!text.contains(OTT));
        assert!(text.contains("************"));
        assert_eq!(text.len(), plain.len());
        assert!(!store.contains(&keys::ott(OTT)));
    }

    #[test]
    fn test_time_gate_rejects_early_token() {
        let store = MemoryStore::new();
        seed_mapping(&store, now() + 10, "api.telegram.org");
        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org"]);

        let body = format!("{{\"text\":\"{OTT}\"}}");
        let mut req = response_from("api.telegram.org", false);
        let (_, verdict, out) = run(&svc, &mut req, body.as_bytes());

        // Nothing consumed: the original body is delivered untouched and
        // the token stays armed for a later, slower echo.
        assert_eq!(verdict, ModVerdict::Allow204);
        assert_eq!(out, body.as_bytes());
        assert!(store.contains(&keys::ott(OTT)));
        assert!(store.contains(&keys::blocked(RID)));
        assert!(!store.contains(&keys::approved(RID)));
    }

    #[test]
    fn test_time_gate_equality_permits() {
        let store = MemoryStore::new();
        // Armed at this very second: the gate is strictly
        // now < armed_after, so equality already permits.
        seed_mapping(&store, now(), "api.telegram.org");
        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org"]);

        let body = format!("x {OTT} y");
        let mut req = response_from("api.telegram.org", false);
        let (_, verdict, _) = run(&svc, &mut req, body.as_bytes());
        assert_eq!(verdict, ModVerdict::Done);
        assert!(!store.contains(&keys::ott(OTT)));
    }

    #[test]
    fn test_cross_channel_replay_rejected() {
        let store = MemoryStore::new();
        seed_mapping(&store, now() - 1, "api.telegram.org");
        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org", ".api.slack.com"]);

        let body = format!("{{\"text\":\"{OTT}\"}}");
        let mut req = response_from("api.slack.com", false);
        let (_, verdict, out) = run(&svc, &mut req, body.as_bytes());

        assert_eq!(verdict, ModVerdict::Allow204);
        assert_eq!(out, body.as_bytes());
        assert!(store.contains(&keys::ott(OTT)));
        assert!(store.contains(&keys::blocked(RID)));
    }

    #[test]
    fn test_origin_host_comparison_ignores_case() {
        let store = MemoryStore::new();
        seed_mapping(&store, now() - 1, "API.TELEGRAM.ORG");
        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org"]);

        let body = format!("{OTT}");
        let mut req = response_from("api.telegram.org", false);
        let (_, verdict, _) = run(&svc, &mut req, body.as_bytes());
        assert_eq!(verdict, ModVerdict::Done);
        assert!(!store.contains(&keys::ott(OTT)));
    }

    #[test]
    fn test_second_presentation_skips() {
        let store = MemoryStore::new();
        seed_mapping(&store, now() - 1, "api.telegram.org");
        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org"]);

        let body = format!("{{\"text\":\"{OTT}\"}}");
        let mut req1 = response_from("api.telegram.org", false);
        let (_, v1, _) = run(&svc, &mut req1, body.as_bytes());
        assert_eq!(v1, ModVerdict::Done);

        // Token and blocked record are gone; the replay consumes nothing
        // and the body passes unmodified.
        let mut req2 = response_from("api.telegram.org", false);
        let (_, v2, out2) = run(&svc, &mut req2, body.as_bytes());
        assert_eq!(v2, ModVerdict::Allow204);
        assert_eq!(out2, body.as_bytes());
    }

    #[test]
    fn test_malformed_mapping_commits_nothing() {
        let store = MemoryStore::new();
        store.seed(&keys::ott(OTT), "{\"request_id\":\"req-12345678\"}");
        store.seed(&keys::blocked(RID), "{}");
        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org"]);

        let body = format!("{OTT}");
        let mut req = response_from("api.telegram.org", false);
        let (_, verdict, _) = run(&svc, &mut req, body.as_bytes());

        assert_eq!(verdict, ModVerdict::Allow204);
        assert!(store.contains(&keys::ott(OTT)));
        assert!(store.contains(&keys::blocked(RID)));
        assert!(store.zset_members(keys::AUDIT_LOG).is_empty());
    }

    #[test]
    fn test_missing_blocked_record_skips() {
        let store = MemoryStore::new();
        seed_mapping(&store, now() - 1, "api.telegram.org");
        // Simulate TTL expiry of the blocked record.
        let mut conn = store.clone();
        use crate::store::KvCommands;
        conn.del(&keys::blocked(RID)).unwrap();

        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org"]);
        let body = format!("{OTT}");
        let mut req = response_from("api.telegram.org", false);
        let (_, verdict, _) = run(&svc, &mut req, body.as_bytes());

        assert_eq!(verdict, ModVerdict::Allow204);
        assert!(store.contains(&keys::ott(OTT)));
        assert!(!store.contains(&keys::approved(RID)));
    }

    #[test]
    fn test_audit_failure_aborts_commit() {
        let store = MemoryStore::new();
        seed_mapping(&store, now() - 1, "api.telegram.org");
        store.set_fail_zadd(true);
        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org"]);

        let body = format!("{OTT}");
        let mut req = response_from("api.telegram.org", false);
        let (_, verdict, _) = run(&svc, &mut req, body.as_bytes());

        // No audit record, no destruction: blocked and token keys stay,
        // the token remains usable for retry.
        assert_eq!(verdict, ModVerdict::Allow204);
        assert!(store.contains(&keys::ott(OTT)));
        assert!(store.contains(&keys::blocked(RID)));
        assert!(!store.contains(&keys::approved(RID)));
    }

    #[test]
    fn test_host_approval_falls_back_to_origin() {
        let store = MemoryStore::new();
        seed_mapping(&store, now() - 1, "api.telegram.org");
        store.seed(&keys::blocked(RID), "no destination field here");
        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org"]);

        let body = format!("{OTT}");
        let mut req = response_from("api.telegram.org", false);
        let (_, verdict, _) = run(&svc, &mut req, body.as_bytes());

        assert_eq!(verdict, ModVerdict::Done);
        assert!(store.contains(&keys::approved_host("api.telegram.org")));
        // The non-JSON record is embedded as a quoted string.
        let events = store.zset_members(keys::AUDIT_LOG);
        let event: serde_json::Value = serde_json::from_str(&events[0]).unwrap();
        assert_eq!(event["blocked_request"], "no destination field here");
    }

    // ── Antivirus gate ──────────────────────────────────────────

    #[test]
    fn test_virus_found_blocks_with_threat_name() {
        let store = MemoryStore::new();
        let port = mock_clamd(b"stream: Eicar-Signature FOUND\0");
        let svc = service(&store, port, &[".api.telegram.org"]);

        let mut req = response_from("downloads.example.com", false);
        let (data, verdict, out) = run(&svc, &mut req, b"suspicious payload");

        assert_eq!(verdict, ModVerdict::Done);
        assert!(data.virus_found);
        assert!(data.virus_name.contains("Eicar-Signature"));
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Virus Detected"));
        assert!(text.contains("Eicar-Signature"));
        assert_eq!(
            req.synthesized.unwrap().status_line,
            "HTTP/1.1 403 Forbidden"
        );
    }

    #[test]
    fn test_scanner_down_fails_closed() {
        let store = MemoryStore::new();
        let svc = service(&store, dead_port(), &[".api.telegram.org"]);

        let mut req = response_from("downloads.example.com", false);
        let (_, verdict, out) = run(&svc, &mut req, b"payload");

        assert_eq!(verdict, ModVerdict::Done);
        assert!(String::from_utf8(out).unwrap().contains("Scanner Unavailable"));
    }

    #[test]
    fn test_scanner_down_fails_open_for_package_registry() {
        let store = MemoryStore::new();
        let svc = service(&store, dead_port(), &[".api.telegram.org"]);

        let body: &[u8] = b"tarball bytes";
        let mut req = response_from("registry.npmjs.org", false);
        let (_, verdict, out) = run(&svc, &mut req, body);

        assert_eq!(verdict, ModVerdict::Allow204);
        assert!(req.synthesized.is_none());
        assert_eq!(out, body);
    }

    #[test]
    fn test_clean_scan_outside_allowlist_passes_through() {
        let store = MemoryStore::new();
        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org"]);

        let body = format!("{{\"text\":\"{OTT}\"}}");
        let mut req = response_from("api.example.net", false);
        let (_, verdict, out) = run(&svc, &mut req, body.as_bytes());

        // Not a messaging channel: the token scan never runs.
        assert_eq!(verdict, ModVerdict::Allow204);
        assert_eq!(out, body.as_bytes());
        assert!(store.zset_members(keys::AUDIT_LOG).is_empty());
    }

    #[test]
    fn test_empty_body_passes_without_scan() {
        let store = MemoryStore::new();
        // A dead scanner proves no scan is attempted for empty bodies.
        let svc = service(&store, dead_port(), &[".api.telegram.org"]);

        let mut req = response_from("api.telegram.org", false);
        let (_, verdict, _) = run(&svc, &mut req, b"");
        assert_eq!(verdict, ModVerdict::Allow204);
        assert!(req.synthesized.is_none());
    }

    // ── Decompression defenses ──────────────────────────────────

    #[test]
    fn test_decompression_bomb_passes_original() {
        let store = MemoryStore::new();
        seed_mapping(&store, now() - 1, "api.telegram.org");
        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org"]);

        // Highly repetitive content trips the 100:1 ratio cap.
        let plain = vec![b'A'; 2 * 1024 * 1024];
        let packed = gzip::deflate(&plain).unwrap();
        let mut req = response_from("api.telegram.org", true);
        let (_, verdict, out) = run(&svc, &mut req, &packed);

        assert_eq!(verdict, ModVerdict::Allow204);
        assert_eq!(out, packed);
        assert!(store.contains(&keys::ott(OTT)));
    }

    #[test]
    fn test_corrupt_gzip_passes_original() {
        let store = MemoryStore::new();
        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org"]);

        let body: &[u8] = b"not actually gzip";
        let mut req = response_from("api.telegram.org", true);
        let (_, verdict, out) = run(&svc, &mut req, body);

        assert_eq!(verdict, ModVerdict::Allow204);
        assert_eq!(out, body);
    }

    // ── Header extraction ───────────────────────────────────────

    #[test]
    fn test_no_preview_mode_recovers_headers() {
        let store = MemoryStore::new();
        seed_mapping(&store, now() - 1, "api.telegram.org");
        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org"]);

        // The preview callback never runs; end_of_data must recover the
        // host and the encoding on its own.
        let plain = format!("{{\"text\":\"{OTT}\"}}");
        let packed = gzip::deflate(plain.as_bytes()).unwrap();
        let mut req = response_from("api.telegram.org", true);
        let mut data = svc.init_request_data(&req);
        svc.service_io(&mut data, Some(&packed), None, true).unwrap();
        let verdict = svc.end_of_data(&mut data, &mut req);

        assert_eq!(verdict, ModVerdict::Done);
        assert!(!store.contains(&keys::ott(OTT)));
    }

    #[test]
    fn test_host_falls_back_to_request_headers() {
        let store = MemoryStore::new();
        seed_mapping(&store, now() - 1, "api.telegram.org");
        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org"]);

        let mut req = IcapRequest::respmod(
            HeaderMap::from_pairs([("Host", "api.telegram.org")]),
            HeaderMap::new(),
        );
        let body = format!("{OTT}");
        let (data, verdict, _) = run(&svc, &mut req, body.as_bytes());

        assert_eq!(data.host, "api.telegram.org");
        assert_eq!(verdict, ModVerdict::Done);
    }

    #[test]
    fn test_multiple_tokens_one_valid() {
        let store = MemoryStore::new();
        seed_mapping(&store, now() - 1, "api.telegram.org");
        let port = mock_clamd(b"stream: OK\0");
        let svc = service(&store, port, &[".api.telegram.org"]);

        // One registered token, one unknown: both are masked in the
        // delivered body because a commit rewrote it.
        let body = format!("{OTT} and ott-ZZZZzzzz");
        let mut req = response_from("api.telegram.org", false);
        let (_, verdict, out) = run(&svc, &mut req, body.as_bytes());

        assert_eq!(verdict, ModVerdict::Done);
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("ott-"));
        assert_eq!(text.matches("************").count(), 2);
    }
}
