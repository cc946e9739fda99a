//! Audit event log in the shared store.
//!
//! Events append to the `polis:log:events` sorted set, scored by epoch
//! seconds, as self-contained JSON objects. Only pattern names, key
//! names, and token metadata are recorded, never credential values.

use serde_json::json;

use crate::store::{keys, KvCommands, StoreError};

/// Event emitted when a request identifier is swapped for a token.
pub fn ott_rewrite_event(
    request_id: &str,
    ott_code: &str,
    origin_host: &str,
    timestamp: i64,
) -> String {
    json!({
        "event": "ott_rewrite",
        "request_id": request_id,
        "ott_code": ott_code,
        "origin_host": origin_host,
        "timestamp": timestamp,
    })
    .to_string()
}

/// Event emitted by a successful approval commit. The blocked record is
/// an opaque string from the store: embedded raw when it already looks
/// like a JSON object (first byte `{`), otherwise wrapped as an escaped
/// string so a malformed record cannot corrupt the log.
pub fn approved_event(
    request_id: &str,
    ott_code: &str,
    origin_host: &str,
    timestamp: i64,
    blocked_record: &str,
) -> String {
    let embedded = if blocked_record.starts_with('{') {
        blocked_record.to_string()
    } else {
        json!(blocked_record).to_string()
    };
    format!(
        "{{\"event\":\"approved_via_proxy\",\
         \"request_id\":{},\
         \"ott_code\":{},\
         \"origin_host\":{},\
         \"timestamp\":{},\
         \"blocked_request\":{}}}",
        json!(request_id),
        json!(ott_code),
        json!(origin_host),
        timestamp,
        embedded,
    )
}

/// Append one event to the time-ordered log.
pub fn append(conn: &mut dyn KvCommands, timestamp: i64, event_json: &str) -> Result<(), StoreError> {
    conn.zadd(keys::AUDIT_LOG, timestamp as f64, event_json)
}

// ── Tests ───────────────────────────────────────────────────────
