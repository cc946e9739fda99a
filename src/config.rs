//! Service configuration from the environment.

use std::path::PathBuf;

use anyhow::Result;
use tracing::warn;

use crate::domains::parse_domain_list;

/// Default pattern catalog location.
pub const DEFAULT_PATTERN_CATALOG: &str = "/etc/c-icap/polis_dlp.conf";

/// Default delay before a freshly issued token becomes consumable.
pub const DEFAULT_TIME_GATE_SECS: i64 = 15;

#[derive(Debug, Clone)]
pub struct Config {
    /// Messaging domains whose responses are scanned for approval tokens
    /// (dot-prefixed entries, see the domain matcher).
    pub approval_domains: Vec<String>,

    /// Seconds from token issuance until it may be consumed.
    pub time_gate_secs: i64,

    /// Antivirus daemon TCP endpoint.
    pub clamd_host: String,
    pub clamd_port: u16,

    /// Antivirus daemon Unix socket; set overrides TCP.
    pub clamd_socket: Option<PathBuf>,

    /// Key/value store endpoint.
    pub valkey_host: String,
    pub valkey_port: u16,

    /// Mutual-TLS material for the store session.
    pub valkey_tls_ca: PathBuf,
    pub valkey_tls_cert: PathBuf,
    pub valkey_tls_key: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            approval_domains: vec![".api.telegram.org".into()],
            time_gate_secs: DEFAULT_TIME_GATE_SECS,
            clamd_host: "scanner".into(),
            clamd_port: 3310,
            clamd_socket: None,
            valkey_host: "state".into(),
            valkey_port: 6379,
            valkey_tls_ca: "/etc/valkey/tls/ca.crt".into(),
            valkey_tls_cert: "/etc/valkey/tls/client.crt".into(),
            valkey_tls_key: "/etc/valkey/tls/client.key".into(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_lookup(|name| std::env::var(name).ok()))
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();

        let approval_domains = match get("POLIS_APPROVAL_DOMAINS") {
            Some(raw) => {
                let parsed = parse_domain_list(&raw);
                if parsed.is_empty() {
                    defaults.approval_domains.clone()
                } else {
                    parsed
                }
            }
            None => defaults.approval_domains.clone(),
        };

        let time_gate_secs = match get("POLIS_APPROVAL_TIME_GATE_SECS") {
            Some(raw) => match raw.parse::<i64>() {
                Ok(v) if v > 0 => v,
                _ => {
                    warn!(
                        value = %raw,
                        default = DEFAULT_TIME_GATE_SECS,
                        "invalid POLIS_APPROVAL_TIME_GATE_SECS, using default"
                    );
                    DEFAULT_TIME_GATE_SECS
                }
            },
            None => DEFAULT_TIME_GATE_SECS,
        };

        let clamd_port = get("POLIS_CLAMD_PORT")
            .and_then(|raw| raw.parse::<u16>().ok())
            .filter(|&p| p != 0)
            .unwrap_or(defaults.clamd_port);

        let valkey_port = get("VALKEY_PORT")
            .and_then(|raw| raw.parse::<u16>().ok())
            .filter(|&p| p != 0)
            .unwrap_or(defaults.valkey_port);

        Self {
            approval_domains,
            time_gate_secs,
            clamd_host: get("POLIS_CLAMD_HOST")
                .filter(|h| !h.is_empty())
                .unwrap_or(defaults.clamd_host),
            clamd_port,
            clamd_socket: get("POLIS_CLAMD_SOCKET")
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            valkey_host: get("VALKEY_HOST")
                .filter(|h| !h.is_empty())
                .unwrap_or(defaults.valkey_host),
            valkey_port,
            valkey_tls_ca: get("VALKEY_TLS_CA")
                .map(PathBuf::from)
                .unwrap_or(defaults.valkey_tls_ca),
            valkey_tls_cert: get("VALKEY_TLS_CERT")
                .map(PathBuf::from)
                .unwrap_or(defaults.valkey_tls_cert),
            valkey_tls_key: get("VALKEY_TLS_KEY")
                .map(PathBuf::from)
                .unwrap_or(defaults.valkey_tls_key),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
