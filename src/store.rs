//! Shared key/value store coordination.
//!
//! Three logical identities talk to the Valkey store, each over its own
//! connection behind its own mutex: `dlp-reader` (read-only, policy key),
//! `governance-reqmod` (token registration, host-approval lookup), and
//! `governance-respmod` (approval commit). The host framework pre-forks
//! worker processes, so connections are never built ahead of time: each
//! coordinator records the pid that created its connection and discards
//! anything inherited across a fork, connecting lazily on first use in
//! the worker.
//!
//! Every multi-command sequence runs inside a single mutex acquisition so
//! it observes a consistent view and never interleaves with another
//! thread on the same connection.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::config::Config;

/// Key names and builders for the shared store.
pub mod keys {
    pub const SECURITY_LEVEL: &str = "polis:config:security_level";
    pub const AUDIT_LOG: &str = "polis:log:events";

    pub fn ott(code: &str) -> String {
        format!("polis:ott:{code}")
    }

    pub fn ott_lock(request_id: &str) -> String {
        format!("polis:ott_lock:{request_id}")
    }

    pub fn blocked(request_id: &str) -> String {
        format!("polis:blocked:{request_id}")
    }

    pub fn approved(request_id: &str) -> String {
        format!("polis:approved:{request_id}")
    }

    pub fn approved_host(host: &str) -> String {
        format!("polis:approved:host:{host}")
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connect(String),
    #[error("store command failed: {0}")]
    Command(String),
    #[error("store mutex poisoned")]
    Poisoned,
}

/// The command subset the services need. Implemented by the Valkey client
/// and by the in-memory store the tests run against.
pub trait KvCommands: Send {
    fn ping(&mut self) -> Result<(), StoreError>;
    fn get(&mut self, key: &str) -> Result<Option<String>, StoreError>;
    /// SET key value NX EX ttl; returns whether the key was set.
    fn set_nx_ex(&mut self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, StoreError>;
    fn setex(&mut self, key: &str, ttl_secs: u64, value: &str) -> Result<(), StoreError>;
    fn exists(&mut self, key: &str) -> Result<bool, StoreError>;
    fn del(&mut self, key: &str) -> Result<(), StoreError>;
    fn zadd(&mut self, key: &str, score: f64, member: &str) -> Result<(), StoreError>;
}

/// Factory producing a fresh authenticated connection.
pub type Connector = Box<dyn Fn() -> Result<Box<dyn KvCommands>, StoreError> + Send + Sync>;

/// The three store identities and their credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreIdentity {
    DlpReader,
    GovReqmod,
    GovRespmod,
}

impl StoreIdentity {
    pub fn username(self) -> &'static str {
        match self {
            StoreIdentity::DlpReader => "dlp-reader",
            StoreIdentity::GovReqmod => "governance-reqmod",
            StoreIdentity::GovRespmod => "governance-respmod",
        }
    }

    pub fn secret_path(self) -> &'static str {
        match self {
            StoreIdentity::DlpReader => "/run/secrets/valkey_dlp_password",
            StoreIdentity::GovReqmod => "/run/secrets/valkey_reqmod_password",
            StoreIdentity::GovRespmod => "/run/secrets/valkey_respmod_password",
        }
    }
}

struct Slot {
    conn: Option<Box<dyn KvCommands>>,
    owner_pid: u32,
}

/// One store identity's connection, lazily established and serialised.
pub struct StoreCoordinator {
    identity: &'static str,
    connector: Connector,
    slot: Mutex<Slot>,
}

impl StoreCoordinator {
    pub fn new(identity: StoreIdentity, connector: Connector) -> Self {
        Self {
            identity: identity.username(),
            connector,
            slot: Mutex::new(Slot {
                conn: None,
                owner_pid: 0,
            }),
        }
    }

    /// Run `op` against a live connection, holding the identity's mutex
    /// for the whole call. Establishes or replaces the connection as
    /// needed: a pid mismatch (fork inheritance) or a failed liveness
    /// PING discards the cached connection before reconnecting.
    pub fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut dyn KvCommands) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut slot = self.slot.lock().map_err(|_| StoreError::Poisoned)?;

        let pid = std::process::id();
        if slot.owner_pid != pid && slot.conn.is_some() {
            debug!(
                identity = self.identity,
                "discarding connection inherited across fork"
            );
            slot.conn = None;
        }

        if let Some(conn) = slot.conn.as_deref_mut() {
            if conn.ping().is_err() {
                debug!(identity = self.identity, "connection stale, reconnecting");
                slot.conn = None;
            }
        }

        if slot.conn.is_none() {
            match (self.connector)() {
                Ok(conn) => {
                    slot.conn = Some(conn);
                    slot.owner_pid = pid;
                    debug!(identity = self.identity, "store connection established");
                }
                Err(e) => {
                    warn!(identity = self.identity, error = %e, "store unavailable");
                    return Err(e);
                }
            }
        }

        let conn = slot
            .conn
            .as_deref_mut()
            .ok_or_else(|| StoreError::Connect("no connection".into()))?;
        let result = op(conn);

        // A failed command leaves the connection in an unknown state;
        // drop it so the next caller reconnects.
        if matches!(result, Err(StoreError::Command(_))) {
            slot.conn = None;
        }
        result
    }
}

// ── Valkey client ───────────────────────────────────────────────

/// Connection parameters for one store identity.
#[derive(Debug, Clone)]
pub struct ValkeyConfig {
    pub host: String,
    pub port: u16,
    pub tls_ca: PathBuf,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub identity: StoreIdentity,
}

impl ValkeyConfig {
    pub fn from_config(cfg: &Config, identity: StoreIdentity) -> Self {
        Self {
            host: cfg.valkey_host.clone(),
            port: cfg.valkey_port,
            tls_ca: cfg.valkey_tls_ca.clone(),
            tls_cert: cfg.valkey_tls_cert.clone(),
            tls_key: cfg.valkey_tls_key.clone(),
            identity,
        }
    }
}

/// Build a connector that dials Valkey over mutual TLS and authenticates
/// as the configured identity.
pub fn valkey_connector(cfg: ValkeyConfig) -> Connector {
    Box::new(move || connect_valkey(&cfg))
}

struct ValkeyConn {
    conn: redis::Connection,
}

fn connect_valkey(cfg: &ValkeyConfig) -> Result<Box<dyn KvCommands>, StoreError> {
    let read_pem = |path: &Path| {
        fs::read(path)
            .map_err(|e| StoreError::Connect(format!("cannot read {}: {e}", path.display())))
    };
    let root_cert = read_pem(&cfg.tls_ca)?;
    let client_cert = read_pem(&cfg.tls_cert)?;
    let client_key = read_pem(&cfg.tls_key)?;

    let url = format!("rediss://{}:{}", cfg.host, cfg.port);
    let client = redis::Client::build_with_tls(
        url,
        redis::TlsCertificates {
            client_tls: Some(redis::ClientTlsConfig {
                client_cert,
                client_key,
            }),
            root_cert: Some(root_cert),
        },
    )
    .map_err(|e| StoreError::Connect(format!("tls setup failed: {e}")))?;

    let mut conn = client
        .get_connection()
        .map_err(|e| StoreError::Connect(format!("{}:{}: {e}", cfg.host, cfg.port)))?;

    let mut password = read_secret(Path::new(cfg.identity.secret_path()))?;
    let auth: Result<String, redis::RedisError> = redis::cmd("AUTH")
        .arg(cfg.identity.username())
        .arg(password.as_str())
        .query(&mut conn);
    password.zeroize();
    auth.map_err(|e| {
        StoreError::Connect(format!("auth as {} failed: {e}", cfg.identity.username()))
    })?;

    debug!(
        identity = cfg.identity.username(),
        host = %cfg.host,
        port = cfg.port,
        "connected to store (TLS + ACL)"
    );
    Ok(Box::new(ValkeyConn { conn }))
}

/// Read a one-line secret file; the trailing newline is stripped and the
/// raw buffer scrubbed.
fn read_secret(path: &Path) -> Result<String, StoreError> {
    let mut raw = fs::read_to_string(path)
        .map_err(|e| StoreError::Connect(format!("cannot read secret {}: {e}", path.display())))?;
    let end = raw.find('\n').unwrap_or(raw.len());
    let line = raw[..end].trim_end_matches('\r').to_string();
    raw.zeroize();
    Ok(line)
}

fn command_err(e: redis::RedisError) -> StoreError {
    StoreError::Command(e.to_string())
}

impl KvCommands for ValkeyConn {
    fn ping(&mut self) -> Result<(), StoreError> {
        redis::cmd("PING")
            .query::<String>(&mut self.conn)
            .map(|_| ())
            .map_err(command_err)
    }

    fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        redis::cmd("GET")
            .arg(key)
            .query(&mut self.conn)
            .map_err(command_err)
    }

    fn set_nx_ex(&mut self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query(&mut self.conn)
            .map_err(command_err)?;
        Ok(reply.is_some())
    }

    fn setex(&mut self, key: &str, ttl_secs: u64, value: &str) -> Result<(), StoreError> {
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query::<()>(&mut self.conn)
            .map_err(command_err)
    }

    fn exists(&mut self, key: &str) -> Result<bool, StoreError> {
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query(&mut self.conn)
            .map_err(command_err)?;
        Ok(count > 0)
    }

    fn del(&mut self, key: &str) -> Result<(), StoreError> {
        redis::cmd("DEL")
            .arg(key)
            .query::<i64>(&mut self.conn)
            .map(|_| ())
            .map_err(command_err)
    }

    fn zadd(&mut self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query::<i64>(&mut self.conn)
            .map(|_| ())
            .map_err(command_err)
    }
}

// ── Test support ────────────────────────────────────────────────


// ── Tests ───────────────────────────────────────────────────────
