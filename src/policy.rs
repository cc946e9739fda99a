//! Security level policy, refreshed from the shared store.
//!
//! The level lives at `polis:config:security_level` and may be mutated
//! externally at any time. Rather than fetch per request, a counter under
//! the dlp-reader lock triggers a refresh every N requests; fetch failures
//! keep the last good level and back the interval off exponentially.

use std::sync::Mutex;

use tracing::{debug, warn};

use crate::store::{keys, StoreCoordinator};

/// Requests between store polls after a successful fetch.
const POLL_INTERVAL_INITIAL: u64 = 100;

/// Backoff ceiling for the poll interval.
const POLL_INTERVAL_MAX: u64 = 10_000;

/// How the proxy treats traffic to unknown destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    /// New domains pass.
    Relaxed,
    /// New domains are held for approval.
    Balanced,
    /// New domains are blocked outright.
    Strict,
}

/// Outcome of composing the level with the request facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Allow,
    /// Hold for human approval (blocked with a retrievable request id).
    Prompt,
    Block,
}

/// Compose the policy decision for one request.
///
/// A detected credential always prompts, at any level. Known domains
/// otherwise pass; new domains follow the level.
pub fn apply(level: SecurityLevel, known_domain: bool, has_credential: bool) -> PolicyAction {
    if has_credential {
        return PolicyAction::Prompt;
    }
    if known_domain {
        return PolicyAction::Allow;
    }
    match level {
        SecurityLevel::Relaxed => PolicyAction::Allow,
        SecurityLevel::Balanced => PolicyAction::Prompt,
        SecurityLevel::Strict => PolicyAction::Block,
    }
}

/// Map a raw store value to a level. The CLI stores the value JSON-quoted,
/// so one outer pair of double quotes is stripped first. Unknown or
/// missing values land on `Balanced`.
pub fn parse_level(raw: Option<&str>) -> SecurityLevel {
    let Some(raw) = raw else {
        return SecurityLevel::Balanced;
    };

    let stripped = if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        &raw[1..raw.len() - 1]
    } else {
        raw
    };

    if stripped.eq_ignore_ascii_case("relaxed") {
        SecurityLevel::Relaxed
    } else if stripped.eq_ignore_ascii_case("balanced") {
        SecurityLevel::Balanced
    } else if stripped.eq_ignore_ascii_case("strict") {
        SecurityLevel::Strict
    } else {
        warn!(value = stripped, "unknown security level, defaulting to balanced");
        SecurityLevel::Balanced
    }
}

struct PollState {
    level: SecurityLevel,
    counter: u64,
    interval: u64,
}

/// Periodic poller over the dlp-reader store identity.
pub struct PolicyPoller {
    store: StoreCoordinator,
    state: Mutex<PollState>,
}

impl PolicyPoller {
    pub fn new(store: StoreCoordinator) -> Self {
        Self {
            store,
            state: Mutex::new(PollState {
                level: SecurityLevel::Balanced,
                counter: 0,
                interval: POLL_INTERVAL_INITIAL,
            }),
        }
    }

    /// Snapshot the current level, refreshing it from the store when the
    /// request counter crosses the poll interval. The fetch happens inside
    /// the lock window, so every caller observes either the pre- or
    /// post-refresh value atomically.
    pub fn current_level(&self) -> SecurityLevel {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("policy state lock poisoned, failing closed to strict");
                return SecurityLevel::Strict;
            }
        };

        state.counter += 1;
        // The first request in a worker polls immediately so a freshly
        // forked process does not serve the compiled-in default for a
        // whole interval.
        if state.counter == 1 || state.counter % state.interval == 0 {
            self.refresh(&mut state);
        }
        state.level
    }

    fn refresh(&self, state: &mut PollState) {
        match self.store.with_conn(|c| c.get(keys::SECURITY_LEVEL)) {
            Ok(value) => {
                state.interval = POLL_INTERVAL_INITIAL;
                state.level = parse_level(value.as_deref());
                debug!(level = ?state.level, "security level refreshed");
            }
            Err(e) => {
                state.interval = (state.interval * 2).min(POLL_INTERVAL_MAX);
                warn!(
                    error = %e,
                    level = ?state.level,
                    next_poll = state.interval,
                    "security level poll failed, keeping last value"
                );
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
