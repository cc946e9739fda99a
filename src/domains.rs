//! Dot-boundary domain matching and the built-in host lists.
//!
//! Allowlist entries beginning with `.` match either the bare domain
//! exactly or any host ending with the full dot-prefixed entry. The
//! leading dot enforces a label boundary, so `evil-slack.com` can never
//! satisfy an entry of `.slack.com`. Entries without a leading dot match
//! only the exact host. All comparisons are case-insensitive per DNS
//! conventions.

/// Destinations considered "known" for the new-domain policy. A host that
/// matches none of these is treated as a new domain and subjected to the
/// active security level.
const KNOWN_DOMAINS: &[&str] = &[
    ".api.anthropic.com",
    ".api.openai.com",
    ".api.github.com",
    ".github.com",
    ".amazonaws.com",
    ".api.telegram.org",
    ".discord.com",
    ".api.slack.com",
];

/// Package registries that fail open when the antivirus daemon is
/// unavailable. Large tarball downloads routinely outlive the scanner
/// deadline; these hosts are trusted enough to pass un-scanned rather
/// than break builds.
const KNOWN_PACKAGE_REGISTRIES: &[&str] = &[
    ".registry.npmjs.org",
    ".deb.nodesource.com",
    ".deb.debian.org",
    ".bun.sh",
    ".github.com",
    ".githubusercontent.com",
    ".pypi.org",
    ".files.pythonhosted.org",
    ".crates.io",
    ".static.crates.io",
    ".rubygems.org",
];

/// Check `host` against an allowlist with dot-boundary semantics.
pub fn matches_domain<S: AsRef<str>>(host: &str, entries: &[S]) -> bool {
    if host.is_empty() {
        return false;
    }

    for entry in entries {
        let entry = entry.as_ref();
        if entry.is_empty() {
            continue;
        }

        if let Some(bare) = entry.strip_prefix('.') {
            // Exact match against the bare domain.
            if host.eq_ignore_ascii_case(bare) {
                return true;
            }
            // Suffix match: the host must end with the full dot-prefixed
            // entry, which carries the boundary dot with it. Compared as
            // bytes; a host header is not guaranteed to be clean UTF-8
            // at arbitrary offsets.
            if host.len() > entry.len() {
                let suffix = &host.as_bytes()[host.len() - entry.len()..];
                if suffix.eq_ignore_ascii_case(entry.as_bytes()) {
                    return true;
                }
            }
        } else if host.eq_ignore_ascii_case(entry) {
            return true;
        }
    }

    false
}

/// Whether `host` is a known-good destination for policy purposes.
pub fn is_known_domain(host: &str) -> bool {
    matches_domain(host, KNOWN_DOMAINS)
}

/// Whether `host` is a known package registry (antivirus fail-open set).
pub fn is_known_package_registry(host: &str) -> bool {
    matches_domain(host, KNOWN_PACKAGE_REGISTRIES)
}

/// Split a comma-separated domain list from the environment into trimmed,
/// non-empty entries.
pub fn parse_domain_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &[&str] = &[".slack.com", ".api.telegram.org", "exact.example.com"];

    #[test]
    fn test_suffix_match_with_dot_boundary() {
        assert!(matches_domain("api.slack.com", LIST));
        assert!(matches_domain("files.api.slack.com", LIST));
        assert!(matches_domain("api.telegram.org", LIST));
    }

    #[test]
    fn test_bare_domain_exact_match() {
        assert!(matches_domain("slack.com", LIST));
    }

    #[test]
    fn test_substring_spoof_rejected() {
        assert!(!matches_domain("evil-slack.com", LIST));
        assert!(!matches_domain("notslack.com", LIST));
        assert!(!matches_domain("xslack.com", LIST));
        assert!(!matches_domain("slack.com.evil.net", LIST));
    }

    #[test]
    fn test_case_insensitive() {
        assert!(matches_domain("API.SLACK.COM", LIST));
        assert!(matches_domain("Slack.Com", LIST));
        assert!(matches_domain("EXACT.EXAMPLE.COM", LIST));
    }

    #[test]
    fn test_non_dot_entry_exact_only() {
        assert!(matches_domain("exact.example.com", LIST));
        assert!(!matches_domain("sub.exact.example.com", LIST));
    }

    #[test]
    fn test_empty_host_rejected() {
        assert!(!matches_domain("", LIST));
    }

    #[test]
    fn test_empty_entry_skipped() {
        let list = ["", ".ok.net"];
        assert!(matches_domain("api.ok.net", &list));
        assert!(!matches_domain("anything.else", &list));
    }

    #[test]
    fn test_known_domains() {
        assert!(is_known_domain("api.telegram.org"));
        assert!(is_known_domain("uploads.github.com"));
        assert!(is_known_domain("s3.amazonaws.com"));
        assert!(!is_known_domain("evil.example.com"));
        assert!(!is_known_domain(""));
    }

    #[test]
    fn test_known_package_registries() {
        assert!(is_known_package_registry("registry.npmjs.org"));
        assert!(is_known_package_registry("static.crates.io"));
        assert!(is_known_package_registry("files.pythonhosted.org"));
        assert!(!is_known_package_registry("registry.evil.io"));
    }

    #[test]
    fn test_parse_domain_list() {
        let parsed = parse_domain_list(" .slack.com , .api.telegram.org ,, ");
        assert_eq!(parsed, vec![".slack.com", ".api.telegram.org"]);
        assert!(parse_domain_list("").is_empty());
    }
}
