//! Deterministic-mode guard for outbound calls.
//!
//! While enabled, skills must ask the guard before any network, subprocess
//! or other external call. Targets whose host is on an allowlist pass; all
//! others are refused and recorded.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use ledgerflow_types::config::GuardConfig;
use thiserror::Error;
use tracing::{debug, warn};

/// Environment variable that enables the process-wide guard.
pub const DETERMINISTIC_ENV: &str = "LEDGERFLOW_DETERMINISTIC";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("external {call_type} call to '{target}' blocked in deterministic mode")]
pub struct ExternalCallBlockedError {
    pub call_type: String,
    pub target: String,
}

/// A refused call, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedCall {
    pub call_type: String,
    pub target: String,
}

#[derive(Debug)]
pub struct ExternalCallGuard {
    enabled: bool,
    allowed_hosts: Vec<String>,
    blocked: Mutex<Vec<BlockedCall>>,
}

static GLOBAL_GUARD: OnceLock<Arc<ExternalCallGuard>> = OnceLock::new();

impl ExternalCallGuard {
    pub fn new(enabled: bool, allowed_hosts: Vec<String>) -> Self {
        Self {
            enabled,
            allowed_hosts,
            blocked: Mutex::new(Vec::new()),
        }
    }

    /// A guard that lets everything through.
    pub fn disabled() -> Self {
        Self::new(false, Vec::new())
    }

    /// Build from config, enabled iff `LEDGERFLOW_DETERMINISTIC` is truthy.
    pub fn from_env(config: &GuardConfig) -> Self {
        let enabled = std::env::var(DETERMINISTIC_ENV)
            .map(|v| is_truthy(&v))
            .unwrap_or(false);
        Self::new(enabled, config.allowed_hosts.clone())
    }

    /// Process-wide guard. The environment is read once, on first use.
    pub fn global() -> Arc<ExternalCallGuard> {
        GLOBAL_GUARD
            .get_or_init(|| {
                let guard = ExternalCallGuard::from_env(&GuardConfig::default());
                debug!(enabled = guard.enabled, "external call guard initialized");
                Arc::new(guard)
            })
            .clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn allowed_hosts(&self) -> &[String] {
        &self.allowed_hosts
    }

    /// Check one outbound call. `allowed_hosts` extends the guard's own
    /// allowlist for this call only.
    pub fn check_external_call_allowed(
        &self,
        call_type: &str,
        target: &str,
        allowed_hosts: &[String],
    ) -> Result<(), ExternalCallBlockedError> {
        if !self.enabled {
            return Ok(());
        }

        let host = host_of(target);
        let allowed = self
            .allowed_hosts
            .iter()
            .chain(allowed_hosts.iter())
            .any(|h| h.eq_ignore_ascii_case(host));
        if allowed {
            return Ok(());
        }

        warn!(call_type, target, "external call blocked");
        self.lock_blocked().push(BlockedCall {
            call_type: call_type.to_string(),
            target: target.to_string(),
        });
        Err(ExternalCallBlockedError {
            call_type: call_type.to_string(),
            target: target.to_string(),
        })
    }

    pub fn blocked_calls(&self) -> Vec<BlockedCall> {
        self.lock_blocked().clone()
    }

    pub fn clear_blocked_calls(&self) {
        self.lock_blocked().clear();
    }

    fn lock_blocked(&self) -> MutexGuard<'_, Vec<BlockedCall>> {
        self.blocked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Host portion of a URL-like target, or the target itself.
fn host_of(target: &str) -> &str {
    let rest = match target.find("://") {
        Some(i) => &target[i + 3..],
        None => target,
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    // Bracketed IPv6 literal, optionally with a port.
    if let Some(stripped) = authority.strip_prefix('[') {
        return stripped.split(']').next().unwrap_or(stripped);
    }
    // A bare IPv6 literal has more than one colon and no port.
    if authority.matches(':').count() > 1 {
        return authority;
    }
    authority.split(':').next().unwrap_or(authority)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_guard() -> ExternalCallGuard {
        ExternalCallGuard::new(true, GuardConfig::default().allowed_hosts)
    }

    #[test]
    fn disabled_guard_allows_everything() {
        let guard = ExternalCallGuard::disabled();
        assert!(
            guard
                .check_external_call_allowed("http", "https://example.com", &[])
                .is_ok()
        );
        assert!(guard.blocked_calls().is_empty());
    }

    #[test]
    fn localhost_allowed_when_enabled() {
        let guard = enabled_guard();
        assert!(
            guard
                .check_external_call_allowed("http", "http://localhost:8080/health", &[])
                .is_ok()
        );
        assert!(
            guard
                .check_external_call_allowed("http", "http://[::1]:9000/", &[])
                .is_ok()
        );
        assert!(
            guard
                .check_external_call_allowed("socket", "127.0.0.1", &[])
                .is_ok()
        );
    }

    #[test]
    fn remote_host_blocked_and_recorded() {
        let guard = enabled_guard();
        let err = guard
            .check_external_call_allowed("http", "https://api.example.com/v1", &[])
            .unwrap_err();
        assert_eq!(err.call_type, "http");
        assert_eq!(err.target, "https://api.example.com/v1");

        let blocked = guard.blocked_calls();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].target, "https://api.example.com/v1");

        guard.clear_blocked_calls();
        assert!(guard.blocked_calls().is_empty());
    }

    #[test]
    fn per_call_allowlist_extends_config() {
        let guard = enabled_guard();
        let extra = vec!["api.example.com".to_string()];
        assert!(
            guard
                .check_external_call_allowed("http", "https://user@api.example.com:443/x", &extra)
                .is_ok()
        );
    }

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://a.b.c/path?q=1"), "a.b.c");
        assert_eq!(host_of("a.b.c:80"), "a.b.c");
        assert_eq!(host_of("ssh://git@host.io"), "host.io");
        assert_eq!(host_of("::1"), "::1");
        assert_eq!(host_of("/usr/bin/env"), "");
    }

    #[test]
    fn truthy_values() {
        assert!(is_truthy("1"));
        assert!(is_truthy(" TRUE "));
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
    }
}
