//! Worker configuration loaded from the environment.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use crate::api::types::BackendKind;
use crate::runtime::permissions::PERMISSION_TIMEOUT;

pub const ENV_LOG: &str = "AGENT_BRIDGE_LOG";
pub const ENV_BACKEND_REQUEST_TIMEOUT_MS: &str = "AGENT_BRIDGE_BACKEND_REQUEST_TIMEOUT_MS";
pub const ENV_PERMISSION_TIMEOUT_MS: &str = "AGENT_BRIDGE_PERMISSION_TIMEOUT_MS";
pub const ENV_CLAUDE_BIN: &str = "AGENT_BRIDGE_CLAUDE_BIN";
pub const ENV_CODEX_BIN: &str = "AGENT_BRIDGE_CODEX_BIN";
pub const ENV_CREDENTIAL_PATHS: &str = "AGENT_BRIDGE_CREDENTIAL_PATHS";

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_BACKEND_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Timeout of every request on the inner (backend) JSON-RPC link
    pub backend_request_timeout: Duration,
    /// Deadline of a permission request
    pub permission_timeout: Duration,
    /// Explicit program per backend
    pub program_overrides: HashMap<BackendKind, PathBuf>,
    /// Directories searched for pre-existing backend logins
    pub credential_paths: Vec<PathBuf>,
    /// `PATH` used for backend discovery
    pub search_path: Option<OsString>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backend_request_timeout: DEFAULT_BACKEND_REQUEST_TIMEOUT,
            permission_timeout: PERMISSION_TIMEOUT,
            program_overrides: HashMap::new(),
            credential_paths: Vec::new(),
            search_path: None,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Build from an arbitrary variable lookup. Invalid numbers fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let millis = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.to_str().and_then(|s| s.trim().parse::<u64>().ok()))
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or_else(|| {
                    if lookup(key).is_some() {
                        log::warn!("Ignoring invalid {key}; using {}ms", default.as_millis());
                    }
                    default
                })
        };

        let mut program_overrides = HashMap::new();
        for (kind, key) in [
            (BackendKind::Claude, ENV_CLAUDE_BIN),
            (BackendKind::Codex, ENV_CODEX_BIN),
        ] {
            if let Some(path) = lookup(key).filter(|v| !v.is_empty()) {
                program_overrides.insert(kind, PathBuf::from(path));
            }
        }

        let mut credential_paths: Vec<PathBuf> = lookup(ENV_CREDENTIAL_PATHS)
            .map(|v| std::env::split_paths(&v).filter(|p| !p.as_os_str().is_empty()).collect())
            .unwrap_or_default();
        if credential_paths.is_empty() {
            if let Some(home) = lookup("HOME").or_else(|| lookup("USERPROFILE")) {
                credential_paths.push(PathBuf::from(home));
            }
        }

        Self {
            backend_request_timeout: millis(
                ENV_BACKEND_REQUEST_TIMEOUT_MS,
                DEFAULT_BACKEND_REQUEST_TIMEOUT,
            ),
            permission_timeout: millis(ENV_PERMISSION_TIMEOUT_MS, PERMISSION_TIMEOUT),
            program_overrides,
            credential_paths,
            search_path: lookup("PATH"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let map: HashMap<String, OsString> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config.backend_request_timeout, Duration::from_secs(60));
        assert_eq!(config.permission_timeout, Duration::from_secs(300));
        assert!(config.program_overrides.is_empty());
        assert!(config.credential_paths.is_empty());
    }

    #[test]
    fn test_overrides_and_paths() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            (ENV_PERMISSION_TIMEOUT_MS, "1500"),
            (ENV_BACKEND_REQUEST_TIMEOUT_MS, "not-a-number"),
            (ENV_CODEX_BIN, "/opt/codex/bin/codex"),
            ("HOME", "/home/dev"),
        ]));

        assert_eq!(config.permission_timeout, Duration::from_millis(1500));
        assert_eq!(config.backend_request_timeout, Duration::from_secs(60));
        assert_eq!(
            config.program_overrides.get(&BackendKind::Codex),
            Some(&PathBuf::from("/opt/codex/bin/codex"))
        );
        assert_eq!(config.credential_paths, vec![PathBuf::from("/home/dev")]);
    }
}
