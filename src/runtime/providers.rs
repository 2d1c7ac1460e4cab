//! Provider Registry - locates backend executables and reports their versions.
//!
//! Resolution order per backend:
//!
//! ```text
//! externalDepsDir/
//! ├── claude/
//! │   └── install.json    # {"binPath": "bin/claude", "installedVersion": "2.0.14"}
//! └── codex/
//!     └── install.json
//! ```
//!
//! 1. `install.json` under the external dependency directory
//! 2. Program override environment variable
//! 3. First matching executable on `PATH`
//!
//! Resolutions are cached per backend until the next `initialize`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::api::types::{ApiError, BackendKind, ProviderSource, ProviderStatus, Providers};

const VERSION_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend installation metadata stored in `install.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallMetadata {
    /// Installed version string
    pub installed_version: Option<String>,
    /// Path to the backend executable, relative to the install directory
    pub bin_path: Option<String>,
}

/// A located backend executable.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProvider {
    pub program: PathBuf,
    pub version: Option<String>,
    pub source: ProviderSource,
}

impl ResolvedProvider {
    pub fn status(&self) -> ProviderStatus {
        ProviderStatus {
            available: true,
            version: self.version.clone(),
            source: Some(self.source),
        }
    }
}

/// Registry for locating backend executables.
pub struct ProviderRegistry {
    external_deps_dir: Mutex<Option<PathBuf>>,
    overrides: HashMap<BackendKind, PathBuf>,
    search_path: Option<std::ffi::OsString>,
    cache: Mutex<HashMap<BackendKind, Option<ResolvedProvider>>>,
}

impl ProviderRegistry {
    /// Create a registry.
    ///
    /// # Arguments
    ///
    /// * `overrides` - Explicit program paths per backend
    /// * `search_path` - `PATH`-style list searched last
    pub fn new(
        overrides: HashMap<BackendKind, PathBuf>,
        search_path: Option<std::ffi::OsString>,
    ) -> Self {
        Self {
            external_deps_dir: Mutex::new(None),
            overrides,
            search_path,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Record the dependency-override directory and drop every cached resolution.
    pub fn set_external_deps_dir(&self, dir: Option<PathBuf>) {
        log::info!("Provider registry reset: external_deps_dir={dir:?}");
        *self
            .external_deps_dir
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = dir;
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn external_deps_dir(&self) -> Option<PathBuf> {
        self.external_deps_dir
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Locate a backend, using the cache when possible. `None` when absent.
    pub async fn lookup(&self, kind: BackendKind) -> Option<ResolvedProvider> {
        if let Some(cached) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
        {
            return cached.clone();
        }

        let resolved = self.discover(kind).await;
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, resolved.clone());
        resolved
    }

    /// Locate a backend for a run.
    ///
    /// # Errors
    ///
    /// - `BackendNotFound` if no executable could be located
    pub async fn resolve(&self, kind: BackendKind) -> Result<ResolvedProvider, ApiError> {
        self.lookup(kind).await.ok_or_else(|| ApiError::BackendNotFound {
            backend: kind,
            message: format!(
                "'{}' was not found in the dependency directory, override or PATH",
                kind.program_name()
            ),
        })
    }

    /// Availability report for every backend. Never fails.
    pub async fn report(&self) -> Providers {
        let claude = self.lookup(BackendKind::Claude).await;
        let codex = self.lookup(BackendKind::Codex).await;
        Providers {
            claude: claude
                .map(|p| p.status())
                .unwrap_or_else(ProviderStatus::unavailable),
            codex: codex
                .map(|p| p.status())
                .unwrap_or_else(ProviderStatus::unavailable),
        }
    }

    async fn discover(&self, kind: BackendKind) -> Option<ResolvedProvider> {
        if let Some(deps_dir) = self.external_deps_dir() {
            let install_dir = deps_dir.join(kind.as_str());
            match read_install(&install_dir).await {
                Ok(Some((program, installed_version))) => {
                    let version = match installed_version {
                        Some(v) => Some(v),
                        None => query_version(&program).await,
                    };
                    log::debug!("Resolved provider: backend={kind}, source=external, path={program:?}");
                    return Some(ResolvedProvider {
                        program,
                        version,
                        source: ProviderSource::External,
                    });
                }
                Ok(None) => {}
                Err(e) => log::warn!("Ignoring external install for backend={kind}: {e}"),
            }
        }

        if let Some(program) = self.overrides.get(&kind) {
            if program.is_file() {
                log::debug!("Resolved provider: backend={kind}, source=override, path={program:?}");
                return Some(ResolvedProvider {
                    program: program.clone(),
                    version: query_version(program).await,
                    source: ProviderSource::Override,
                });
            }
            log::warn!("Program override for backend={kind} does not exist: {program:?}");
        }

        let program = find_on_path(kind.program_name(), self.search_path.as_deref())?;
        log::debug!("Resolved provider: backend={kind}, source=path, path={program:?}");
        Some(ResolvedProvider {
            version: query_version(&program).await,
            program,
            source: ProviderSource::Path,
        })
    }
}

/// Read `install.json` and resolve its binary inside `install_dir`.
///
/// `Ok(None)` when there is no install record.
async fn read_install(install_dir: &Path) -> Result<Option<(PathBuf, Option<String>)>, ApiError> {
    let metadata_path = install_dir.join("install.json");
    if !metadata_path.is_file() {
        return Ok(None);
    }

    let metadata_path_clone = metadata_path.clone();
    let metadata: InstallMetadata = tokio::task::spawn_blocking(move || {
        let content = std::fs::read_to_string(&metadata_path_clone)
            .map_err(|e| ApiError::io("Failed to read install.json", e))?;
        serde_json::from_str(&content).map_err(|e| ApiError::io("Failed to parse install.json", e))
    })
    .await
    .map_err(|e| ApiError::io("Failed to spawn blocking task", e))??;

    let Some(bin_path_str) = metadata.bin_path.filter(|p| !p.is_empty()) else {
        return Ok(None);
    };

    let bin_path_raw = PathBuf::from(&bin_path_str);
    let bin_path = if bin_path_raw.is_absolute() {
        bin_path_raw
    } else {
        install_dir.join(&bin_path_raw)
    };

    if !bin_path.exists() {
        log::warn!("install.json points at a missing binary: {bin_path_str}");
        return Ok(None);
    }

    let canonical_dir = install_dir
        .canonicalize()
        .map_err(|e| ApiError::io("Failed to canonicalize install dir", e))?;
    let canonical_bin = bin_path
        .canonicalize()
        .map_err(|e| ApiError::io("Failed to canonicalize binary path", e))?;

    // Symlinks and ".." must not lead outside the install directory
    if !canonical_bin.starts_with(&canonical_dir) {
        log::error!("Security violation: binPath '{bin_path_str}' resolves outside {install_dir:?}");
        return Err(ApiError::InvalidInput {
            message: "Backend binary path must be within its install directory".to_string(),
        });
    }

    if !canonical_bin.is_file() {
        return Err(ApiError::InvalidInput {
            message: "Backend binary must be a regular file".to_string(),
        });
    }

    Ok(Some((canonical_bin, metadata.installed_version)))
}

fn find_on_path(name: &str, search_path: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    let search_path = search_path?;
    std::env::split_paths(search_path)
        .flat_map(|dir| candidate_names(name).into_iter().map(move |n| dir.join(n)))
        .find(|candidate| is_executable(candidate))
}

#[cfg(windows)]
fn candidate_names(name: &str) -> Vec<String> {
    vec![format!("{name}.exe"), format!("{name}.cmd"), name.to_string()]
}

#[cfg(not(windows))]
fn candidate_names(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn version_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"\d+\.\d+\.\d+(?:-[0-9A-Za-z.\-]+)?").expect("version regex must compile")
    })
}

/// First semver-looking token in `--version` output.
pub fn parse_version(output: &str) -> Option<String> {
    version_regex().find(output).map(|m| m.as_str().to_string())
}

async fn query_version(program: &Path) -> Option<String> {
    let output = Command::new(program)
        .arg("--version")
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(VERSION_QUERY_TIMEOUT, output).await {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            parse_version(&stdout).or_else(|| parse_version(&String::from_utf8_lossy(&output.stderr)))
        }
        Ok(Err(e)) => {
            log::warn!("Version query failed for {program:?}: {e}");
            None
        }
        Err(_) => {
            log::warn!("Version query timed out for {program:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("2.0.14 (Claude Code)").as_deref(), Some("2.0.14"));
        assert_eq!(parse_version("codex-cli 0.46.0-alpha.3").as_deref(), Some("0.46.0-alpha.3"));
        assert_eq!(parse_version("no version here"), None);
    }

    #[tokio::test]
    async fn test_report_when_nothing_installed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProviderRegistry::new(HashMap::new(), Some(dir.path().as_os_str().to_owned()));

        let report = registry.report().await;

        assert_eq!(report.claude, ProviderStatus::unavailable());
        assert_eq!(report.codex, ProviderStatus::unavailable());
        assert!(matches!(
            registry.resolve(BackendKind::Codex).await,
            Err(ApiError::BackendNotFound { .. })
        ));
    }

    #[cfg(unix)]
    fn write_script(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_path_lookup_reads_version() {
        let dir = tempfile::tempdir().unwrap();
        write_script(&dir.path().join("codex"), "#!/bin/sh\necho 'codex-cli 0.50.1'\n");
        let registry = ProviderRegistry::new(HashMap::new(), Some(dir.path().as_os_str().to_owned()));

        let report = registry.report().await;

        assert!(report.codex.available);
        assert_eq!(report.codex.version.as_deref(), Some("0.50.1"));
        assert_eq!(report.codex.source, Some(ProviderSource::Path));
        assert!(!report.claude.available);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_install_wins_and_cache_resets() {
        let path_dir = tempfile::tempdir().unwrap();
        write_script(&path_dir.path().join("claude"), "#!/bin/sh\necho '1.0.0'\n");
        let registry = ProviderRegistry::new(HashMap::new(), Some(path_dir.path().as_os_str().to_owned()));

        assert_eq!(
            registry.lookup(BackendKind::Claude).await.unwrap().source,
            ProviderSource::Path
        );

        let deps = tempfile::tempdir().unwrap();
        write_script(&deps.path().join("claude/bin/claude"), "#!/bin/sh\necho '9.9.9'\n");
        std::fs::write(
            deps.path().join("claude/install.json"),
            r#"{"binPath": "bin/claude", "installedVersion": "2.1.0"}"#,
        )
        .unwrap();

        registry.set_external_deps_dir(Some(deps.path().to_path_buf()));
        let resolved = registry.lookup(BackendKind::Claude).await.unwrap();

        assert_eq!(resolved.source, ProviderSource::External);
        assert_eq!(resolved.version.as_deref(), Some("2.1.0"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_outside_directory_rejected() {
        let deps = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        write_script(&outside.path().join("evil"), "#!/bin/sh\n");
        std::fs::create_dir_all(deps.path().join("codex")).unwrap();
        std::fs::write(
            deps.path().join("codex/install.json"),
            format!(r#"{{"binPath": "{}"}}"#, outside.path().join("evil").display()),
        )
        .unwrap();

        let result = read_install(&deps.path().join("codex")).await;
        assert!(matches!(result, Err(ApiError::InvalidInput { .. })));
    }
}
