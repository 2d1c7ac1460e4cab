//! Backend environment contract.
//!
//! With an explicit credential the backend gets an API key (and optional base
//! URL) and every implicit-login variable is removed. Without one, the backend
//! is pointed at the first pre-existing login directory found on the
//! credential search paths.

use std::path::{Path, PathBuf};

use crate::api::types::{preview_secret, BackendKind};
use crate::protocols::backend::RunRequest;

/// Variables removed whenever an explicit credential is supplied
pub const IMPLICIT_LOGIN_VARS: [&str; 3] = ["CLAUDE_CODE_OAUTH_TOKEN", "CLAUDE_CONFIG_DIR", "CODEX_HOME"];

/// Environment changes applied to one backend process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendEnv {
    pub set: Vec<(String, String)>,
    pub remove: Vec<String>,
}

struct EnvNames {
    api_key: &'static str,
    base_url: &'static str,
    config_dir: &'static str,
    login_dir: &'static str,
}

fn names(kind: BackendKind) -> EnvNames {
    match kind {
        BackendKind::Claude => EnvNames {
            api_key: "ANTHROPIC_API_KEY",
            base_url: "ANTHROPIC_BASE_URL",
            config_dir: "CLAUDE_CONFIG_DIR",
            login_dir: ".claude",
        },
        BackendKind::Codex => EnvNames {
            api_key: "OPENAI_API_KEY",
            base_url: "OPENAI_BASE_URL",
            config_dir: "CODEX_HOME",
            login_dir: ".codex",
        },
    }
}

/// Build the environment for `kind` serving `request`.
pub fn backend_env(kind: BackendKind, request: &RunRequest, credential_paths: &[PathBuf]) -> BackendEnv {
    let names = names(kind);
    let mut env = BackendEnv::default();

    if let Some(credential) = request.explicit_credential() {
        env.remove = IMPLICIT_LOGIN_VARS.iter().map(|v| v.to_string()).collect();
        env.set
            .push((names.api_key.to_string(), credential.expose().to_string()));
        if let Some(base_url) = &request.base_url {
            env.set.push((names.base_url.to_string(), base_url.clone()));
        }
        log::info!(
            "Backend env: backend={kind}, mode=explicit, credential={}, base_url={}",
            preview_secret(Some(credential.expose())),
            preview_secret(request.base_url.as_deref())
        );
        return env;
    }

    match find_login_dir(credential_paths, names.login_dir) {
        Some(dir) => {
            log::info!(
                "Backend env: backend={kind}, mode=implicit, {}={}",
                names.config_dir,
                dir.display()
            );
            env.set
                .push((names.config_dir.to_string(), dir.to_string_lossy().into_owned()));
        }
        None => log::info!("Backend env: backend={kind}, mode=implicit, login_dir=none"),
    }
    env
}

fn find_login_dir(search_paths: &[PathBuf], login_dir: &str) -> Option<PathBuf> {
    search_paths
        .iter()
        .map(|base| base.join(login_dir))
        .find(|candidate| is_dir(candidate))
}

fn is_dir(path: &Path) -> bool {
    path.metadata().map(|m| m.is_dir()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::Credential;

    fn request(credential: Option<&str>, base_url: Option<&str>) -> RunRequest {
        RunRequest {
            run_id: "r1".to_string(),
            prompt: "hi".to_string(),
            cwd: PathBuf::from("/tmp"),
            credential: credential.map(Credential::new),
            base_url: base_url.map(str::to_string),
            model: None,
            permission_mode: None,
            dangerously_skip_permissions: false,
            sandbox_mode: None,
            approval_policy: None,
            resume_handle: None,
        }
    }

    #[test]
    fn test_explicit_credential_disables_implicit_login() {
        let env = backend_env(
            BackendKind::Claude,
            &request(Some("sk-ant-1"), Some("https://proxy.example")),
            &[],
        );

        assert!(env
            .set
            .contains(&("ANTHROPIC_API_KEY".to_string(), "sk-ant-1".to_string())));
        assert!(env
            .set
            .contains(&("ANTHROPIC_BASE_URL".to_string(), "https://proxy.example".to_string())));
        assert!(env.remove.contains(&"CLAUDE_CODE_OAUTH_TOKEN".to_string()));
        assert!(env.remove.contains(&"CODEX_HOME".to_string()));
    }

    #[test]
    fn test_blank_credential_is_implicit() {
        let env = backend_env(BackendKind::Codex, &request(Some("  "), None), &[]);
        assert!(env.remove.is_empty());
        assert!(env.set.is_empty());
    }

    #[test]
    fn test_implicit_uses_first_existing_login_dir() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::create_dir(second.path().join(".codex")).unwrap();

        let env = backend_env(
            BackendKind::Codex,
            &request(None, None),
            &[first.path().to_path_buf(), second.path().to_path_buf()],
        );

        assert_eq!(
            env.set,
            vec![(
                "CODEX_HOME".to_string(),
                second.path().join(".codex").to_string_lossy().into_owned()
            )]
        );
    }
}
