//! Token discovery for GitHub, GitLab and Bitbucket
//!
//! Supports an explicit token, environment variables and, for GitHub, the
//! `gh` CLI.

use crate::error::{Error, Result};
use crate::types::Provider;
use std::fmt;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Provider-neutral variable checked before the provider-specific ones
pub const GENERIC_TOKEN_VAR: &str = "REPO_TOKEN";

/// Source of authentication token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSource {
    /// Token passed in by the caller
    Explicit,
    /// Token from CLI tool (gh)
    Cli,
    /// Token from environment variable
    EnvVar,
}

/// A discovered token and where it came from
#[derive(Clone)]
pub struct AuthConfig {
    /// Access token
    pub token: String,
    /// Where the token was found
    pub source: AuthSource,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

/// Environment variables holding a token for the provider, in lookup order
pub const fn token_env_vars(provider: Provider) -> &'static [&'static str] {
    match provider {
        Provider::GitHub => &[GENERIC_TOKEN_VAR, "GITHUB_TOKEN", "GH_TOKEN"],
        Provider::GitLab => &[GENERIC_TOKEN_VAR, "GITLAB_TOKEN"],
        Provider::Bitbucket => &[GENERIC_TOKEN_VAR, "BITBUCKET_TOKEN"],
    }
}

/// Find a token without spawning processes
///
/// An explicit non-blank token wins; otherwise the provider's variables are
/// read through `lookup` in [`token_env_vars`] order. Blank values are
/// skipped.
pub fn token_from_lookup<F>(provider: Provider, explicit: Option<&str>, lookup: F) -> Option<AuthConfig>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(token) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
        return Some(AuthConfig {
            token: token.to_string(),
            source: AuthSource::Explicit,
        });
    }

    token_env_vars(provider).iter().find_map(|var| {
        let token = lookup(var)?;
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        debug!(var, "using token from environment");
        Some(AuthConfig {
            token: token.to_string(),
            source: AuthSource::EnvVar,
        })
    })
}

/// Resolve a token for the provider
///
/// Falls back to `gh auth token` for GitHub when neither an explicit token
/// nor an environment variable is set.
pub async fn resolve_token(provider: Provider, explicit: Option<&str>) -> Result<AuthConfig> {
    if let Some(auth) = token_from_lookup(provider, explicit, |var| std::env::var(var).ok()) {
        return Ok(auth);
    }

    if provider == Provider::GitHub
        && let Some(token) = gh_cli_token().await
    {
        debug!("using token from gh CLI");
        return Ok(AuthConfig {
            token,
            source: AuthSource::Cli,
        });
    }

    Err(Error::Config(format!(
        "no {provider} token found; set {}",
        token_env_vars(provider).join(" or ")
    )))
}

async fn gh_cli_token() -> Option<String> {
    let output = Command::new("gh")
        .args(["auth", "token"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let token = String::from_utf8(output.stdout).ok()?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_explicit_token_wins() {
        let auth = token_from_lookup(
            Provider::GitHub,
            Some("explicit"),
            env(&[("GITHUB_TOKEN", "from-env")]),
        )
        .unwrap();
        assert_eq!(auth.token, "explicit");
        assert_eq!(auth.source, AuthSource::Explicit);
    }

    #[test]
    fn test_generic_var_before_provider_var() {
        let auth = token_from_lookup(
            Provider::GitLab,
            None,
            env(&[("REPO_TOKEN", "generic"), ("GITLAB_TOKEN", "specific")]),
        )
        .unwrap();
        assert_eq!(auth.token, "generic");
        assert_eq!(auth.source, AuthSource::EnvVar);
    }

    #[test]
    fn test_blank_values_skipped() {
        let auth = token_from_lookup(
            Provider::GitHub,
            Some("  "),
            env(&[("REPO_TOKEN", ""), ("GITHUB_TOKEN", " "), ("GH_TOKEN", "gh-tok")]),
        )
        .unwrap();
        assert_eq!(auth.token, "gh-tok");
    }

    #[test]
    fn test_other_provider_vars_ignored() {
        assert!(
            token_from_lookup(Provider::Bitbucket, None, env(&[("GITHUB_TOKEN", "x")])).is_none()
        );
    }

    #[test]
    fn test_debug_redacts_token() {
        let auth = AuthConfig {
            token: "secret".into(),
            source: AuthSource::EnvVar,
        };
        assert!(!format!("{auth:?}").contains("secret"));
    }
}
