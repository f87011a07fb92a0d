//! Driver configuration

use crate::error::{Error, Result};
use crate::http::ProxyConfig;
use crate::merge::RetryPolicy;
use crate::platform::detect_provider;
use crate::types::{Provider, RepositoryRef};
use std::time::Duration;
use url::Url;

/// Everything needed to build a driver
///
/// Validated on construction, before any network call: the token must be
/// non-empty and the repository URL absolute.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Provider backing the repository
    pub provider: Provider,
    /// Repository URL and token
    pub repository: RepositoryRef,
    /// Known API base; skips discovery when set
    pub api_base: Option<Url>,
    /// Proxy settings
    pub proxy: ProxyConfig,
    /// Retry schedule for auto-merge
    pub retry: RetryPolicy,
    /// Override for the runner download URL
    pub runner_download_url: Option<String>,
    /// Delay between status polls while waiting on a cancelled pipeline
    pub poll_interval: Duration,
}

impl DriverConfig {
    /// Configuration for an explicit provider
    ///
    /// Proxy settings are read from the environment.
    pub fn new(provider: Provider, repository_url: &str, token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            provider,
            repository: RepositoryRef::new(repository_url, token)?,
            api_base: None,
            proxy: ProxyConfig::from_env(),
            retry: RetryPolicy::default(),
            runner_download_url: None,
            poll_interval: Duration::from_secs(5),
        })
    }

    /// Configuration with the provider detected from the repository host
    pub fn detect(repository_url: &str, token: impl Into<String>) -> Result<Self> {
        let provider = detect_provider(repository_url).ok_or_else(|| {
            Error::Config(format!(
                "cannot detect provider for '{repository_url}'; set it explicitly"
            ))
        })?;
        Self::new(provider, repository_url, token)
    }

    /// Use a known API base instead of discovering it
    pub fn with_api_base(mut self, api_base: &str) -> Result<Self> {
        let url = Url::parse(api_base.trim_end_matches('/'))
            .map_err(|e| Error::Config(format!("invalid API base '{api_base}': {e}")))?;
        self.api_base = Some(url);
        Ok(self)
    }

    /// Replace the proxy settings
    #[must_use]
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = proxy;
        self
    }

    /// Replace the auto-merge retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Download the runner from a different URL
    #[must_use]
    pub fn with_runner_download_url(mut self, url: impl Into<String>) -> Self {
        self.runner_download_url = Some(url.into());
        self
    }

    /// Change the pipeline status poll interval
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_provider_from_url() {
        let config = DriverConfig::detect("https://gitlab.com/group/project", "glpat").unwrap();
        assert_eq!(config.provider, Provider::GitLab);
        assert!(config.api_base.is_none());
    }

    #[test]
    fn test_detect_unknown_host_fails() {
        let err = DriverConfig::detect("https://git.example.com/a/b", "t").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_empty_token_rejected_before_network() {
        assert!(DriverConfig::new(Provider::GitHub, "https://github.com/o/r", "").is_err());
    }

    #[test]
    fn test_api_base_trailing_slash_trimmed() {
        let config = DriverConfig::new(Provider::GitLab, "https://example.com/g/p", "t")
            .unwrap()
            .with_api_base("https://example.com/gitlab/api/v4/")
            .unwrap();
        assert_eq!(
            config.api_base.unwrap().as_str(),
            "https://example.com/gitlab/api/v4"
        );
    }
}
