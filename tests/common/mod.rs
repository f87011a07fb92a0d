//! Shared test fixtures

#![allow(dead_code)]

mod mock_driver;

pub use mock_driver::{MergeCall, MockDriver};

use forge_driver::DriverConfig;
use forge_driver::http::ProxyConfig;
use forge_driver::merge::RetryPolicy;
use forge_driver::types::Provider;

/// Config pointing at a mock server, without a known API base
///
/// Proxy settings from the environment are ignored so requests reach the
/// server directly.
pub fn probe_config(provider: Provider, server_url: &str, repo_path: &str) -> DriverConfig {
    DriverConfig::new(provider, &format!("{server_url}{repo_path}"), "test-token")
        .unwrap()
        .with_proxy(ProxyConfig::default())
        .with_retry_policy(RetryPolicy::immediate(3))
}

/// Config pointing at a mock server with the API base given
pub fn server_config(
    provider: Provider,
    server_url: &str,
    repo_path: &str,
    api_path: &str,
) -> DriverConfig {
    probe_config(provider, server_url, repo_path)
        .with_api_base(&format!("{server_url}{api_path}"))
        .unwrap()
}
