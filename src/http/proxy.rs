//! Proxy settings read from the environment

use crate::error::{Error, Result};
use reqwest::{ClientBuilder, NoProxy, Proxy};

/// Proxy routing for outbound requests
///
/// Reads `https_proxy` / `HTTPS_PROXY`, `http_proxy` / `HTTP_PROXY` and
/// `no_proxy` / `NO_PROXY`. Lowercase names win, matching curl.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy for `https://` targets
    pub https: Option<String>,
    /// Proxy for `http://` targets
    pub http: Option<String>,
    /// Comma-separated bypass list
    pub no_proxy: Option<String>,
}

impl ProxyConfig {
    /// Read proxy settings from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read proxy settings through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |lower: &str, upper: &str| {
            lookup(lower)
                .or_else(|| lookup(upper))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            https: read("https_proxy", "HTTPS_PROXY").map(|v| prepend_scheme(&v)),
            http: read("http_proxy", "HTTP_PROXY").map(|v| prepend_scheme(&v)),
            no_proxy: read("no_proxy", "NO_PROXY"),
        }
    }

    /// Whether any proxy is configured
    pub const fn is_enabled(&self) -> bool {
        self.https.is_some() || self.http.is_some()
    }

    /// Apply these settings to a client builder
    ///
    /// System proxy detection is disabled so only these settings apply.
    pub(crate) fn apply(&self, mut builder: ClientBuilder) -> Result<ClientBuilder> {
        builder = builder.no_proxy();
        if let Some(ref address) = self.https {
            let proxy = Proxy::https(address)
                .map_err(|e| Error::Config(format!("invalid HTTPS proxy '{address}': {e}")))?
                .no_proxy(self.bypass());
            builder = builder.proxy(proxy);
        }
        if let Some(ref address) = self.http {
            let proxy = Proxy::http(address)
                .map_err(|e| Error::Config(format!("invalid HTTP proxy '{address}': {e}")))?
                .no_proxy(self.bypass());
            builder = builder.proxy(proxy);
        }
        Ok(builder)
    }

    fn bypass(&self) -> Option<NoProxy> {
        self.no_proxy.as_deref().and_then(NoProxy::from_string)
    }
}

fn prepend_scheme(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_no_proxy_variables() {
        let config = ProxyConfig::from_lookup(lookup(&[]));
        assert!(!config.is_enabled());
        assert_eq!(config, ProxyConfig::default());
    }

    #[test]
    fn test_lowercase_wins() {
        let config = ProxyConfig::from_lookup(lookup(&[
            ("https_proxy", "http://lower:3128"),
            ("HTTPS_PROXY", "http://upper:3128"),
        ]));
        assert_eq!(config.https.as_deref(), Some("http://lower:3128"));
    }

    #[test]
    fn test_scheme_prepended_and_blank_ignored() {
        let config = ProxyConfig::from_lookup(lookup(&[
            ("HTTP_PROXY", "proxy.internal:8080"),
            ("https_proxy", "   "),
            ("NO_PROXY", "localhost,.corp"),
        ]));
        assert_eq!(config.http.as_deref(), Some("http://proxy.internal:8080"));
        assert!(config.https.is_none());
        assert_eq!(config.no_proxy.as_deref(), Some("localhost,.corp"));
        assert!(config.is_enabled());
    }

    #[test]
    fn test_apply_accepts_valid_proxy() {
        let config = ProxyConfig {
            https: Some("http://proxy:3128".into()),
            http: None,
            no_proxy: Some("localhost".into()),
        };
        let builder = config.apply(reqwest::Client::builder()).unwrap();
        assert!(builder.build().is_ok());
    }
}
