//! Provider detection from repository URLs

use crate::types::Provider;
use url::Url;

/// Guess the provider from a repository URL's host
///
/// Recognises github.com, bitbucket.org and any host containing "gitlab"
/// (gitlab.com and the usual self-hosted naming). GitHub Enterprise hosts
/// containing "github" are recognised too. Returns `None` otherwise.
pub fn detect_provider(repository_url: &str) -> Option<Provider> {
    let url = Url::parse(repository_url.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();

    if host == "bitbucket.org" || host.ends_with(".bitbucket.org") {
        Some(Provider::Bitbucket)
    } else if host.contains("gitlab") {
        Some(Provider::GitLab)
    } else if host.contains("github") {
        Some(Provider::GitHub)
    } else {
        None
    }
}

/// Whether the host is the github.com SaaS (API at api.github.com)
pub(crate) fn is_github_dot_com(url: &Url) -> bool {
    matches!(url.host_str(), Some("github.com" | "www.github.com"))
}
