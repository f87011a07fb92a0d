//! API base discovery for self-hosted instances
//!
//! A self-hosted GitLab or GitHub Enterprise may be mounted under any
//! sub-path, so every path prefix of the repository URL is probed for a
//! version endpoint.

use crate::error::{Error, Result};
use crate::http::{Method, RequestBody, RequestClient};
use futures::future::join_all;
use serde_json::Value;
use tracing::debug;
use url::Url;

/// Where to find a provider's version endpoint below a candidate root
#[derive(Debug, Clone, Copy)]
pub struct ApiProbe {
    /// Versioned API path appended to the root (`api/v4`)
    pub api_path: &'static str,
    /// Endpoint below the API path answering with version info (`version`)
    pub probe_path: &'static str,
    /// Recognises a valid version payload
    pub is_valid: fn(&Value) -> bool,
}

/// GitLab: `GET <root>/api/v4/version` answers `{"version": "..."}`
pub const GITLAB_PROBE: ApiProbe = ApiProbe {
    api_path: "api/v4",
    probe_path: "version",
    is_valid: |v| v.get("version").is_some_and(Value::is_string),
};

/// GitHub Enterprise: `GET <root>/api/v3/meta` carries `installed_version`
pub const GITHUB_ENTERPRISE_PROBE: ApiProbe = ApiProbe {
    api_path: "api/v3",
    probe_path: "meta",
    is_valid: |v| v.get("installed_version").is_some_and(Value::is_string),
};

/// Candidate roots for a repository URL, shallowest first
///
/// `https://host/a/b/repo` yields `https://host`, `https://host/a`,
/// `https://host/a/b`. The full path is never a candidate.
pub fn candidate_roots(repository: &Url) -> Vec<String> {
    let origin = repository.origin().ascii_serialization();
    let segments: Vec<&str> = repository
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    (0..segments.len())
        .map(|depth| {
            if depth == 0 {
                origin.clone()
            } else {
                format!("{origin}/{}", segments[..depth].join("/"))
            }
        })
        .collect()
}

/// Resolve the API base URL (`<root>/<api_path>`) for a repository
///
/// All candidates are probed concurrently. The shallowest candidate with a
/// valid payload wins; if none answer, the first candidate's failure is
/// reported as [`Error::Resolution`].
pub async fn resolve_base(
    client: &RequestClient,
    repository: &Url,
    probe: &ApiProbe,
) -> Result<Url> {
    let roots = candidate_roots(repository);
    if roots.is_empty() {
        return Err(Error::Resolution {
            url: repository.to_string(),
            reason: "invalid repository address".to_string(),
        });
    }
    debug!(repository = %repository, candidates = roots.len(), "probing API base");

    let probes = roots.iter().map(|root| async move {
        let base = format!("{root}/{}", probe.api_path);
        let url = format!("{base}/{}", probe.probe_path);
        let payload: Value = client.request(Method::GET, &url, RequestBody::Empty).await?;
        if (probe.is_valid)(&payload) {
            Ok(base)
        } else {
            Err(Error::Api {
                status: 200,
                message: format!("unrecognised version payload at {url}"),
            })
        }
    });
    let outcomes = join_all(probes).await;

    let mut first_error = None;
    for outcome in outcomes {
        match outcome {
            Ok(base) => {
                debug!(base, "resolved API base");
                return Ok(Url::parse(&base)?);
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    Err(Error::Resolution {
        url: repository.to_string(),
        reason: first_error.map_or_else(|| "no candidates".to_string(), |e| e.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Auth, ProxyConfig};

    #[test]
    fn test_candidate_roots_nested() {
        let url = Url::parse("https://example.com/gitlab/group/project").unwrap();
        assert_eq!(
            candidate_roots(&url),
            vec![
                "https://example.com",
                "https://example.com/gitlab",
                "https://example.com/gitlab/group",
            ]
        );
    }

    #[test]
    fn test_candidate_roots_keeps_port() {
        let url = Url::parse("http://127.0.0.1:8080/a/b").unwrap();
        assert_eq!(
            candidate_roots(&url),
            vec!["http://127.0.0.1:8080", "http://127.0.0.1:8080/a"]
        );
    }

    #[test]
    fn test_candidate_roots_empty_path() {
        let url = Url::parse("https://example.com/").unwrap();
        assert!(candidate_roots(&url).is_empty());
    }

    #[test]
    fn test_probe_payload_recognition() {
        assert!((GITLAB_PROBE.is_valid)(&serde_json::json!({"version": "16.1.0"})));
        assert!(!(GITLAB_PROBE.is_valid)(&serde_json::json!({"message": "hi"})));
        assert!(!(GITLAB_PROBE.is_valid)(&Value::Null));
        assert!((GITHUB_ENTERPRISE_PROBE.is_valid)(
            &serde_json::json!({"installed_version": "3.10.0"})
        ));
    }

    #[tokio::test]
    async fn test_resolve_fails_immediately_without_candidates() {
        let client = RequestClient::new(Auth::None, &ProxyConfig::default()).unwrap();
        let url = Url::parse("https://example.invalid/").unwrap();
        let err = resolve_base(&client, &url, &GITLAB_PROBE).await.unwrap_err();
        assert!(matches!(err, Error::Resolution { ref reason, .. } if reason == "invalid repository address"));
    }
}
