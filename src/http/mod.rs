//! Request client shared by all drivers
//!
//! Attaches provider credentials, routes through the configured proxy and
//! turns any status >= 300 into an [`Error`]. Redirects are not followed on
//! API calls, so a redirect surfaces as a failure.

mod proxy;

pub use proxy::ProxyConfig;
pub use reqwest::Method;

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::Form;
use reqwest::redirect::Policy;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Timeout for runner binary downloads
const DOWNLOAD_TIMEOUT_SECS: u64 = 600;

/// How credentials are attached to each request
#[derive(Clone)]
pub enum Auth {
    /// No credentials
    None,
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// `PRIVATE-TOKEN: <token>` (GitLab)
    PrivateToken(String),
    /// `Authorization: Basic base64(user:password)`
    Basic {
        /// User name
        user: String,
        /// Password or app password
        password: String,
    },
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::None => "None",
            Self::Bearer(_) => "Bearer",
            Self::PrivateToken(_) => "PrivateToken",
            Self::Basic { .. } => "Basic",
        };
        write!(f, "Auth::{kind}(<redacted>)")
    }
}

/// Request payload
#[derive(Debug)]
pub enum RequestBody {
    /// No body
    Empty,
    /// JSON document
    Json(serde_json::Value),
    /// `application/x-www-form-urlencoded` pairs
    Form(Vec<(String, String)>),
    /// `multipart/form-data`
    Multipart(Form),
}

impl RequestBody {
    /// Build a form body from borrowed pairs
    pub fn form<K: ToString, V: ToString>(pairs: &[(K, V)]) -> Self {
        Self::Form(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

/// Unparsed response, for endpoints with no JSON payload
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// HTTP status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Vec<u8>,
}

/// Authenticated HTTP client
#[derive(Debug, Clone)]
pub struct RequestClient {
    client: Client,
    download_client: Client,
    auth: Auth,
    headers: HeaderMap,
}

impl RequestClient {
    /// Create a client with the given credentials and proxy settings
    pub fn new(auth: Auth, proxy: &ProxyConfig) -> Result<Self> {
        let user_agent = concat!("forge-driver/", env!("CARGO_PKG_VERSION"));

        let client = proxy
            .apply(
                Client::builder()
                    .user_agent(user_agent)
                    .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
                    .redirect(Policy::none()),
            )?
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;

        let download_client = proxy
            .apply(
                Client::builder()
                    .user_agent(user_agent)
                    .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS)),
            )?
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            download_client,
            auth,
            headers: HeaderMap::new(),
        })
    }

    /// Add a header sent with every authenticated request
    #[must_use]
    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers
            .insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        self
    }

    /// Perform a request and decode the JSON response
    ///
    /// An empty body decodes as JSON `null`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: RequestBody,
    ) -> Result<T> {
        let response = self.send(method, url, body).await?;
        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::from_slice(b"null")?);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Perform a request and return the raw response envelope
    pub async fn request_raw(
        &self,
        method: Method,
        url: &str,
        body: RequestBody,
    ) -> Result<RawResponse> {
        let response = self.send(method, url, body).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }

    /// Fetch a file without credentials, following redirects
    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url, "downloading");
        let response = self.download_client.get(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn send(&self, method: Method, url: &str, body: RequestBody) -> Result<Response> {
        debug!(%method, url, "sending request");
        let mut builder = self
            .client
            .request(method, url)
            .headers(self.headers.clone());

        builder = match &self.auth {
            Auth::None => builder,
            Auth::Bearer(token) => builder.header(AUTHORIZATION, format!("Bearer {token}")),
            Auth::PrivateToken(token) => builder.header("PRIVATE-TOKEN", token),
            Auth::Basic { user, password } => builder.header(
                AUTHORIZATION,
                format!("Basic {}", STANDARD.encode(format!("{user}:{password}"))),
            ),
        };

        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Form(pairs) => builder.form(&pairs),
            RequestBody::Multipart(form) => builder.multipart(form),
        };

        check_status(builder.send().await?).await
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.as_u16() < 300 {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = extract_message(&text)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
    debug!(status = status.as_u16(), %message, "request failed");
    Err(Error::from_status(status.as_u16(), message))
}

/// Pull a human-readable message out of a provider error payload
fn extract_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
        return Some(trimmed.to_string());
    };
    let candidate = value
        .get("message")
        .or_else(|| value.get("error").and_then(|e| e.get("message")))
        .or_else(|| value.get("error"));
    match candidate {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
        None => Some(trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_message_shapes() {
        assert_eq!(
            extract_message(r#"{"message":"Bad credentials"}"#).as_deref(),
            Some("Bad credentials")
        );
        assert_eq!(
            extract_message(r#"{"error":{"message":"Repository not found"}}"#).as_deref(),
            Some("Repository not found")
        );
        assert_eq!(
            extract_message(r#"{"error":"invalid_token"}"#).as_deref(),
            Some("invalid_token")
        );
        assert_eq!(
            extract_message(r#"{"message":{"base":["already exists"]}}"#).as_deref(),
            Some(r#"{"base":["already exists"]}"#)
        );
        assert_eq!(extract_message("oops").as_deref(), Some("oops"));
        assert_eq!(extract_message("  "), None);
    }

    #[test]
    fn test_auth_debug_redacts() {
        let auth = Auth::Bearer("ghp_secret".into());
        assert_eq!(format!("{auth:?}"), "Auth::Bearer(<redacted>)");
    }

    #[tokio::test]
    async fn test_request_attaches_private_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v4/version")
            .match_header("PRIVATE-TOKEN", "glpat-123")
            .with_body(r#"{"version":"16.0.0"}"#)
            .create_async()
            .await;

        let client =
            RequestClient::new(Auth::PrivateToken("glpat-123".into()), &ProxyConfig::default())
                .unwrap();
        let value: serde_json::Value = client
            .request(
                Method::GET,
                &format!("{}/api/v4/version", server.url()),
                RequestBody::Empty,
            )
            .await
            .unwrap();

        assert_eq!(value["version"], "16.0.0");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_request_basic_auth_and_form_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/notes")
            .match_header("authorization", "Basic dXNlcjpwYXNz")
            .match_body(mockito::Matcher::UrlEncoded("body".into(), "hello".into()))
            .with_status(201)
            .with_body(r#"{"id":7}"#)
            .create_async()
            .await;

        let client = RequestClient::new(
            Auth::Basic {
                user: "user".into(),
                password: "pass".into(),
            },
            &ProxyConfig::default(),
        )
        .unwrap();
        let value: serde_json::Value = client
            .request(
                Method::POST,
                &format!("{}/notes", server.url()),
                RequestBody::form(&[("body", "hello")]),
            )
            .await
            .unwrap();

        assert_eq!(value["id"], 7);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_redirect_is_a_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/moved")
            .with_status(301)
            .with_header("location", "/elsewhere")
            .create_async()
            .await;

        let client = RequestClient::new(Auth::None, &ProxyConfig::default()).unwrap();
        let err = client
            .request_raw(Method::GET, &format!("{}/moved", server.url()), RequestBody::Empty)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Api { status: 301, .. }));
    }

    #[tokio::test]
    async fn test_status_maps_to_error_variants() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/private")
            .with_status(401)
            .with_body(r#"{"message":"401 Unauthorized"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/missing")
            .with_status(404)
            .with_body(r#"{"message":"404 Project Not Found"}"#)
            .create_async()
            .await;

        let client = RequestClient::new(Auth::None, &ProxyConfig::default()).unwrap();

        let err = client
            .request::<serde_json::Value>(
                Method::GET,
                &format!("{}/private", server.url()),
                RequestBody::Empty,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication { status: 401, .. }));

        let err = client
            .request::<serde_json::Value>(
                Method::GET,
                &format!("{}/missing", server.url()),
                RequestBody::Empty,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(ref m) if m == "404 Project Not Found"));
    }

    #[tokio::test]
    async fn test_raw_request_with_empty_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/runners/3")
            .with_status(204)
            .create_async()
            .await;

        let client = RequestClient::new(Auth::None, &ProxyConfig::default()).unwrap();
        let raw = client
            .request_raw(
                Method::DELETE,
                &format!("{}/runners/3", server.url()),
                RequestBody::Empty,
            )
            .await
            .unwrap();

        assert_eq!(raw.status, StatusCode::NO_CONTENT);
        assert!(raw.body.is_empty());
    }
}
