//! Core types for forge-driver

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Git-hosting provider backing a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// GitHub or GitHub Enterprise Server
    GitHub,
    /// GitLab.com or self-hosted GitLab
    GitLab,
    /// Bitbucket Cloud
    Bitbucket,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GitHub => write!(f, "GitHub"),
            Self::GitLab => write!(f, "GitLab"),
            Self::Bitbucket => write!(f, "Bitbucket"),
        }
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(Self::GitHub),
            "gitlab" => Ok(Self::GitLab),
            "bitbucket" => Ok(Self::Bitbucket),
            other => Err(Error::Config(format!("unknown provider '{other}'"))),
        }
    }
}

/// Repository URL plus the token used against it
///
/// Immutable once built; the token is redacted from `Debug` output.
#[derive(Clone)]
pub struct RepositoryRef {
    url: Url,
    token: String,
}

impl RepositoryRef {
    /// Validate and build a repository reference
    ///
    /// The token must be non-empty and the URL an absolute http(s) URL.
    pub fn new(url: &str, token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(Error::Config("repository token must not be empty".into()));
        }
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(Error::Config("repository URL must not be empty".into()));
        }
        let mut url = Url::parse(trimmed)
            .map_err(|e| Error::Config(format!("invalid repository URL '{trimmed}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(Error::Config(format!(
                "repository URL must be an absolute http(s) URL: {trimmed}"
            )));
        }
        url.set_query(None);
        url.set_fragment(None);
        Ok(Self { url, token })
    }

    /// Repository URL
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Access token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Repository URL without trailing slash or `.git` suffix
    pub fn web_url(&self) -> String {
        let s = self.url.as_str().trim_end_matches('/');
        s.strip_suffix(".git").unwrap_or(s).to_string()
    }

    /// Non-empty path segments of the repository URL (`.git` stripped)
    pub fn path_segments(&self) -> Vec<String> {
        let mut segments: Vec<String> = self
            .url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).map(ToString::to_string).collect())
            .unwrap_or_default();
        if let Some(last) = segments.last_mut()
            && let Some(stripped) = last.strip_suffix(".git")
        {
            *last = stripped.to_string();
        }
        segments
    }
}

impl fmt::Debug for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryRef")
            .field("url", &self.url.as_str())
            .field("token", &"<redacted>")
            .finish()
    }
}

/// A comment on a commit or pull request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// Comment ID
    pub id: u64,
    /// Comment body text
    pub body: String,
}

/// Pull/merge request state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrState {
    /// Open for review
    Open,
    /// Closed without merging
    Closed,
    /// Merged into the target branch
    Merged,
}

impl fmt::Display for PrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Merged => write!(f, "merged"),
        }
    }
}

impl FromStr for PrState {
    type Err = Error;

    /// Accepts each provider's spelling (`open`, `opened`, `OPEN`, `declined`, ...)
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "open" | "opened" => Ok(Self::Open),
            "closed" | "declined" | "superseded" | "locked" => Ok(Self::Closed),
            "merged" => Ok(Self::Merged),
            other => Err(Error::Config(format!("unknown pull request state '{other}'"))),
        }
    }
}

/// A pull request / merge request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// PR/MR number (IID on GitLab)
    pub number: u64,
    /// Web URL for the PR/MR
    pub url: String,
    /// Source (head) branch
    pub source_branch: String,
    /// Target (base) branch
    pub target_branch: String,
    /// Title
    pub title: String,
    /// Current state
    pub state: PrState,
}

/// Parameters for opening a pull request
#[derive(Debug, Clone, Default)]
pub struct NewPullRequest {
    /// Source (head) branch
    pub source: String,
    /// Target (base) branch
    pub target: String,
    /// Title
    pub title: String,
    /// Description / body
    pub description: Option<String>,
    /// Tag the title so the merge does not trigger a pipeline
    pub skip_ci: bool,
    /// Engage auto-merge right after creation
    pub auto_merge: Option<MergeMode>,
}

/// Marker recognised by GitHub Actions, GitLab CI and Bitbucket Pipelines
pub const SKIP_CI_MARKER: &str = "[skip ci]";

impl NewPullRequest {
    /// Title as sent to the provider, carrying the skip marker when requested
    pub fn effective_title(&self) -> String {
        if self.skip_ci && !self.title.contains(SKIP_CI_MARKER) {
            format!("{} {SKIP_CI_MARKER}", self.title)
        } else {
            self.title.clone()
        }
    }
}

/// Merge strategy for auto-merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Create a merge commit
    Merge,
    /// Squash all commits into one
    Squash,
    /// Rebase commits onto the target branch
    Rebase,
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge => write!(f, "merge"),
            Self::Squash => write!(f, "squash"),
            Self::Rebase => write!(f, "rebase"),
        }
    }
}

impl FromStr for MergeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "squash" => Ok(Self::Squash),
            "rebase" => Ok(Self::Rebase),
            other => Err(Error::Config(format!("unknown merge mode '{other}'"))),
        }
    }
}

/// A self-hosted CI runner as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runner {
    /// Runner ID (numeric on GitHub/GitLab, UUID on Bitbucket)
    pub id: String,
    /// Display name
    pub name: String,
    /// Labels / tags
    pub labels: Vec<String>,
    /// Whether the runner is connected
    pub online: bool,
    /// Whether the runner currently has a running job
    pub busy: bool,
}

/// One-time secret handed out by runner registration
///
/// Never printed; consumed when the launch command is composed.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistrationToken(String);

impl RegistrationToken {
    /// Wrap a raw token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Consume and return the raw token
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for RegistrationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RegistrationToken(<redacted>)")
    }
}

/// Result of registering a runner with the provider
#[derive(Debug, Clone)]
pub struct RunnerRegistration {
    /// Runner ID when the provider assigns one at registration time
    pub id: Option<String>,
    /// Secret the runner process authenticates with
    pub token: RegistrationToken,
    /// OAuth client id paired with the secret (Bitbucket)
    pub client_id: Option<String>,
}

/// Pipeline or job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    /// Queued, waiting or scheduled
    Pending,
    /// Currently executing
    Running,
    /// Finished successfully
    Success,
    /// Finished with a failure
    Failed,
    /// Cancelled or skipped
    Canceled,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// A pipeline (GitLab pipeline, GitHub workflow run, Bitbucket pipeline)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline ID
    pub id: String,
    /// Current status
    pub status: PipelineStatus,
}

/// A single job within a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Job ID
    pub id: String,
    /// Current status
    pub status: PipelineStatus,
    /// Parent pipeline ID
    pub pipeline_id: String,
}

/// Which pipeline to re-run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineTarget {
    /// Pipeline ID known directly
    Pipeline(String),
    /// Only a job ID is known; its parent pipeline is looked up first
    Job(String),
}

/// Conclusion reported by a check run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    /// Passed
    #[default]
    Success,
    /// Failed
    Failure,
    /// Informational only
    Neutral,
    /// Cancelled
    Cancelled,
    /// Skipped
    Skipped,
    /// Timed out
    TimedOut,
    /// Requires manual action
    ActionRequired,
}

/// A check-run report attached to a commit
#[derive(Debug, Clone, Default)]
pub struct CheckRun {
    /// Commit the check belongs to
    pub commit_sha: String,
    /// Check name / title
    pub title: String,
    /// Markdown report body
    pub report: String,
    /// Final conclusion
    pub conclusion: CheckConclusion,
}

/// A file to upload
#[derive(Debug, Clone)]
pub struct Asset {
    /// File name, used for MIME detection and the upload name
    pub file_name: String,
    /// File contents
    pub data: Vec<u8>,
}

impl Asset {
    /// MIME type guessed from the file name, `application/octet-stream` otherwise
    pub fn mime(&self) -> String {
        mime_guess::from_path(&self.file_name)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string()
    }

    /// Size in bytes
    pub const fn size(&self) -> usize {
        self.data.len()
    }
}

/// Result of an asset upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedAsset {
    /// Absolute URI of the uploaded file
    pub uri: String,
    /// MIME type
    pub mime: String,
    /// Size in bytes
    pub size: usize,
}
