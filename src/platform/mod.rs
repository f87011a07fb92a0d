//! Provider drivers for GitHub, GitLab and Bitbucket
//!
//! Provides one operation surface across providers. Capabilities a provider
//! lacks fail with [`Error::Unsupported`] instead of being left out, so
//! callers branch on capability, never on provider identity.

mod bitbucket;
mod detection;
mod factory;
mod github;
mod gitlab;
pub mod resolve;

pub use bitbucket::BitbucketDriver;
pub use detection::detect_provider;
pub use factory::create_driver;
pub use github::GitHubDriver;
pub use gitlab::GitLabDriver;

use crate::error::{Error, Result};
use crate::http::RequestClient;
use crate::merge::{
    AutoMergeOutcome, AutoMergeRequest, RetryPolicy, auto_merge, unsupported_mode,
};
use crate::runner::{RunnerBinary, RunnerLaunch, RunnerLogPatterns};
use crate::types::{
    Asset, CheckRun, Comment, Job, MergeMode, NewPullRequest, Pipeline, PipelineStatus,
    PipelineTarget, PrState, Provider, PullRequest, RepositoryRef, Runner, RunnerRegistration,
    UploadedAsset,
};
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;
use url::Url;

/// Uniform operation contract implemented once per provider
///
/// Each driver resolves its API base lazily, once, and routes every call
/// through its [`RequestClient`].
#[async_trait]
pub trait Driver: Send + Sync {
    /// Provider backing this driver
    fn provider(&self) -> Provider;

    /// Repository this driver operates on
    fn repository(&self) -> &RepositoryRef;

    /// Request client used for every call
    fn http(&self) -> &RequestClient;

    /// Retry schedule for auto-merge
    fn retry_policy(&self) -> &RetryPolicy;

    /// API base URL, resolved on first use and cached
    async fn api_base(&self) -> Result<Url>;

    // =========================================================================
    // Commit comments
    // =========================================================================

    /// Attach a comment to a commit, returning its web URL
    async fn create_comment(&self, commit_sha: &str, body: &str) -> Result<String>;

    /// Edit a commit comment, returning its web URL
    async fn update_comment(&self, commit_sha: &str, comment_id: u64, body: &str)
    -> Result<String>;

    /// List comments on a commit
    async fn list_commit_comments(&self, commit_sha: &str) -> Result<Vec<Comment>>;

    /// Open PRs/MRs containing a commit
    async fn list_commit_pull_requests(&self, commit_sha: &str) -> Result<Vec<PullRequest>>;

    // =========================================================================
    // Checks and assets
    // =========================================================================

    /// Publish a check run, returning its web URL
    async fn create_check(&self, check: &CheckRun) -> Result<String>;

    /// Upload a file and return its absolute URI
    async fn upload_asset(&self, asset: &Asset) -> Result<UploadedAsset>;

    // =========================================================================
    // Pull / merge requests
    // =========================================================================

    /// Open a PR/MR and engage auto-merge when requested, returning its URL
    ///
    /// An unsupported auto-merge mode is rejected before the PR is created.
    /// Once the PR exists, an auto-merge failure is returned as
    /// [`Error::PullRequestAutoMerge`] carrying the PR's URL.
    async fn create_pull_request(&self, request: &NewPullRequest) -> Result<String> {
        if let Some(mode) = request.auto_merge
            && !self.supports_merge_mode(mode)
        {
            return Err(unsupported_mode(self.provider(), mode));
        }

        let pr = self.open_pull_request(request).await?;

        if let Some(mode) = request.auto_merge {
            let merge = AutoMergeRequest {
                pr_number: pr.number,
                mode,
                message: None,
            };
            auto_merge(self, &merge)
                .await
                .map_err(|e| Error::PullRequestAutoMerge {
                    url: pr.url.clone(),
                    source: Box::new(e),
                })?;
        }
        Ok(pr.url)
    }

    /// Open a PR/MR without any merge handling
    async fn open_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest>;

    /// Comment on a PR/MR, returning the comment's web URL
    async fn create_pull_request_comment(&self, pr_number: u64, body: &str) -> Result<String>;

    /// Edit a PR/MR comment, returning its web URL
    async fn update_pull_request_comment(
        &self,
        pr_number: u64,
        comment_id: u64,
        body: &str,
    ) -> Result<String>;

    /// List comments on a PR/MR
    async fn list_pull_request_comments(&self, pr_number: u64) -> Result<Vec<Comment>>;

    /// List PRs/MRs in the given state
    async fn list_pull_requests(&self, state: PrState) -> Result<Vec<PullRequest>>;

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Look up a pipeline
    async fn get_pipeline(&self, pipeline_id: &str) -> Result<Pipeline>;

    /// Look up a job, including its parent pipeline
    async fn get_job(&self, job_id: &str) -> Result<Job>;

    /// Cancel a pipeline
    async fn cancel_pipeline(&self, pipeline_id: &str) -> Result<()>;

    /// Retry a pipeline that is not running
    async fn retry_pipeline(&self, pipeline_id: &str) -> Result<()>;

    /// Re-run a pipeline, cancelling it first if it is running
    ///
    /// With only a job ID, the parent pipeline is looked up first. Cancel
    /// and retry are separate calls; a concurrent external change between
    /// them is tolerated.
    async fn rerun_pipeline(&self, target: &PipelineTarget) -> Result<()> {
        let pipeline_id = match target {
            PipelineTarget::Pipeline(id) => id.clone(),
            PipelineTarget::Job(job_id) => self.get_job(job_id).await?.pipeline_id,
        };

        let pipeline = self.get_pipeline(&pipeline_id).await?;
        debug!(pipeline_id, status = %pipeline.status, "re-running pipeline");
        if pipeline.status == PipelineStatus::Running {
            self.cancel_pipeline(&pipeline_id).await?;
        }
        self.retry_pipeline(&pipeline_id).await
    }

    // =========================================================================
    // Runners
    // =========================================================================

    /// Register a runner and obtain its one-time credentials
    async fn register_runner(&self, name: &str, labels: &[String]) -> Result<RunnerRegistration>;

    /// Remove a runner; a not-found response is returned as an error
    async fn unregister_runner(&self, runner_id: &str) -> Result<()>;

    /// List runners, including whether each is busy
    async fn list_runners(&self) -> Result<Vec<Runner>>;

    /// Look up one runner
    async fn get_runner(&self, runner_id: &str) -> Result<Runner>;

    /// Line patterns for the runner's log output
    fn runner_log_patterns(&self) -> &'static RunnerLogPatterns;

    /// Runner binary to provision under `workdir`, if the provider needs one
    fn runner_binary(&self, workdir: &Path) -> Option<RunnerBinary>;

    /// Shell command starting the runner
    ///
    /// The result embeds the registration secret and must not be logged.
    async fn runner_launch_command(&self, launch: RunnerLaunch) -> Result<String>;

    /// Operator guidance shown when runner registration is rejected
    fn registration_hint(&self) -> &'static str;

    // =========================================================================
    // Merge automation
    // =========================================================================

    /// Whether auto-merge supports this mode
    fn supports_merge_mode(&self, mode: MergeMode) -> bool;

    /// Ask the provider to merge once the pipeline succeeds
    async fn enable_auto_merge(
        &self,
        pr_number: u64,
        mode: MergeMode,
        message: Option<&str>,
    ) -> Result<()>;

    /// Merge right away, bypassing the pipeline gate
    async fn merge_now(&self, pr_number: u64, mode: MergeMode, message: Option<&str>)
    -> Result<()>;

    /// Enable auto-merge with retry and immediate-merge fallback
    ///
    /// Rejected credentials ([`Error::Authentication`]) are returned as-is,
    /// without the immediate-merge fallback.
    async fn auto_merge(&self, request: &AutoMergeRequest) -> Result<AutoMergeOutcome> {
        auto_merge(self, request).await
    }

    // =========================================================================
    // Git
    // =========================================================================

    /// User name and password embedded into the git remote URL
    fn git_credentials(&self) -> (String, String);

    /// Shell command configuring git identity and an authenticated remote
    ///
    /// The command contains the token; callers must never log it.
    fn git_remote_command(&self, user_name: &str, user_email: &str, remote: &str) -> Result<String> {
        let (user, password) = self.git_credentials();
        let mut url = Url::parse(&self.repository().web_url())?;
        url.set_username(&user)
            .map_err(|()| Error::Config("repository URL cannot carry credentials".into()))?;
        url.set_password(Some(&password))
            .map_err(|()| Error::Config("repository URL cannot carry credentials".into()))?;
        let remote_url = format!("{}.git", url.as_str().trim_end_matches('/'));

        let mut commands = Vec::new();
        if self.provider() == Provider::GitHub {
            commands.push(shell_join(&[
                "git",
                "config",
                "--unset",
                "http.https://github.com/.extraheader",
            ]));
        }
        commands.push(shell_join(&["git", "config", "user.name", user_name]));
        commands.push(shell_join(&["git", "config", "user.email", user_email]));
        commands.push(shell_join(&["git", "remote", "set-url", remote, &remote_url]));
        Ok(commands.join(" && "))
    }
}

/// Quote a shell argument with single quotes
pub(crate) fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Join arguments into a shell command line
pub(crate) fn shell_join(args: &[&str]) -> String {
    args.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}
