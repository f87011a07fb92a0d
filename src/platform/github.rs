//! GitHub driver (github.com and GitHub Enterprise Server)

use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::http::{Auth, Method, RequestBody, RequestClient};
use crate::merge::RetryPolicy;
use crate::platform::detection::is_github_dot_com;
use crate::platform::resolve::{GITHUB_ENTERPRISE_PROBE, resolve_base};
use crate::platform::{Driver, shell_join};
use crate::runner::{BinaryKind, RunnerBinary, RunnerLaunch, RunnerLogPatterns, patterns};
use crate::types::{
    Asset, CheckConclusion, CheckRun, Comment, Job, MergeMode, NewPullRequest, Pipeline,
    PipelineStatus, PrState, Provider, PullRequest, RegistrationToken, RepositoryRef, Runner,
    RunnerRegistration, UploadedAsset,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use url::Url;

const GITHUB_API: &str = "https://api.github.com";

/// Actions runner release for 64-bit Linux
const RUNNER_DOWNLOAD_URL: &str = "https://github.com/actions/runner/releases/download/v2.321.0/actions-runner-linux-x64-2.321.0.tar.gz";

/// Check run summaries are capped by the API
const MAX_CHECK_SUMMARY: usize = 65_535;

/// Status polls after cancelling a run before giving up on waiting
const MAX_CANCEL_POLLS: u32 = 60;

/// GitHub service over the REST v3 and GraphQL APIs
pub struct GitHubDriver {
    repository: RepositoryRef,
    http: RequestClient,
    retry: RetryPolicy,
    owner: String,
    repo: String,
    configured_base: Option<Url>,
    base: OnceCell<Url>,
    runner_download_url: String,
    poll_interval: Duration,
}

// GraphQL response types for the auto-merge mutation

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
struct Pull {
    number: u64,
    html_url: String,
    title: String,
    state: String,
    merged_at: Option<DateTime<Utc>>,
    head: BranchRef,
    base: BranchRef,
}

#[derive(Deserialize)]
struct BranchRef {
    #[serde(rename = "ref")]
    ref_field: String,
}

impl From<Pull> for PullRequest {
    fn from(pr: Pull) -> Self {
        let state = match (pr.state.as_str(), pr.merged_at.is_some()) {
            (_, true) => PrState::Merged,
            ("open", false) => PrState::Open,
            _ => PrState::Closed,
        };
        Self {
            number: pr.number,
            url: pr.html_url,
            source_branch: pr.head.ref_field,
            target_branch: pr.base.ref_field,
            title: pr.title,
            state,
        }
    }
}

#[derive(Deserialize)]
struct IssueComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    html_url: String,
}

impl From<IssueComment> for Comment {
    fn from(c: IssueComment) -> Self {
        Self {
            id: c.id,
            body: c.body.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct RunPayload {
    id: u64,
    status: String,
    conclusion: Option<String>,
}

#[derive(Deserialize)]
struct JobPayload {
    id: u64,
    status: String,
    conclusion: Option<String>,
    run_id: u64,
}

#[derive(Deserialize)]
struct RunnerPayload {
    id: u64,
    name: String,
    status: String,
    busy: bool,
    #[serde(default)]
    labels: Vec<RunnerLabel>,
}

#[derive(Deserialize)]
struct RunnerLabel {
    name: String,
}

impl From<RunnerPayload> for Runner {
    fn from(r: RunnerPayload) -> Self {
        Self {
            id: r.id.to_string(),
            name: r.name,
            labels: r.labels.into_iter().map(|l| l.name).collect(),
            online: r.status == "online",
            busy: r.busy,
        }
    }
}

#[derive(Serialize)]
struct CheckRunPayload<'a> {
    name: &'a str,
    head_sha: &'a str,
    status: &'static str,
    conclusion: CheckConclusion,
    output: CheckOutput<'a>,
}

#[derive(Serialize)]
struct CheckOutput<'a> {
    title: &'a str,
    summary: &'a str,
}

/// Map an Actions run or job onto the shared status set
fn parse_status(status: &str, conclusion: Option<&str>) -> PipelineStatus {
    match status {
        "in_progress" => PipelineStatus::Running,
        "completed" => match conclusion {
            Some("success" | "neutral") => PipelineStatus::Success,
            Some("cancelled" | "skipped" | "stale") => PipelineStatus::Canceled,
            _ => PipelineStatus::Failed,
        },
        _ => PipelineStatus::Pending,
    }
}

const fn merge_method(mode: MergeMode) -> &'static str {
    match mode {
        MergeMode::Merge => "merge",
        MergeMode::Squash => "squash",
        MergeMode::Rebase => "rebase",
    }
}

/// Truncate to at most `max` bytes on a character boundary
fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// GraphQL endpoint for a REST base (`.../api/v3` -> `.../api/graphql`)
fn graphql_url(base: &Url) -> String {
    let base = base.as_str().trim_end_matches('/');
    match base.strip_suffix("/v3") {
        Some(api) => format!("{api}/graphql"),
        None => format!("{base}/graphql"),
    }
}

impl GitHubDriver {
    /// Create a driver from validated configuration
    pub fn new(config: DriverConfig) -> Result<Self> {
        let segments = config.repository.path_segments();
        let [.., owner, repo] = segments.as_slice() else {
            return Err(Error::Config(format!(
                "GitHub repository URL must name an owner and repository: {}",
                config.repository.url()
            )));
        };
        let (owner, repo) = (owner.clone(), repo.clone());

        let http = RequestClient::new(
            Auth::Bearer(config.repository.token().to_string()),
            &config.proxy,
        )?
        .with_header("accept", "application/vnd.github+json")
        .with_header("x-github-api-version", "2022-11-28");

        Ok(Self {
            repository: config.repository,
            http,
            retry: config.retry,
            owner,
            repo,
            configured_base: config.api_base,
            base: OnceCell::new(),
            runner_download_url: config
                .runner_download_url
                .unwrap_or_else(|| RUNNER_DOWNLOAD_URL.to_string()),
            poll_interval: config.poll_interval,
        })
    }

    /// URL below `/repos/:owner/:repo`
    async fn repo_url(&self, path: &str) -> Result<String> {
        let base = self.api_base().await?;
        Ok(format!(
            "{}/repos/{}/{}{path}",
            base.as_str().trim_end_matches('/'),
            self.owner,
            self.repo
        ))
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.repo_url(path).await?;
        self.http.request(Method::GET, &url, RequestBody::Empty).await
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let url = self.repo_url(path).await?;
        self.http.request(method, &url, RequestBody::Json(body)).await
    }

    async fn post_empty(&self, path: &str) -> Result<()> {
        let url = self.repo_url(path).await?;
        self.http
            .request_raw(Method::POST, &url, RequestBody::Empty)
            .await?;
        Ok(())
    }

    async fn graphql<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T> {
        let url = graphql_url(&self.api_base().await?);
        let response: GraphQlResponse<T> = self
            .http
            .request(
                Method::POST,
                &url,
                RequestBody::Json(json!({ "query": query, "variables": variables })),
            )
            .await?;

        if let Some(errors) = response.errors
            && !errors.is_empty()
        {
            let message = errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::Api {
                status: 200,
                message,
            });
        }
        response.data.ok_or_else(|| Error::Api {
            status: 200,
            message: "GraphQL response carried no data".into(),
        })
    }
}

#[async_trait]
impl Driver for GitHubDriver {
    fn provider(&self) -> Provider {
        Provider::GitHub
    }

    fn repository(&self) -> &RepositoryRef {
        &self.repository
    }

    fn http(&self) -> &RequestClient {
        &self.http
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn api_base(&self) -> Result<Url> {
        self.base
            .get_or_try_init(|| async {
                if let Some(base) = &self.configured_base {
                    return Ok(base.clone());
                }
                if is_github_dot_com(self.repository.url()) {
                    return Ok(Url::parse(GITHUB_API)?);
                }
                resolve_base(&self.http, self.repository.url(), &GITHUB_ENTERPRISE_PROBE).await
            })
            .await
            .cloned()
    }

    async fn create_comment(&self, commit_sha: &str, body: &str) -> Result<String> {
        debug!(commit_sha, "creating commit comment");
        let comment: IssueComment = self
            .send_json(
                Method::POST,
                &format!("/commits/{commit_sha}/comments"),
                json!({ "body": body }),
            )
            .await?;
        Ok(comment.html_url)
    }

    async fn update_comment(&self, commit_sha: &str, comment_id: u64, body: &str)
    -> Result<String> {
        debug!(commit_sha, comment_id, "updating commit comment");
        let comment: IssueComment = self
            .send_json(
                Method::PATCH,
                &format!("/comments/{comment_id}"),
                json!({ "body": body }),
            )
            .await?;
        Ok(comment.html_url)
    }

    async fn list_commit_comments(&self, commit_sha: &str) -> Result<Vec<Comment>> {
        debug!(commit_sha, "listing commit comments");
        let comments: Vec<IssueComment> = self
            .get(&format!("/commits/{commit_sha}/comments?per_page=100"))
            .await?;
        Ok(comments.into_iter().map(Into::into).collect())
    }

    async fn list_commit_pull_requests(&self, commit_sha: &str) -> Result<Vec<PullRequest>> {
        debug!(commit_sha, "listing PRs for commit");
        let pulls: Vec<Pull> = self.get(&format!("/commits/{commit_sha}/pulls")).await?;
        Ok(pulls
            .into_iter()
            .map(PullRequest::from)
            .filter(|pr| pr.state == PrState::Open)
            .collect())
    }

    async fn create_check(&self, check: &CheckRun) -> Result<String> {
        #[derive(Deserialize)]
        struct Created {
            html_url: String,
        }

        debug!(commit_sha = %check.commit_sha, title = %check.title, "creating check run");
        let payload = CheckRunPayload {
            name: &check.title,
            head_sha: &check.commit_sha,
            status: "completed",
            conclusion: check.conclusion,
            output: CheckOutput {
                title: &check.title,
                summary: truncate(&check.report, MAX_CHECK_SUMMARY),
            },
        };
        let created: Created = self
            .send_json(Method::POST, "/check-runs", serde_json::to_value(&payload)?)
            .await?;
        Ok(created.html_url)
    }

    async fn upload_asset(&self, _asset: &Asset) -> Result<UploadedAsset> {
        Err(Error::unsupported(Provider::GitHub, "asset uploads"))
    }

    async fn open_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest> {
        debug!(source = %request.source, target = %request.target, "creating PR");
        let mut payload = json!({
            "head": request.source,
            "base": request.target,
            "title": request.effective_title(),
        });
        if let Some(description) = &request.description {
            payload["body"] = json!(description);
        }
        let pull: Pull = self.send_json(Method::POST, "/pulls", payload).await?;
        debug!(pr_number = pull.number, "created PR");
        Ok(pull.into())
    }

    async fn create_pull_request_comment(&self, pr_number: u64, body: &str) -> Result<String> {
        debug!(pr_number, "creating PR comment");
        let comment: IssueComment = self
            .send_json(
                Method::POST,
                &format!("/issues/{pr_number}/comments"),
                json!({ "body": body }),
            )
            .await?;
        Ok(comment.html_url)
    }

    async fn update_pull_request_comment(
        &self,
        pr_number: u64,
        comment_id: u64,
        body: &str,
    ) -> Result<String> {
        debug!(pr_number, comment_id, "updating PR comment");
        let comment: IssueComment = self
            .send_json(
                Method::PATCH,
                &format!("/issues/comments/{comment_id}"),
                json!({ "body": body }),
            )
            .await?;
        Ok(comment.html_url)
    }

    async fn list_pull_request_comments(&self, pr_number: u64) -> Result<Vec<Comment>> {
        debug!(pr_number, "listing PR comments");
        let comments: Vec<IssueComment> = self
            .get(&format!("/issues/{pr_number}/comments?per_page=100"))
            .await?;
        Ok(comments.into_iter().map(Into::into).collect())
    }

    async fn list_pull_requests(&self, state: PrState) -> Result<Vec<PullRequest>> {
        debug!(%state, "listing PRs");
        let filter = if state == PrState::Open { "open" } else { "closed" };
        let pulls: Vec<Pull> = self
            .get(&format!("/pulls?state={filter}&per_page=100"))
            .await?;
        Ok(pulls
            .into_iter()
            .map(PullRequest::from)
            .filter(|pr| pr.state == state)
            .collect())
    }

    async fn get_pipeline(&self, pipeline_id: &str) -> Result<Pipeline> {
        let run: RunPayload = self.get(&format!("/actions/runs/{pipeline_id}")).await?;
        Ok(Pipeline {
            id: run.id.to_string(),
            status: parse_status(&run.status, run.conclusion.as_deref()),
        })
    }

    async fn get_job(&self, job_id: &str) -> Result<Job> {
        let job: JobPayload = self.get(&format!("/actions/jobs/{job_id}")).await?;
        Ok(Job {
            id: job.id.to_string(),
            status: parse_status(&job.status, job.conclusion.as_deref()),
            pipeline_id: job.run_id.to_string(),
        })
    }

    /// Cancel a workflow run and wait for it to stop
    ///
    /// A run cannot be re-run while it is still in progress.
    async fn cancel_pipeline(&self, pipeline_id: &str) -> Result<()> {
        debug!(pipeline_id, "cancelling workflow run");
        self.post_empty(&format!("/actions/runs/{pipeline_id}/cancel"))
            .await?;

        for _ in 0..MAX_CANCEL_POLLS {
            let run = self.get_pipeline(pipeline_id).await?;
            if !matches!(run.status, PipelineStatus::Running | PipelineStatus::Pending) {
                debug!(pipeline_id, status = %run.status, "workflow run stopped");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        warn!(pipeline_id, "workflow run still active after cancel");
        Ok(())
    }

    async fn retry_pipeline(&self, pipeline_id: &str) -> Result<()> {
        debug!(pipeline_id, "re-running workflow run");
        self.post_empty(&format!("/actions/runs/{pipeline_id}/rerun"))
            .await
    }

    async fn register_runner(&self, name: &str, _labels: &[String]) -> Result<RunnerRegistration> {
        #[derive(Deserialize)]
        struct TokenPayload {
            token: String,
        }

        debug!(name, "requesting runner registration token");
        let url = self.repo_url("/actions/runners/registration-token").await?;
        let payload: TokenPayload = self
            .http
            .request(Method::POST, &url, RequestBody::Empty)
            .await?;
        Ok(RunnerRegistration {
            id: None,
            token: RegistrationToken::new(payload.token),
            client_id: None,
        })
    }

    async fn unregister_runner(&self, runner_id: &str) -> Result<()> {
        debug!(runner_id, "removing runner");
        let url = self.repo_url(&format!("/actions/runners/{runner_id}")).await?;
        self.http
            .request_raw(Method::DELETE, &url, RequestBody::Empty)
            .await?;
        Ok(())
    }

    async fn list_runners(&self) -> Result<Vec<Runner>> {
        #[derive(Deserialize)]
        struct RunnerList {
            runners: Vec<RunnerPayload>,
        }

        let list: RunnerList = self.get("/actions/runners?per_page=100").await?;
        Ok(list.runners.into_iter().map(Into::into).collect())
    }

    async fn get_runner(&self, runner_id: &str) -> Result<Runner> {
        let runner: RunnerPayload = self.get(&format!("/actions/runners/{runner_id}")).await?;
        Ok(runner.into())
    }

    fn runner_log_patterns(&self) -> &'static RunnerLogPatterns {
        &patterns::GITHUB
    }

    fn runner_binary(&self, workdir: &Path) -> Option<RunnerBinary> {
        Some(RunnerBinary {
            url: self.runner_download_url.clone(),
            path: workdir.join("run.sh"),
            kind: BinaryKind::TarGz,
        })
    }

    async fn runner_launch_command(&self, launch: RunnerLaunch) -> Result<String> {
        let config_script = launch.workdir.join("config.sh").display().to_string();
        let run_script = launch
            .binary
            .unwrap_or_else(|| launch.workdir.join("run.sh"))
            .display()
            .to_string();
        let repository_url = self.repository.web_url();
        let token = launch.registration.token.into_inner();
        let labels = launch.labels.join(",");

        let mut configure: Vec<&str> = vec![
            "RUNNER_ALLOW_RUNASROOT=1",
            config_script.as_str(),
            "--unattended",
            "--replace",
            "--url",
            repository_url.as_str(),
            "--token",
            token.as_str(),
            "--name",
            launch.name.as_str(),
            "--work",
            "_work",
        ];
        if !labels.is_empty() {
            configure.extend(["--labels", labels.as_str()]);
        }
        if launch.single {
            configure.push("--ephemeral");
        }

        Ok(format!(
            "{} && {}",
            shell_join(&configure),
            shell_join(&["RUNNER_ALLOW_RUNASROOT=1", run_script.as_str()])
        ))
    }

    fn registration_hint(&self) -> &'static str {
        "the token needs the repo scope, or administration write permission on the repository"
    }

    fn supports_merge_mode(&self, _mode: MergeMode) -> bool {
        true
    }

    async fn enable_auto_merge(
        &self,
        pr_number: u64,
        mode: MergeMode,
        message: Option<&str>,
    ) -> Result<()> {
        #[derive(Deserialize)]
        struct NodeId {
            node_id: String,
        }

        let pull: NodeId = self.get(&format!("/pulls/{pr_number}")).await?;
        debug!(pr_number, node_id = %pull.node_id, "enabling auto-merge");

        let _: serde_json::Value = self
            .graphql(
                r"mutation($id: ID!, $method: PullRequestMergeMethod!, $headline: String) {
                    enablePullRequestAutoMerge(input: {pullRequestId: $id, mergeMethod: $method, commitHeadline: $headline}) {
                        clientMutationId
                    }
                }",
                json!({
                    "id": pull.node_id,
                    "method": merge_method(mode).to_ascii_uppercase(),
                    "headline": message,
                }),
            )
            .await?;
        Ok(())
    }

    async fn merge_now(&self, pr_number: u64, mode: MergeMode, message: Option<&str>)
    -> Result<()> {
        debug!(pr_number, %mode, "merging PR");
        let mut payload = json!({ "merge_method": merge_method(mode) });
        if let Some(message) = message {
            payload["commit_title"] = json!(message);
        }
        let _: serde_json::Value = self
            .send_json(Method::PUT, &format!("/pulls/{pr_number}/merge"), payload)
            .await?;
        Ok(())
    }

    fn git_credentials(&self) -> (String, String) {
        (
            "x-access-token".to_string(),
            self.repository.token().to_string(),
        )
    }
}
