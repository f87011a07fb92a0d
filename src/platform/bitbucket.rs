//! Bitbucket Cloud driver

use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::http::{Auth, Method, RequestBody, RequestClient};
use crate::merge::{RetryPolicy, unsupported_mode};
use crate::platform::{Driver, shell_join};
use crate::runner::{RunnerBinary, RunnerLaunch, RunnerLogPatterns, patterns};
use crate::types::{
    Asset, CheckRun, Comment, Job, MergeMode, NewPullRequest, Pipeline, PipelineStatus, PrState,
    Provider, PullRequest, RegistrationToken, RepositoryRef, Runner, RunnerRegistration,
    UploadedAsset,
};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::path::Path;
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

const BITBUCKET_API: &str = "https://api.bitbucket.org/2.0";

const RUNNER_IMAGE: &str =
    "docker-public.packages.atlassian.com/sox/atlassian/bitbucket-pipelines-runner:1";

/// Bitbucket Cloud (API 2.0)
///
/// Tokens of the form `user:app_password` are sent as basic credentials,
/// anything else as a bearer token.
pub struct BitbucketDriver {
    repository: RepositoryRef,
    http: RequestClient,
    retry: RetryPolicy,
    workspace: String,
    repo: String,
    configured_base: Option<Url>,
    base: OnceCell<Url>,
}

/// One page of a paginated listing
#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
    next: Option<String>,
}

#[derive(Deserialize)]
struct Link {
    href: String,
}

#[derive(Deserialize)]
struct Links {
    html: Link,
}

#[derive(Deserialize)]
struct BranchName {
    name: String,
}

#[derive(Deserialize)]
struct Endpoint {
    branch: BranchName,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    id: u64,
    title: String,
    state: String,
    source: Endpoint,
    destination: Endpoint,
    links: Links,
}

impl TryFrom<PullRequestPayload> for PullRequest {
    type Error = Error;

    fn try_from(pr: PullRequestPayload) -> Result<Self> {
        Ok(Self {
            number: pr.id,
            url: pr.links.html.href,
            source_branch: pr.source.branch.name,
            target_branch: pr.destination.branch.name,
            title: pr.title,
            state: pr.state.parse()?,
        })
    }
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    raw: String,
}

#[derive(Deserialize)]
struct CommentPayload {
    id: u64,
    content: Content,
    #[serde(default)]
    deleted: bool,
}

impl From<CommentPayload> for Comment {
    fn from(c: CommentPayload) -> Self {
        Self {
            id: c.id,
            body: c.content.raw,
        }
    }
}

#[derive(Deserialize)]
struct PipelineState {
    name: String,
    result: Option<PipelineResult>,
}

#[derive(Deserialize)]
struct PipelineResult {
    name: String,
}

#[derive(Deserialize)]
struct PipelinePayload {
    uuid: String,
    state: PipelineState,
    #[serde(default)]
    target: serde_json::Value,
}

#[derive(Deserialize)]
struct RunnerState {
    status: String,
    #[serde(default)]
    step: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RunnerPayload {
    uuid: String,
    name: String,
    #[serde(default)]
    labels: Vec<String>,
    state: RunnerState,
}

impl From<RunnerPayload> for Runner {
    fn from(r: RunnerPayload) -> Self {
        let online = r.state.status == "ONLINE";
        Self {
            id: r.uuid,
            name: r.name,
            labels: r.labels,
            online,
            busy: online && r.state.step.is_some_and(|s| !s.is_null()),
        }
    }
}

/// Map a pipeline state (and result, once completed) onto the shared status set
fn parse_status(state: &PipelineState) -> PipelineStatus {
    match state.name.as_str() {
        "IN_PROGRESS" | "RUNNING" => PipelineStatus::Running,
        "COMPLETED" => match state.result.as_ref().map(|r| r.name.as_str()) {
            Some("SUCCESSFUL") => PipelineStatus::Success,
            Some("STOPPED" | "EXPIRED") => PipelineStatus::Canceled,
            _ => PipelineStatus::Failed,
        },
        _ => PipelineStatus::Pending,
    }
}

fn merge_strategy(mode: MergeMode) -> Result<&'static str> {
    match mode {
        MergeMode::Merge => Ok("merge_commit"),
        MergeMode::Squash => Ok("squash"),
        MergeMode::Rebase => Err(unsupported_mode(Provider::Bitbucket, mode)),
    }
}

/// Internal API root next to the public one (`.../2.0` -> `.../internal`)
fn internal_base(base: &Url) -> String {
    let base = base.as_str().trim_end_matches('/');
    let root = base.strip_suffix("/2.0").unwrap_or(base);
    format!("{root}/internal")
}

/// Pipeline UUIDs carry braces which must be escaped in paths
fn path_id(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

impl BitbucketDriver {
    /// Create a driver from validated configuration
    pub fn new(config: DriverConfig) -> Result<Self> {
        let segments = config.repository.path_segments();
        let [.., workspace, repo] = segments.as_slice() else {
            return Err(Error::Config(format!(
                "Bitbucket repository URL must name a workspace and repository: {}",
                config.repository.url()
            )));
        };
        let (workspace, repo) = (workspace.clone(), repo.clone());

        let token = config.repository.token();
        let auth = match token.split_once(':') {
            Some((user, password)) => Auth::Basic {
                user: user.to_string(),
                password: password.to_string(),
            },
            None => Auth::Bearer(token.to_string()),
        };
        let http = RequestClient::new(auth, &config.proxy)?;

        Ok(Self {
            repository: config.repository,
            http,
            retry: config.retry,
            workspace,
            repo,
            configured_base: config.api_base,
            base: OnceCell::new(),
        })
    }

    /// URL below `/repositories/:workspace/:repo`
    async fn repo_url(&self, path: &str) -> Result<String> {
        let base = self.api_base().await?;
        Ok(format!(
            "{}/repositories/{}/{}{path}",
            base.as_str().trim_end_matches('/'),
            self.workspace,
            self.repo
        ))
    }

    /// URL below the internal runners configuration endpoint
    async fn runners_url(&self, path: &str) -> Result<String> {
        let base = self.api_base().await?;
        Ok(format!(
            "{}/repositories/{}/{}/pipelines-config/runners{path}",
            internal_base(&base),
            self.workspace,
            self.repo
        ))
    }

    /// Collect every page of a listing by following `next` links
    async fn paginate<T: DeserializeOwned>(&self, url: String) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next {
            let page: Page<T> = self.http.request(Method::GET, &url, RequestBody::Empty).await?;
            items.extend(page.values);
            next = page.next;
        }
        Ok(items)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let url = self.repo_url(path).await?;
        self.http.request(method, &url, RequestBody::Json(body)).await
    }

    fn commit_comment_url(&self, commit_sha: &str, comment_id: u64) -> String {
        format!(
            "{}/commits/{commit_sha}#comment-{comment_id}",
            self.repository.web_url()
        )
    }

    fn pull_request_comment_url(&self, pr_number: u64, comment_id: u64) -> String {
        format!(
            "{}/pull-requests/{pr_number}#comment-{comment_id}",
            self.repository.web_url()
        )
    }
}

#[async_trait]
impl Driver for BitbucketDriver {
    fn provider(&self) -> Provider {
        Provider::Bitbucket
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
                match &self.configured_base {
                    Some(base) => Ok(base.clone()),
                    None => Ok(Url::parse(BITBUCKET_API)?),
                }
            })
            .await
            .cloned()
    }

    async fn create_comment(&self, commit_sha: &str, body: &str) -> Result<String> {
        debug!(commit_sha, "creating commit comment");
        let comment: CommentPayload = self
            .send_json(
                Method::POST,
                &format!("/commit/{commit_sha}/comments"),
                json!({ "content": { "raw": body } }),
            )
            .await?;
        Ok(self.commit_comment_url(commit_sha, comment.id))
    }

    async fn update_comment(&self, commit_sha: &str, comment_id: u64, body: &str)
    -> Result<String> {
        debug!(commit_sha, comment_id, "updating commit comment");
        let comment: CommentPayload = self
            .send_json(
                Method::PUT,
                &format!("/commit/{commit_sha}/comments/{comment_id}"),
                json!({ "content": { "raw": body } }),
            )
            .await?;
        Ok(self.commit_comment_url(commit_sha, comment.id))
    }

    async fn list_commit_comments(&self, commit_sha: &str) -> Result<Vec<Comment>> {
        debug!(commit_sha, "listing commit comments");
        let url = self.repo_url(&format!("/commit/{commit_sha}/comments")).await?;
        let comments: Vec<CommentPayload> = self.paginate(url).await?;
        Ok(comments
            .into_iter()
            .filter(|c| !c.deleted)
            .map(Into::into)
            .collect())
    }

    async fn list_commit_pull_requests(&self, commit_sha: &str) -> Result<Vec<PullRequest>> {
        debug!(commit_sha, "listing PRs for commit");
        let url = self
            .repo_url(&format!("/commit/{commit_sha}/pullrequests"))
            .await?;
        let prs: Vec<PullRequestPayload> = self.paginate(url).await?;
        let mut open = Vec::new();
        for pr in prs {
            let pr = PullRequest::try_from(pr)?;
            if pr.state == PrState::Open {
                open.push(pr);
            }
        }
        Ok(open)
    }

    async fn create_check(&self, _check: &CheckRun) -> Result<String> {
        Err(Error::unsupported(Provider::Bitbucket, "check runs"))
    }

    async fn upload_asset(&self, asset: &Asset) -> Result<UploadedAsset> {
        let mime = asset.mime();
        debug!(file_name = %asset.file_name, %mime, size = asset.size(), "uploading asset");
        let part = Part::bytes(asset.data.clone())
            .file_name(asset.file_name.clone())
            .mime_str(&mime)?;
        let url = self.repo_url("/downloads").await?;
        self.http
            .request_raw(
                Method::POST,
                &url,
                RequestBody::Multipart(Form::new().part("files", part)),
            )
            .await?;
        Ok(UploadedAsset {
            uri: format!(
                "{}/downloads/{}",
                self.repository.web_url(),
                urlencoding::encode(&asset.file_name)
            ),
            mime,
            size: asset.size(),
        })
    }

    async fn open_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest> {
        debug!(source = %request.source, target = %request.target, "creating PR");
        let payload = json!({
            "title": request.effective_title(),
            "description": request.description.as_deref().unwrap_or_default(),
            "source": { "branch": { "name": request.source } },
            "destination": { "branch": { "name": request.target } },
        });
        let pr: PullRequestPayload = self
            .send_json(Method::POST, "/pullrequests", payload)
            .await?;
        debug!(pr_number = pr.id, "created PR");
        pr.try_into()
    }

    async fn create_pull_request_comment(&self, pr_number: u64, body: &str) -> Result<String> {
        debug!(pr_number, "creating PR comment");
        let comment: CommentPayload = self
            .send_json(
                Method::POST,
                &format!("/pullrequests/{pr_number}/comments"),
                json!({ "content": { "raw": body } }),
            )
            .await?;
        Ok(self.pull_request_comment_url(pr_number, comment.id))
    }

    async fn update_pull_request_comment(
        &self,
        pr_number: u64,
        comment_id: u64,
        body: &str,
    ) -> Result<String> {
        debug!(pr_number, comment_id, "updating PR comment");
        let comment: CommentPayload = self
            .send_json(
                Method::PUT,
                &format!("/pullrequests/{pr_number}/comments/{comment_id}"),
                json!({ "content": { "raw": body } }),
            )
            .await?;
        Ok(self.pull_request_comment_url(pr_number, comment.id))
    }

    async fn list_pull_request_comments(&self, pr_number: u64) -> Result<Vec<Comment>> {
        debug!(pr_number, "listing PR comments");
        let url = self
            .repo_url(&format!("/pullrequests/{pr_number}/comments"))
            .await?;
        let comments: Vec<CommentPayload> = self.paginate(url).await?;
        Ok(comments
            .into_iter()
            .filter(|c| !c.deleted)
            .map(Into::into)
            .collect())
    }

    async fn list_pull_requests(&self, state: PrState) -> Result<Vec<PullRequest>> {
        debug!(%state, "listing PRs");
        let filter = match state {
            PrState::Open => "state=OPEN",
            PrState::Closed => "state=DECLINED&state=SUPERSEDED",
            PrState::Merged => "state=MERGED",
        };
        let url = self.repo_url(&format!("/pullrequests?{filter}")).await?;
        let prs: Vec<PullRequestPayload> = self.paginate(url).await?;
        let prs = prs
            .into_iter()
            .map(PullRequest::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(prs.into_iter().filter(|pr| pr.state == state).collect())
    }

    async fn get_pipeline(&self, pipeline_id: &str) -> Result<Pipeline> {
        let url = self
            .repo_url(&format!("/pipelines/{}", path_id(pipeline_id)))
            .await?;
        let pipeline: PipelinePayload =
            self.http.request(Method::GET, &url, RequestBody::Empty).await?;
        Ok(Pipeline {
            status: parse_status(&pipeline.state),
            id: pipeline.uuid,
        })
    }

    async fn get_job(&self, _job_id: &str) -> Result<Job> {
        Err(Error::unsupported(Provider::Bitbucket, "job lookup"))
    }

    async fn cancel_pipeline(&self, pipeline_id: &str) -> Result<()> {
        debug!(pipeline_id, "stopping pipeline");
        let url = self
            .repo_url(&format!("/pipelines/{}/stopPipeline", path_id(pipeline_id)))
            .await?;
        self.http
            .request_raw(Method::POST, &url, RequestBody::Empty)
            .await?;
        Ok(())
    }

    /// Start a new pipeline on the original pipeline's target
    async fn retry_pipeline(&self, pipeline_id: &str) -> Result<()> {
        let url = self
            .repo_url(&format!("/pipelines/{}", path_id(pipeline_id)))
            .await?;
        let pipeline: PipelinePayload =
            self.http.request(Method::GET, &url, RequestBody::Empty).await?;
        debug!(pipeline_id, "starting pipeline on the same target");

        let _: serde_json::Value = self
            .send_json(
                Method::POST,
                "/pipelines/",
                json!({ "target": pipeline.target }),
            )
            .await?;
        Ok(())
    }

    async fn register_runner(&self, name: &str, labels: &[String]) -> Result<RunnerRegistration> {
        #[derive(Deserialize)]
        struct OAuthClient {
            id: String,
            secret: String,
        }

        #[derive(Deserialize)]
        struct Registered {
            uuid: String,
            oauth_client: OAuthClient,
        }

        debug!(name, "registering runner");
        let mut all_labels = vec!["self.hosted".to_string(), "linux".to_string()];
        all_labels.extend(labels.iter().cloned());

        let url = self.runners_url("").await?;
        let registered: Registered = self
            .http
            .request(
                Method::POST,
                &url,
                RequestBody::Json(json!({
                    "name": name,
                    "labels": all_labels,
                    "state": { "status": "UNREGISTERED" },
                })),
            )
            .await?;
        debug!(runner_id = %registered.uuid, "runner registered");

        Ok(RunnerRegistration {
            id: Some(registered.uuid),
            token: RegistrationToken::new(registered.oauth_client.secret),
            client_id: Some(registered.oauth_client.id),
        })
    }

    async fn unregister_runner(&self, runner_id: &str) -> Result<()> {
        debug!(runner_id, "removing runner");
        let url = self.runners_url(&format!("/{}", path_id(runner_id))).await?;
        self.http
            .request_raw(Method::DELETE, &url, RequestBody::Empty)
            .await?;
        Ok(())
    }

    async fn list_runners(&self) -> Result<Vec<Runner>> {
        let url = self.runners_url("").await?;
        let runners: Vec<RunnerPayload> = self.paginate(url).await?;
        Ok(runners.into_iter().map(Into::into).collect())
    }

    async fn get_runner(&self, runner_id: &str) -> Result<Runner> {
        let url = self.runners_url(&format!("/{}", path_id(runner_id))).await?;
        let runner: RunnerPayload =
            self.http.request(Method::GET, &url, RequestBody::Empty).await?;
        Ok(runner.into())
    }

    fn runner_log_patterns(&self) -> &'static RunnerLogPatterns {
        &patterns::BITBUCKET
    }

    /// The runner ships as a container image; nothing to download
    fn runner_binary(&self, _workdir: &Path) -> Option<RunnerBinary> {
        None
    }

    async fn runner_launch_command(&self, launch: RunnerLaunch) -> Result<String> {
        #[derive(Deserialize)]
        struct Workspace {
            uuid: String,
        }

        #[derive(Deserialize)]
        struct Repository {
            uuid: String,
            workspace: Workspace,
        }

        let url = self.repo_url("").await?;
        let repository: Repository =
            self.http.request(Method::GET, &url, RequestBody::Empty).await?;

        let runner_uuid = launch.registration.id.ok_or_else(|| {
            Error::Config("Bitbucket runner registration returned no runner id".into())
        })?;
        let client_id = launch.registration.client_id.ok_or_else(|| {
            Error::Config("Bitbucket runner registration returned no OAuth client".into())
        })?;
        let secret = launch.registration.token.into_inner();
        let workdir = launch.workdir.display().to_string();

        let env = [
            format!("ACCOUNT_UUID={}", repository.workspace.uuid),
            format!("REPOSITORY_UUID={}", repository.uuid),
            format!("RUNNER_UUID={runner_uuid}"),
            "RUNTIME_PREREQUISITES_ENABLED=true".to_string(),
            format!("OAUTH_CLIENT_ID={client_id}"),
            format!("OAUTH_CLIENT_SECRET={secret}"),
            format!("WORKING_DIRECTORY={workdir}"),
        ];
        let workdir_mount = format!("{workdir}:{workdir}");
        let container_name = format!("runner-{}", runner_uuid.trim_matches(['{', '}']));

        let mut args: Vec<&str> = vec![
            "docker",
            "container",
            "run",
            "-t",
            "-a",
            "stderr",
            "-a",
            "stdout",
            "--rm",
            "-v",
            "/tmp:/tmp",
            "-v",
            "/var/run/docker.sock:/var/run/docker.sock",
            "-v",
            "/var/lib/docker/containers:/var/lib/docker/containers:ro",
            "-v",
            workdir_mount.as_str(),
        ];
        for volume in &launch.docker_volumes {
            args.extend(["-v", volume.as_str()]);
        }
        for var in &env {
            args.extend(["-e", var.as_str()]);
        }
        args.extend(["--name", container_name.as_str(), RUNNER_IMAGE]);
        Ok(shell_join(&args))
    }

    fn registration_hint(&self) -> &'static str {
        "the credentials need repository admin rights to manage Pipelines runners"
    }

    fn supports_merge_mode(&self, mode: MergeMode) -> bool {
        matches!(mode, MergeMode::Merge | MergeMode::Squash)
    }

    /// Bitbucket has no merge-when-pipeline-succeeds
    async fn enable_auto_merge(
        &self,
        _pr_number: u64,
        _mode: MergeMode,
        _message: Option<&str>,
    ) -> Result<()> {
        Err(Error::unsupported(Provider::Bitbucket, "gated auto-merge"))
    }

    async fn merge_now(&self, pr_number: u64, mode: MergeMode, message: Option<&str>)
    -> Result<()> {
        let strategy = merge_strategy(mode)?;
        debug!(pr_number, %mode, "merging PR");
        let mut payload = json!({
            "merge_strategy": strategy,
            "close_source_branch": false,
        });
        if let Some(message) = message {
            payload["message"] = json!(message);
        }
        let _: serde_json::Value = self
            .send_json(
                Method::POST,
                &format!("/pullrequests/{pr_number}/merge"),
                payload,
            )
            .await?;
        Ok(())
    }

    fn git_credentials(&self) -> (String, String) {
        let token = self.repository.token();
        match token.split_once(':') {
            Some((user, password)) => (user.to_string(), password.to_string()),
            None => ("x-token-auth".to_string(), token.to_string()),
        }
    }
}
