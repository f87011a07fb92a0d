//! GitLab driver

use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::http::{Auth, Method, RequestBody, RequestClient};
use crate::merge::{RetryPolicy, unsupported_mode};
use crate::platform::resolve::{GITLAB_PROBE, resolve_base};
use crate::platform::{Driver, shell_join};
use crate::runner::{BinaryKind, RunnerBinary, RunnerLaunch, RunnerLogPatterns, patterns};
use crate::types::{
    Asset, CheckRun, Comment, Job, MergeMode, NewPullRequest, Pipeline, PipelineStatus, PrState,
    Provider, PullRequest, RegistrationToken, RepositoryRef, Runner, RunnerRegistration,
    UploadedAsset,
};
use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

/// Official runner build for 64-bit Linux
const RUNNER_DOWNLOAD_URL: &str =
    "https://gitlab-runner-downloads.s3.amazonaws.com/latest/binaries/gitlab-runner-linux-amd64";

const DOCKER_IMAGE: &str = "iterativeai/cml:latest";
const DOCKER_IMAGE_GPU: &str = "iterativeai/cml:latest-gpu";

/// GitLab.com or self-hosted GitLab (API v4)
pub struct GitLabDriver {
    repository: RepositoryRef,
    http: RequestClient,
    retry: RetryPolicy,
    configured_base: Option<Url>,
    base: OnceCell<Url>,
    runner_download_url: String,
}

#[derive(Deserialize)]
struct MergeRequest {
    iid: u64,
    web_url: String,
    source_branch: String,
    target_branch: String,
    title: String,
    state: String,
}

impl TryFrom<MergeRequest> for PullRequest {
    type Error = Error;

    fn try_from(mr: MergeRequest) -> Result<Self> {
        Ok(Self {
            number: mr.iid,
            url: mr.web_url,
            source_branch: mr.source_branch,
            target_branch: mr.target_branch,
            title: mr.title,
            state: mr.state.parse()?,
        })
    }
}

#[derive(Deserialize)]
struct Note {
    id: u64,
    body: String,
    #[serde(default)]
    system: bool,
}

impl From<Note> for Comment {
    fn from(note: Note) -> Self {
        Self {
            id: note.id,
            body: note.body,
        }
    }
}

#[derive(Deserialize)]
struct Discussion {
    #[serde(default)]
    notes: Vec<Note>,
}

#[derive(Deserialize)]
struct PipelinePayload {
    id: u64,
    status: String,
}

#[derive(Deserialize)]
struct JobPayload {
    id: u64,
    status: String,
    pipeline: PipelineRef,
}

#[derive(Deserialize)]
struct PipelineRef {
    id: u64,
}

#[derive(Deserialize)]
struct Project {
    runners_token: Option<String>,
}

#[derive(Deserialize)]
struct RegisteredRunner {
    id: u64,
    token: String,
}

#[derive(Deserialize)]
struct RunnerSummary {
    id: u64,
}

#[derive(Deserialize)]
struct RunnerDetails {
    id: u64,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tag_list: Vec<String>,
    #[serde(default)]
    online: Option<bool>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct UploadPayload {
    url: String,
}

#[derive(Serialize)]
struct CreateMrPayload<'a> {
    source_branch: &'a str,
    target_branch: &'a str,
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

#[derive(Serialize)]
struct MergePayload<'a> {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    merge_when_pipeline_succeeds: bool,
    squash: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    merge_commit_message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    squash_commit_message: Option<&'a str>,
}

/// Map GitLab pipeline and job states onto the shared status set
fn parse_status(status: &str) -> PipelineStatus {
    match status {
        "running" => PipelineStatus::Running,
        "success" => PipelineStatus::Success,
        "failed" => PipelineStatus::Failed,
        "canceled" | "skipped" => PipelineStatus::Canceled,
        _ => PipelineStatus::Pending,
    }
}

const fn state_filter(state: PrState) -> &'static str {
    match state {
        PrState::Open => "opened",
        PrState::Closed => "closed",
        PrState::Merged => "merged",
    }
}

/// Instance root for an API base (`https://host/gitlab/api/v4` -> `https://host/gitlab`)
fn instance_root(base: &Url) -> String {
    let base = base.as_str().trim_end_matches('/');
    base.strip_suffix(GITLAB_PROBE.api_path)
        .map_or(base, |root| root.trim_end_matches('/'))
        .to_string()
}

/// Project path relative to the instance root, e.g. `group/sub/project`
fn project_path(repository: &RepositoryRef, root: &str) -> String {
    let web_url = repository.web_url();
    match web_url.strip_prefix(root) {
        Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/').to_string(),
        _ => repository.path_segments().join("/"),
    }
}

impl GitLabDriver {
    /// Create a driver from validated configuration
    pub fn new(config: DriverConfig) -> Result<Self> {
        let http = RequestClient::new(
            Auth::PrivateToken(config.repository.token().to_string()),
            &config.proxy,
        )?;
        Ok(Self {
            repository: config.repository,
            http,
            retry: config.retry,
            configured_base: config.api_base,
            base: OnceCell::new(),
            runner_download_url: config
                .runner_download_url
                .unwrap_or_else(|| RUNNER_DOWNLOAD_URL.to_string()),
        })
    }

    /// URL below `/projects/:id`
    async fn project_url(&self, path: &str) -> Result<String> {
        let base = self.api_base().await?;
        let project = project_path(&self.repository, &instance_root(&base));
        Ok(format!(
            "{}/projects/{}{path}",
            base.as_str().trim_end_matches('/'),
            urlencoding::encode(&project)
        ))
    }

    /// URL directly below the API base
    async fn api_url(&self, path: &str) -> Result<String> {
        let base = self.api_base().await?;
        Ok(format!("{}{path}", base.as_str().trim_end_matches('/')))
    }

    fn merge_request_web_url(&self, iid: u64) -> String {
        format!("{}/-/merge_requests/{iid}", self.repository.web_url())
    }

    async fn runner_jobs_running(&self, runner_id: &str) -> Result<bool> {
        let url = self
            .api_url(&format!("/runners/{runner_id}/jobs?status=running&per_page=1"))
            .await?;
        let jobs: Vec<serde_json::Value> =
            self.http.request(Method::GET, &url, RequestBody::Empty).await?;
        Ok(!jobs.is_empty())
    }

    async fn merge(
        &self,
        pr_number: u64,
        mode: MergeMode,
        message: Option<&str>,
        gated: bool,
    ) -> Result<()> {
        if mode == MergeMode::Rebase {
            return Err(unsupported_mode(Provider::GitLab, mode));
        }
        let squash = mode == MergeMode::Squash;
        let payload = MergePayload {
            merge_when_pipeline_succeeds: gated,
            squash,
            merge_commit_message: message.filter(|_| !squash),
            squash_commit_message: message.filter(|_| squash),
        };
        let url = self
            .project_url(&format!("/merge_requests/{pr_number}/merge"))
            .await?;
        let _: serde_json::Value = self
            .http
            .request(
                Method::PUT,
                &url,
                RequestBody::Json(serde_json::to_value(&payload)?),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Driver for GitLabDriver {
    fn provider(&self) -> Provider {
        Provider::GitLab
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
                    None => resolve_base(&self.http, self.repository.url(), &GITLAB_PROBE).await,
                }
            })
            .await
            .cloned()
    }

    async fn create_comment(&self, commit_sha: &str, body: &str) -> Result<String> {
        debug!(commit_sha, "creating commit comment");
        let url = self
            .project_url(&format!("/repository/commits/{commit_sha}/comments"))
            .await?;
        let _: serde_json::Value = self
            .http
            .request(Method::POST, &url, RequestBody::form(&[("note", body)]))
            .await?;
        Ok(format!("{}/-/commit/{commit_sha}", self.repository.web_url()))
    }

    async fn update_comment(&self, _commit_sha: &str, _comment_id: u64, _body: &str)
    -> Result<String> {
        Err(Error::unsupported(Provider::GitLab, "updating commit comments"))
    }

    async fn list_commit_comments(&self, commit_sha: &str) -> Result<Vec<Comment>> {
        debug!(commit_sha, "listing commit comments");
        let url = self
            .project_url(&format!(
                "/repository/commits/{commit_sha}/discussions?per_page=100"
            ))
            .await?;
        let discussions: Vec<Discussion> =
            self.http.request(Method::GET, &url, RequestBody::Empty).await?;
        Ok(discussions
            .into_iter()
            .flat_map(|d| d.notes)
            .filter(|n| !n.system)
            .map(Into::into)
            .collect())
    }

    async fn list_commit_pull_requests(&self, commit_sha: &str) -> Result<Vec<PullRequest>> {
        debug!(commit_sha, "listing merge requests for commit");
        let url = self
            .project_url(&format!("/repository/commits/{commit_sha}/merge_requests"))
            .await?;
        let mrs: Vec<MergeRequest> =
            self.http.request(Method::GET, &url, RequestBody::Empty).await?;
        let mut prs = Vec::with_capacity(mrs.len());
        for mr in mrs {
            let pr = PullRequest::try_from(mr)?;
            if pr.state == PrState::Open {
                prs.push(pr);
            }
        }
        Ok(prs)
    }

    async fn create_check(&self, _check: &CheckRun) -> Result<String> {
        Err(Error::unsupported(Provider::GitLab, "check runs"))
    }

    async fn upload_asset(&self, asset: &Asset) -> Result<UploadedAsset> {
        let mime = asset.mime();
        debug!(file_name = %asset.file_name, %mime, size = asset.size(), "uploading asset");
        let part = Part::bytes(asset.data.clone())
            .file_name(asset.file_name.clone())
            .mime_str(&mime)?;
        let url = self.project_url("/uploads").await?;
        let upload: UploadPayload = self
            .http
            .request(
                Method::POST,
                &url,
                RequestBody::Multipart(Form::new().part("file", part)),
            )
            .await?;
        Ok(UploadedAsset {
            uri: format!("{}{}", self.repository.web_url(), upload.url),
            mime,
            size: asset.size(),
        })
    }

    async fn open_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest> {
        debug!(source = %request.source, target = %request.target, "creating MR");
        let payload = CreateMrPayload {
            source_branch: &request.source,
            target_branch: &request.target,
            title: request.effective_title(),
            description: request.description.as_deref(),
        };
        let url = self.project_url("/merge_requests").await?;
        let mr: MergeRequest = self
            .http
            .request(
                Method::POST,
                &url,
                RequestBody::Json(serde_json::to_value(&payload)?),
            )
            .await?;
        debug!(mr_iid = mr.iid, "created MR");
        mr.try_into()
    }

    async fn create_pull_request_comment(&self, pr_number: u64, body: &str) -> Result<String> {
        debug!(mr_iid = pr_number, "creating MR note");
        let url = self
            .project_url(&format!("/merge_requests/{pr_number}/notes"))
            .await?;
        let note: Note = self
            .http
            .request(Method::POST, &url, RequestBody::form(&[("body", body)]))
            .await?;
        Ok(format!(
            "{}#note_{}",
            self.merge_request_web_url(pr_number),
            note.id
        ))
    }

    async fn update_pull_request_comment(
        &self,
        pr_number: u64,
        comment_id: u64,
        body: &str,
    ) -> Result<String> {
        debug!(mr_iid = pr_number, comment_id, "updating MR note");
        let url = self
            .project_url(&format!("/merge_requests/{pr_number}/notes/{comment_id}"))
            .await?;
        let note: Note = self
            .http
            .request(Method::PUT, &url, RequestBody::form(&[("body", body)]))
            .await?;
        Ok(format!(
            "{}#note_{}",
            self.merge_request_web_url(pr_number),
            note.id
        ))
    }

    async fn list_pull_request_comments(&self, pr_number: u64) -> Result<Vec<Comment>> {
        debug!(mr_iid = pr_number, "listing MR notes");
        let url = self
            .project_url(&format!(
                "/merge_requests/{pr_number}/notes?sort=asc&per_page=100"
            ))
            .await?;
        let notes: Vec<Note> = self.http.request(Method::GET, &url, RequestBody::Empty).await?;
        Ok(notes
            .into_iter()
            .filter(|n| !n.system)
            .map(Into::into)
            .collect())
    }

    async fn list_pull_requests(&self, state: PrState) -> Result<Vec<PullRequest>> {
        debug!(%state, "listing MRs");
        let url = self
            .project_url(&format!(
                "/merge_requests?state={}&per_page=100",
                state_filter(state)
            ))
            .await?;
        let mrs: Vec<MergeRequest> =
            self.http.request(Method::GET, &url, RequestBody::Empty).await?;
        let mrs = mrs
            .into_iter()
            .map(PullRequest::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(mrs.into_iter().filter(|mr| mr.state == state).collect())
    }

    async fn get_pipeline(&self, pipeline_id: &str) -> Result<Pipeline> {
        let url = self.project_url(&format!("/pipelines/{pipeline_id}")).await?;
        let pipeline: PipelinePayload =
            self.http.request(Method::GET, &url, RequestBody::Empty).await?;
        Ok(Pipeline {
            id: pipeline.id.to_string(),
            status: parse_status(&pipeline.status),
        })
    }

    async fn get_job(&self, job_id: &str) -> Result<Job> {
        let url = self.project_url(&format!("/jobs/{job_id}")).await?;
        let job: JobPayload = self.http.request(Method::GET, &url, RequestBody::Empty).await?;
        Ok(Job {
            id: job.id.to_string(),
            status: parse_status(&job.status),
            pipeline_id: job.pipeline.id.to_string(),
        })
    }

    async fn cancel_pipeline(&self, pipeline_id: &str) -> Result<()> {
        debug!(pipeline_id, "cancelling pipeline");
        let url = self
            .project_url(&format!("/pipelines/{pipeline_id}/cancel"))
            .await?;
        let _: serde_json::Value = self
            .http
            .request(Method::POST, &url, RequestBody::Empty)
            .await?;
        Ok(())
    }

    async fn retry_pipeline(&self, pipeline_id: &str) -> Result<()> {
        debug!(pipeline_id, "retrying pipeline");
        let url = self
            .project_url(&format!("/pipelines/{pipeline_id}/retry"))
            .await?;
        let _: serde_json::Value = self
            .http
            .request(Method::POST, &url, RequestBody::Empty)
            .await?;
        Ok(())
    }

    async fn register_runner(&self, name: &str, labels: &[String]) -> Result<RunnerRegistration> {
        debug!(name, "registering runner");
        let project_url = self.project_url("").await?;
        let project: Project = self
            .http
            .request(Method::GET, &project_url, RequestBody::Empty)
            .await?;
        let runners_token = project.runners_token.ok_or_else(|| Error::Authentication {
            status: 403,
            message: "project runner registration token is not visible to this token".into(),
        })?;

        let url = self.api_url("/runners").await?;
        let tag_list = labels.join(",");
        let registered: RegisteredRunner = self
            .http
            .request(
                Method::POST,
                &url,
                RequestBody::form(&[
                    ("token", runners_token.as_str()),
                    ("description", name),
                    ("tag_list", tag_list.as_str()),
                    ("locked", "true"),
                    ("run_untagged", "true"),
                    ("access_level", "not_protected"),
                ]),
            )
            .await?;
        debug!(runner_id = registered.id, "runner registered");

        Ok(RunnerRegistration {
            id: Some(registered.id.to_string()),
            token: RegistrationToken::new(registered.token),
            client_id: None,
        })
    }

    async fn unregister_runner(&self, runner_id: &str) -> Result<()> {
        debug!(runner_id, "unregistering runner");
        let url = self.api_url(&format!("/runners/{runner_id}")).await?;
        self.http
            .request_raw(Method::DELETE, &url, RequestBody::Empty)
            .await?;
        Ok(())
    }

    async fn list_runners(&self) -> Result<Vec<Runner>> {
        let url = self.project_url("/runners?per_page=100").await?;
        let summaries: Vec<RunnerSummary> =
            self.http.request(Method::GET, &url, RequestBody::Empty).await?;
        debug!(count = summaries.len(), "fetching runner details");
        let ids: Vec<String> = summaries.iter().map(|s| s.id.to_string()).collect();
        try_join_all(ids.iter().map(|id| self.get_runner(id))).await
    }

    async fn get_runner(&self, runner_id: &str) -> Result<Runner> {
        let url = self.api_url(&format!("/runners/{runner_id}")).await?;
        let (details, busy) = futures::try_join!(
            self.http
                .request::<RunnerDetails>(Method::GET, &url, RequestBody::Empty),
            self.runner_jobs_running(runner_id),
        )?;
        let online = details
            .online
            .unwrap_or_else(|| details.status.as_deref() == Some("online"));
        Ok(Runner {
            id: details.id.to_string(),
            name: details.description.unwrap_or_default(),
            labels: details.tag_list,
            online,
            busy,
        })
    }

    fn runner_log_patterns(&self) -> &'static RunnerLogPatterns {
        &patterns::GITLAB
    }

    fn runner_binary(&self, workdir: &Path) -> Option<RunnerBinary> {
        Some(RunnerBinary {
            url: self.runner_download_url.clone(),
            path: workdir.join("gitlab-runner"),
            kind: BinaryKind::Executable,
        })
    }

    async fn runner_launch_command(&self, launch: RunnerLaunch) -> Result<String> {
        let root = instance_root(&self.api_base().await?);
        let binary = launch
            .binary
            .map_or_else(|| "gitlab-runner".to_string(), |p| p.display().to_string());
        let workdir = launch.workdir.display().to_string();
        let wait_timeout = launch.idle_timeout.as_secs().to_string();
        let token = launch.registration.token.into_inner();

        let mut args: Vec<&str> = vec![
            binary.as_str(),
            "--log-format=json",
            "run-single",
            "--builds-dir",
            workdir.as_str(),
            "--cache-dir",
            workdir.as_str(),
            "--url",
            root.as_str(),
            "--name",
            launch.name.as_str(),
            "--token",
            token.as_str(),
            "--wait-timeout",
            wait_timeout.as_str(),
        ];
        if launch.host.in_container {
            args.extend(["--executor", "shell"]);
        } else {
            args.extend(["--executor", "docker"]);
            if launch.host.gpu {
                args.extend(["--docker-image", DOCKER_IMAGE_GPU, "--docker-runtime", "nvidia"]);
            } else {
                args.extend(["--docker-image", DOCKER_IMAGE]);
            }
            for volume in &launch.docker_volumes {
                args.extend(["--docker-volumes", volume.as_str()]);
            }
        }
        if launch.single {
            args.extend(["--max-builds", "1"]);
        }
        Ok(shell_join(&args))
    }

    fn registration_hint(&self) -> &'static str {
        "the token needs the api scope and at least Maintainer access to the project"
    }

    fn supports_merge_mode(&self, mode: MergeMode) -> bool {
        matches!(mode, MergeMode::Merge | MergeMode::Squash)
    }

    async fn enable_auto_merge(
        &self,
        pr_number: u64,
        mode: MergeMode,
        message: Option<&str>,
    ) -> Result<()> {
        self.merge(pr_number, mode, message, true).await
    }

    async fn merge_now(&self, pr_number: u64, mode: MergeMode, message: Option<&str>)
    -> Result<()> {
        self.merge(pr_number, mode, message, false).await
    }

    fn git_credentials(&self) -> (String, String) {
        ("oauth2".to_string(), self.repository.token().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::HostInfo;
    use std::path::PathBuf;
    use std::time::Duration;

    fn driver(base: &str) -> GitLabDriver {
        let config = DriverConfig::new(
            Provider::GitLab,
            "https://example.com/gitlab/group/project",
            "glpat-test",
        )
        .unwrap()
        .with_api_base(base)
        .unwrap();
        GitLabDriver::new(config).unwrap()
    }

    fn launch(host: HostInfo, single: bool) -> RunnerLaunch {
        RunnerLaunch {
            workdir: PathBuf::from("/tmp/runner"),
            name: "cml-runner".into(),
            labels: vec!["cml".into()],
            idle_timeout: Duration::from_secs(300),
            single,
            docker_volumes: vec!["/data:/data:ro".into()],
            host,
            binary: Some(PathBuf::from("/tmp/runner/gitlab-runner")),
            registration: RunnerRegistration {
                id: Some("42".into()),
                token: RegistrationToken::new("glrt-secret"),
                client_id: None,
            },
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(parse_status("running"), PipelineStatus::Running);
        assert_eq!(parse_status("created"), PipelineStatus::Pending);
        assert_eq!(parse_status("waiting_for_resource"), PipelineStatus::Pending);
        assert_eq!(parse_status("skipped"), PipelineStatus::Canceled);
        assert_eq!(parse_status("failed"), PipelineStatus::Failed);
    }

    #[test]
    fn test_project_path_under_sub_path() {
        let repo = RepositoryRef::new("https://example.com/gitlab/group/sub/project.git", "t").unwrap();
        let base = Url::parse("https://example.com/gitlab/api/v4").unwrap();
        let root = instance_root(&base);
        assert_eq!(root, "https://example.com/gitlab");
        assert_eq!(project_path(&repo, &root), "group/sub/project");
    }

    #[tokio::test]
    async fn test_project_url_is_encoded() {
        let driver = driver("https://example.com/gitlab/api/v4");
        assert_eq!(
            driver.project_url("/merge_requests").await.unwrap(),
            "https://example.com/gitlab/api/v4/projects/group%2Fproject/merge_requests"
        );
    }

    #[tokio::test]
    async fn test_launch_command_docker_gpu() {
        let driver = driver("https://example.com/gitlab/api/v4");
        let host = HostInfo {
            gpu: true,
            in_container: false,
        };
        let command = driver.runner_launch_command(launch(host, true)).await.unwrap();

        assert!(command.starts_with("/tmp/runner/gitlab-runner --log-format=json run-single"));
        assert!(command.contains("--url https://example.com/gitlab "));
        assert!(command.contains("--token glrt-secret"));
        assert!(command.contains("--wait-timeout 300"));
        assert!(command.contains("--executor docker"));
        assert!(command.contains("--docker-image iterativeai/cml:latest-gpu --docker-runtime nvidia"));
        assert!(command.contains("--docker-volumes /data:/data:ro"));
        assert!(command.ends_with("--max-builds 1"));
    }

    #[tokio::test]
    async fn test_launch_command_shell_in_container() {
        let driver = driver("https://example.com/gitlab/api/v4");
        let host = HostInfo {
            gpu: false,
            in_container: true,
        };
        let command = driver.runner_launch_command(launch(host, false)).await.unwrap();

        assert!(command.contains("--executor shell"));
        assert!(!command.contains("--docker-image"));
        assert!(!command.contains("--max-builds"));
    }

    #[test]
    fn test_rebase_not_supported() {
        let driver = driver("https://example.com/gitlab/api/v4");
        assert!(driver.supports_merge_mode(MergeMode::Squash));
        assert!(!driver.supports_merge_mode(MergeMode::Rebase));
    }

    #[tokio::test]
    async fn test_commit_comment_update_unsupported() {
        let driver = driver("https://example.com/gitlab/api/v4");
        let err = driver.update_comment("abc", 1, "x").await.unwrap_err();
        assert!(err.is_unsupported());
    }
}
