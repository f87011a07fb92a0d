//! Mock driver for testing
//!
//! These are test utilities - not all may be used in every test binary.

#![allow(dead_code)]

use async_trait::async_trait;
use forge_driver::error::{Error, Result};
use forge_driver::http::{Auth, ProxyConfig, RequestClient};
use forge_driver::merge::RetryPolicy;
use forge_driver::platform::Driver;
use forge_driver::runner::{RunnerBinary, RunnerLaunch, RunnerLogPatterns, patterns};
use forge_driver::types::{
    Asset, CheckRun, Comment, Job, MergeMode, NewPullRequest, Pipeline, PipelineStatus, PrState,
    Provider, PullRequest, RegistrationToken, RepositoryRef, Runner, RunnerRegistration,
    UploadedAsset,
};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

/// Call record for `enable_auto_merge` and `merge_now`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCall {
    pub pr_number: u64,
    pub mode: MergeMode,
    pub message: Option<String>,
}

/// Simple mock driver for testing
///
/// This manually implements `Driver` rather than using mockall, because
/// mockall has issues with methods returning references.
///
/// Features:
/// - Auto-incrementing PR numbers
/// - Ordered log of every operation called
/// - Scripted failures for auto-merge, merge and registration
/// - Configurable pipeline and job states
pub struct MockDriver {
    provider: Provider,
    repository: RepositoryRef,
    http: RequestClient,
    retry: RetryPolicy,
    supported_modes: Vec<MergeMode>,
    next_pr_number: AtomicU64,
    launch_command: String,
    pipelines: Mutex<HashMap<String, PipelineStatus>>,
    jobs: Mutex<HashMap<String, String>>,
    // Call tracking
    calls: Mutex<Vec<String>>,
    open_pr_calls: Mutex<Vec<NewPullRequest>>,
    enable_auto_merge_calls: Mutex<Vec<MergeCall>>,
    merge_now_calls: Mutex<Vec<MergeCall>>,
    launches: Mutex<Vec<String>>,
    // Error injection
    auto_merge_failures: Mutex<VecDeque<Error>>,
    error_on_merge_now: Mutex<Option<Error>>,
    error_on_register: Mutex<Option<Error>>,
}

impl MockDriver {
    /// Create a mock for the given provider
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            repository: RepositoryRef::new("https://git.example.com/acme/widgets", "mock-token")
                .unwrap(),
            http: RequestClient::new(Auth::None, &ProxyConfig::default()).unwrap(),
            retry: RetryPolicy::immediate(3),
            supported_modes: vec![MergeMode::Merge, MergeMode::Squash, MergeMode::Rebase],
            next_pr_number: AtomicU64::new(1),
            launch_command: "exit 0".to_string(),
            pipelines: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            open_pr_calls: Mutex::new(Vec::new()),
            enable_auto_merge_calls: Mutex::new(Vec::new()),
            merge_now_calls: Mutex::new(Vec::new()),
            launches: Mutex::new(Vec::new()),
            auto_merge_failures: Mutex::new(VecDeque::new()),
            error_on_merge_now: Mutex::new(None),
            error_on_register: Mutex::new(None),
        }
    }

    /// Use a different repository URL
    #[must_use]
    pub fn with_repository(mut self, url: &str, token: &str) -> Self {
        self.repository = RepositoryRef::new(url, token).unwrap();
        self
    }

    /// Restrict the merge modes auto-merge supports
    #[must_use]
    pub fn with_supported_modes(mut self, modes: &[MergeMode]) -> Self {
        self.supported_modes = modes.to_vec();
        self
    }

    /// Use a different auto-merge retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Shell command returned by `runner_launch_command`
    #[must_use]
    pub fn with_launch_command(mut self, command: &str) -> Self {
        self.launch_command = command.to_string();
        self
    }

    // === Scripted state ===

    /// Register a pipeline with its status
    pub fn set_pipeline(&self, id: &str, status: PipelineStatus) {
        self.pipelines
            .lock()
            .unwrap()
            .insert(id.to_string(), status);
    }

    /// Register a job belonging to a pipeline
    pub fn set_job(&self, job_id: &str, pipeline_id: &str) {
        self.jobs
            .lock()
            .unwrap()
            .insert(job_id.to_string(), pipeline_id.to_string());
    }

    // === Error injection methods ===

    /// Queue failures returned by successive `enable_auto_merge` calls
    pub fn fail_auto_merge(&self, errors: Vec<Error>) {
        self.auto_merge_failures.lock().unwrap().extend(errors);
    }

    /// Make `merge_now` return an error
    pub fn fail_merge_now(&self, error: Error) {
        *self.error_on_merge_now.lock().unwrap() = Some(error);
    }

    /// Make `register_runner` return an error
    pub fn fail_register(&self, error: Error) {
        *self.error_on_register.lock().unwrap() = Some(error);
    }

    // === Call verification methods ===

    /// Every operation called, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// All `open_pull_request` calls
    pub fn open_pr_calls(&self) -> Vec<NewPullRequest> {
        self.open_pr_calls.lock().unwrap().clone()
    }

    /// All `enable_auto_merge` calls
    pub fn enable_auto_merge_calls(&self) -> Vec<MergeCall> {
        self.enable_auto_merge_calls.lock().unwrap().clone()
    }

    /// All `merge_now` calls
    pub fn merge_now_calls(&self) -> Vec<MergeCall> {
        self.merge_now_calls.lock().unwrap().clone()
    }

    /// Registration secrets consumed by `runner_launch_command`
    pub fn launches(&self) -> Vec<String> {
        self.launches.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn unsupported(&self, operation: &'static str) -> Error {
        Error::unsupported(self.provider, operation)
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn provider(&self) -> Provider {
        self.provider
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
        Ok(Url::parse("https://git.example.com/api")?)
    }

    async fn create_comment(&self, commit_sha: &str, _body: &str) -> Result<String> {
        self.record(format!("create_comment:{commit_sha}"));
        Ok(format!("{}/commit/{commit_sha}", self.repository.web_url()))
    }

    async fn update_comment(&self, _commit_sha: &str, _comment_id: u64, _body: &str)
    -> Result<String> {
        Err(self.unsupported("updating commit comments"))
    }

    async fn list_commit_comments(&self, _commit_sha: &str) -> Result<Vec<Comment>> {
        Ok(Vec::new())
    }

    async fn list_commit_pull_requests(&self, _commit_sha: &str) -> Result<Vec<PullRequest>> {
        Ok(Vec::new())
    }

    async fn create_check(&self, _check: &CheckRun) -> Result<String> {
        Err(self.unsupported("check runs"))
    }

    async fn upload_asset(&self, _asset: &Asset) -> Result<UploadedAsset> {
        Err(self.unsupported("asset uploads"))
    }

    async fn open_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest> {
        self.record("open_pull_request");
        self.open_pr_calls.lock().unwrap().push(request.clone());
        let number = self.next_pr_number.fetch_add(1, Ordering::SeqCst);
        Ok(PullRequest {
            number,
            url: format!("{}/pull/{number}", self.repository.web_url()),
            source_branch: request.source.clone(),
            target_branch: request.target.clone(),
            title: request.effective_title(),
            state: PrState::Open,
        })
    }

    async fn create_pull_request_comment(&self, pr_number: u64, _body: &str) -> Result<String> {
        Ok(format!("{}/pull/{pr_number}#comment", self.repository.web_url()))
    }

    async fn update_pull_request_comment(
        &self,
        pr_number: u64,
        comment_id: u64,
        _body: &str,
    ) -> Result<String> {
        Ok(format!(
            "{}/pull/{pr_number}#comment-{comment_id}",
            self.repository.web_url()
        ))
    }

    async fn list_pull_request_comments(&self, _pr_number: u64) -> Result<Vec<Comment>> {
        Ok(Vec::new())
    }

    async fn list_pull_requests(&self, _state: PrState) -> Result<Vec<PullRequest>> {
        Ok(Vec::new())
    }

    async fn get_pipeline(&self, pipeline_id: &str) -> Result<Pipeline> {
        self.record(format!("get_pipeline:{pipeline_id}"));
        let status = self
            .pipelines
            .lock()
            .unwrap()
            .get(pipeline_id)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("pipeline {pipeline_id}")))?;
        Ok(Pipeline {
            id: pipeline_id.to_string(),
            status,
        })
    }

    async fn get_job(&self, job_id: &str) -> Result<Job> {
        self.record(format!("get_job:{job_id}"));
        let pipeline_id = self
            .jobs
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        Ok(Job {
            id: job_id.to_string(),
            status: PipelineStatus::Failed,
            pipeline_id,
        })
    }

    async fn cancel_pipeline(&self, pipeline_id: &str) -> Result<()> {
        self.record(format!("cancel_pipeline:{pipeline_id}"));
        self.set_pipeline(pipeline_id, PipelineStatus::Canceled);
        Ok(())
    }

    async fn retry_pipeline(&self, pipeline_id: &str) -> Result<()> {
        self.record(format!("retry_pipeline:{pipeline_id}"));
        self.set_pipeline(pipeline_id, PipelineStatus::Pending);
        Ok(())
    }

    async fn register_runner(&self, name: &str, _labels: &[String]) -> Result<RunnerRegistration> {
        self.record(format!("register_runner:{name}"));
        if let Some(error) = self.error_on_register.lock().unwrap().take() {
            return Err(error);
        }
        Ok(RunnerRegistration {
            id: Some("runner-1".to_string()),
            token: RegistrationToken::new("registration-secret"),
            client_id: None,
        })
    }

    async fn unregister_runner(&self, runner_id: &str) -> Result<()> {
        self.record(format!("unregister_runner:{runner_id}"));
        Ok(())
    }

    async fn list_runners(&self) -> Result<Vec<Runner>> {
        Ok(Vec::new())
    }

    async fn get_runner(&self, runner_id: &str) -> Result<Runner> {
        Err(Error::NotFound(format!("runner {runner_id}")))
    }

    fn runner_log_patterns(&self) -> &'static RunnerLogPatterns {
        &patterns::GITLAB
    }

    fn runner_binary(&self, _workdir: &Path) -> Option<RunnerBinary> {
        None
    }

    async fn runner_launch_command(&self, launch: RunnerLaunch) -> Result<String> {
        self.record("runner_launch_command");
        self.launches
            .lock()
            .unwrap()
            .push(launch.registration.token.into_inner());
        Ok(self.launch_command.clone())
    }

    fn registration_hint(&self) -> &'static str {
        "mock hint"
    }

    fn supports_merge_mode(&self, mode: MergeMode) -> bool {
        self.supported_modes.contains(&mode)
    }

    async fn enable_auto_merge(
        &self,
        pr_number: u64,
        mode: MergeMode,
        message: Option<&str>,
    ) -> Result<()> {
        self.record("enable_auto_merge");
        self.enable_auto_merge_calls.lock().unwrap().push(MergeCall {
            pr_number,
            mode,
            message: message.map(ToString::to_string),
        });
        match self.auto_merge_failures.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn merge_now(&self, pr_number: u64, mode: MergeMode, message: Option<&str>)
    -> Result<()> {
        self.record("merge_now");
        self.merge_now_calls.lock().unwrap().push(MergeCall {
            pr_number,
            mode,
            message: message.map(ToString::to_string),
        });
        match self.error_on_merge_now.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn git_credentials(&self) -> (String, String) {
        (
            "mock-user".to_string(),
            self.repository.token().to_string(),
        )
    }
}
