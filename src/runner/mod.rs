//! Runner lifecycle: provisioning, registration and launch
//!
//! [`start_runner`] hands back the spawned process without supervising it.
//! Awaiting, time-boxing or killing it is up to the caller; log lines are
//! classified with the driver's [`RunnerLogPatterns`].

mod binary;
mod host;
pub mod patterns;

pub use binary::{BinaryKind, RunnerBinary, ensure_binary};
pub use host::{HostInfo, gpu_present, in_container};
pub use patterns::{RunnerEvent, RunnerLogPatterns};

use crate::error::{Error, Result};
use crate::platform::Driver;
use crate::types::RunnerRegistration;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::info;

/// Parameters for [`start_runner`]
#[derive(Debug, Clone)]
pub struct StartRunnerOptions {
    /// Directory holding the runner binary and build files
    pub workdir: PathBuf,
    /// How long the runner waits for a job before exiting
    pub idle_timeout: Duration,
    /// Exit after one job
    pub single: bool,
    /// Labels / tags to register with
    pub labels: Vec<String>,
    /// Runner name
    pub name: String,
    /// Extra volume mounts (`host:container[:mode]`) for containerized jobs
    pub docker_volumes: Vec<String>,
    /// Host facts; probed when `None`
    pub host: Option<HostInfo>,
}

/// Everything a driver needs to compose the launch command
#[derive(Debug)]
pub struct RunnerLaunch {
    /// Work directory
    pub workdir: PathBuf,
    /// Runner name
    pub name: String,
    /// Labels / tags
    pub labels: Vec<String>,
    /// Idle timeout
    pub idle_timeout: Duration,
    /// Exit after one job
    pub single: bool,
    /// Extra volume mounts
    pub docker_volumes: Vec<String>,
    /// Host facts (GPU image, executor choice)
    pub host: HostInfo,
    /// Provisioned runner executable, if any
    pub binary: Option<PathBuf>,
    /// One-time registration credentials, consumed by the command
    pub registration: RunnerRegistration,
}

/// A launched runner process
///
/// The child's stdout and stderr are piped. The log watcher must keep
/// reading `child.stdout` and `child.stderr`; once a pipe buffer fills the
/// runner blocks on its next write.
#[derive(Debug)]
pub struct RunnerProcess {
    /// Child process; not killed on drop
    pub child: Child,
    /// Runner name
    pub name: String,
    /// Runner ID, when the provider assigns one at registration
    pub runner_id: Option<String>,
    /// Patterns for classifying the runner's output
    pub patterns: &'static RunnerLogPatterns,
}

impl RunnerProcess {
    /// OS process ID, if still running
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Give up the wrapper and keep the raw child
    pub fn into_child(self) -> Child {
        self.child
    }
}

/// Provision, register and launch a runner
///
/// Every failure is wrapped in [`Error::RunnerSetup`]. A rejected
/// registration additionally carries the driver's operator hint.
pub async fn start_runner<D: Driver + ?Sized>(
    driver: &D,
    options: StartRunnerOptions,
) -> Result<RunnerProcess> {
    prepare_and_launch(driver, options)
        .await
        .map_err(|e| Error::RunnerSetup {
            provider: driver.provider(),
            source: Box::new(e),
        })
}

async fn prepare_and_launch<D: Driver + ?Sized>(
    driver: &D,
    options: StartRunnerOptions,
) -> Result<RunnerProcess> {
    if options.name.trim().is_empty() {
        return Err(Error::Config("runner name must not be empty".into()));
    }
    let StartRunnerOptions {
        workdir,
        idle_timeout,
        single,
        labels,
        name,
        docker_volumes,
        host,
    } = options;

    let host = match host {
        Some(host) => host,
        None => HostInfo::detect().await,
    };
    info!(provider = %driver.provider(), name = %name, gpu = host.gpu, "preparing runner");

    let binary = driver.runner_binary(&workdir);
    if let Some(ref binary) = binary {
        ensure_binary(driver.http(), binary, &workdir).await?;
    } else {
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| Error::resource(format!("creating {}", workdir.display()), e))?;
    }

    let registration = driver
        .register_runner(&name, &labels)
        .await
        .map_err(|e| match e {
            Error::Authentication { .. } => Error::RunnerRegistration {
                hint: driver.registration_hint(),
                source: Box::new(e),
            },
            other => other,
        })?;
    let runner_id = registration.id.clone();

    let command = driver
        .runner_launch_command(RunnerLaunch {
            workdir: workdir.clone(),
            name: name.clone(),
            labels,
            idle_timeout,
            single,
            docker_volumes,
            host,
            binary: binary.map(|b| b.path),
            registration,
        })
        .await?;

    let child = spawn_shell(&command, &workdir)?;
    info!(name = %name, pid = ?child.id(), "runner launched");

    Ok(RunnerProcess {
        child,
        name,
        runner_id,
        patterns: driver.runner_log_patterns(),
    })
}

fn spawn_shell(command: &str, workdir: &Path) -> Result<Child> {
    #[cfg(unix)]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    };

    cmd.current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false)
        .spawn()
        .map_err(|e| Error::resource("spawning runner process", e))
}
