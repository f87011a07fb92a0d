//! Local host probing: GPU presence and container detection

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Facts about the machine the runner is launched on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostInfo {
    /// An NVIDIA GPU is usable (`nvidia-smi` succeeds)
    pub gpu: bool,
    /// This process already runs inside a container
    pub in_container: bool,
}

impl HostInfo {
    /// Probe the current host
    pub async fn detect() -> Self {
        let info = Self {
            gpu: gpu_present().await,
            in_container: in_container(),
        };
        debug!(gpu = info.gpu, in_container = info.in_container, "probed host");
        info
    }
}

/// Whether `nvidia-smi` runs successfully
pub async fn gpu_present() -> bool {
    Command::new("nvidia-smi")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|status| status.success())
}

/// Whether this process runs inside a Docker/Podman/Kubernetes container
pub fn in_container() -> bool {
    let marker_file =
        Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists();
    let cgroup = std::fs::read_to_string("/proc/1/cgroup").ok();
    container_detected(marker_file, cgroup.as_deref())
}

fn container_detected(marker_file: bool, cgroup: Option<&str>) -> bool {
    marker_file || cgroup.is_some_and(cgroup_indicates_container)
}

fn cgroup_indicates_container(cgroup: &str) -> bool {
    ["docker", "kubepods", "containerd", "libpod"]
        .iter()
        .any(|marker| cgroup.contains(marker))
}
