//! Runner binary provisioning

use crate::error::{Error, Result};
use crate::http::RequestClient;
use flate2::read::GzDecoder;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// How the downloaded artifact is laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    /// The download is the executable itself
    Executable,
    /// A `.tar.gz` archive unpacked into the work directory
    TarGz,
}

/// Where a provider's runner comes from and where it lands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerBinary {
    /// Download URL
    pub url: String,
    /// Executable whose presence means no download is needed
    pub path: PathBuf,
    /// Artifact layout
    pub kind: BinaryKind,
}

/// Download the runner unless its executable already exists
///
/// Returns whether a download happened.
pub async fn ensure_binary(
    http: &RequestClient,
    binary: &RunnerBinary,
    workdir: &Path,
) -> Result<bool> {
    if tokio::fs::try_exists(&binary.path).await.unwrap_or(false) {
        debug!(path = %binary.path.display(), "runner binary present");
        return Ok(false);
    }

    tokio::fs::create_dir_all(workdir)
        .await
        .map_err(|e| Error::resource(format!("creating {}", workdir.display()), e))?;

    info!(url = %binary.url, "downloading runner");
    let bytes = http.download(&binary.url).await?;

    match binary.kind {
        BinaryKind::Executable => {
            tokio::fs::write(&binary.path, &bytes)
                .await
                .map_err(|e| Error::resource(format!("writing {}", binary.path.display()), e))?;
        }
        BinaryKind::TarGz => {
            let dest = workdir.to_path_buf();
            tokio::task::spawn_blocking(move || unpack_tar_gz(&bytes, &dest))
                .await
                .map_err(|e| Error::resource("unpacking runner archive", std::io::Error::other(e)))??;
        }
    }

    make_executable(&binary.path)?;
    info!(path = %binary.path.display(), "runner binary ready");
    Ok(true)
}

fn unpack_tar_gz(bytes: &[u8], dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    archive
        .unpack(dest)
        .map_err(|e| Error::resource(format!("unpacking runner into {}", dest.display()), e))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| Error::resource(format!("marking {} executable", path.display()), e))
}

#[cfg(not(unix))]
fn make_executable(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(Error::resource(
            format!("runner executable {} missing", path.display()),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        ))
    }
}
