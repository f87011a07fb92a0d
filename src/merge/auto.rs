//! Auto-merge with immediate-merge fallback

use super::retry::retry_with_backoff;
use crate::error::{Error, Result};
use crate::platform::Driver;
use crate::types::{MergeMode, Provider};
use tracing::{debug, warn};

/// Parameters for [`auto_merge`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoMergeRequest {
    /// PR/MR number
    pub pr_number: u64,
    /// Merge strategy
    pub mode: MergeMode,
    /// Commit message for the merge or squash commit
    pub message: Option<String>,
}

/// How the PR ended up being handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoMergeOutcome {
    /// The provider will merge once the pipeline succeeds
    Scheduled,
    /// Auto-merge could not be enabled; the PR was merged right away
    MergedImmediately,
}

/// Error for a merge mode the provider cannot auto-merge with
pub(crate) const fn unsupported_mode(provider: Provider, mode: MergeMode) -> Error {
    let operation = match mode {
        MergeMode::Merge => "merge auto-merge mode",
        MergeMode::Squash => "squash auto-merge mode",
        MergeMode::Rebase => "rebase auto-merge mode",
    };
    Error::unsupported(provider, operation)
}

/// Enable auto-merge on a PR, degrading to an immediate merge
///
/// Unsupported merge modes fail before any request is made. The gated
/// request is retried on transient failures per the driver's retry policy.
/// Once it is exhausted (or the provider has no gated merge) a single
/// unconditional merge is attempted; its failure is returned as
/// [`Error::AutoMergeFallback`] and not retried. Rejected credentials are
/// returned as-is without a fallback.
pub async fn auto_merge<D: Driver + ?Sized>(
    driver: &D,
    request: &AutoMergeRequest,
) -> Result<AutoMergeOutcome> {
    if !driver.supports_merge_mode(request.mode) {
        return Err(unsupported_mode(driver.provider(), request.mode));
    }

    let pr_number = request.pr_number;
    let message = request.message.as_deref();
    debug!(pr_number, mode = %request.mode, "enabling auto-merge");

    let primary = retry_with_backoff(driver.retry_policy(), |attempt| {
        debug!(pr_number, attempt, "requesting merge when pipeline succeeds");
        driver.enable_auto_merge(pr_number, request.mode, message)
    })
    .await;

    let primary = match primary {
        Ok(()) => {
            debug!(pr_number, "auto-merge enabled");
            return Ok(AutoMergeOutcome::Scheduled);
        }
        Err(e @ Error::Authentication { .. }) => return Err(e),
        Err(e) => e,
    };

    warn!(pr_number, error = %primary, "failed to enable auto-merge, merging immediately");

    match driver.merge_now(pr_number, request.mode, message).await {
        Ok(()) => {
            debug!(pr_number, "merged immediately");
            Ok(AutoMergeOutcome::MergedImmediately)
        }
        Err(fallback) => {
            warn!(pr_number, error = %fallback, "immediate merge failed");
            Err(Error::AutoMergeFallback {
                primary: Box::new(primary),
                fallback: Box::new(fallback),
            })
        }
    }
}
