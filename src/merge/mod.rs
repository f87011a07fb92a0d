//! Merge automation
//!
//! Asks the provider to merge a PR/MR once its pipeline succeeds, retrying
//! transient failures with exponential backoff. When that path is exhausted
//! or unsupported, falls back to a single unconditional merge.

mod auto;
mod retry;

pub use auto::{AutoMergeOutcome, AutoMergeRequest, auto_merge};
pub(crate) use auto::unsupported_mode;
pub use retry::{RetryPolicy, retry_with_backoff};
