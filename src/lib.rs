//! forge-driver: CI automation drivers for GitHub, GitLab and Bitbucket
//!
//! One [`Driver`] contract covers commit and PR comments, check runs, asset
//! uploads, pull requests, pipeline re-runs, self-hosted runners and merge
//! automation across the three providers. Self-hosted GitLab and GitHub
//! Enterprise instances mounted under a sub-path are discovered
//! automatically.
//!
//! ```no_run
//! use forge_driver::{DriverConfig, create_driver};
//!
//! # async fn example() -> forge_driver::Result<()> {
//! let config = DriverConfig::detect("https://gitlab.com/group/project", "glpat-...")?;
//! let driver = create_driver(config)?;
//! let url = driver.create_comment("9fceb02", "Report attached").await?;
//! println!("{url}");
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod merge;
pub mod platform;
pub mod runner;
pub mod types;

pub use config::DriverConfig;
pub use error::{Error, Result};
pub use merge::{AutoMergeOutcome, AutoMergeRequest, RetryPolicy, auto_merge};
pub use platform::{
    BitbucketDriver, Driver, GitHubDriver, GitLabDriver, create_driver, detect_provider,
};
pub use runner::{RunnerProcess, StartRunnerOptions, start_runner};
pub use types::*;
