//! Driver construction

use crate::config::DriverConfig;
use crate::error::Result;
use crate::platform::{BitbucketDriver, Driver, GitHubDriver, GitLabDriver};
use crate::types::Provider;
use tracing::debug;

/// Create the driver for the configured provider
///
/// No network call is made; the API base is resolved on first use.
pub fn create_driver(config: DriverConfig) -> Result<Box<dyn Driver>> {
    debug!(provider = %config.provider, repository = %config.repository.url(), "creating driver");
    Ok(match config.provider {
        Provider::GitHub => Box::new(GitHubDriver::new(config)?),
        Provider::GitLab => Box::new(GitLabDriver::new(config)?),
        Provider::Bitbucket => Box::new(BitbucketDriver::new(config)?),
    })
}
