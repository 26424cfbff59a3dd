//! `[tracker]` section configuration.
//!
//! Credentials and host settings for the remote issue tracker used by the
//! document sync routines.

use super::defaults;
use educe::Educe;
use serde::{Deserialize, Serialize};

/// `[tracker]` section in blogd.toml - issue tracker account.
///
/// # Example
/// ```toml
/// [tracker]
/// name = "alice"
/// repo = "blog"
/// token = "ghp_..."
/// web_host = "blog.example.com"
/// ```
#[derive(Debug, Clone, Educe, Serialize, Deserialize)]
#[educe(Default)]
#[serde(deny_unknown_fields)]
pub struct TrackerConfig {
    /// API host of the tracker.
    #[serde(default = "defaults::tracker::api_host")]
    #[educe(Default = defaults::tracker::api_host())]
    pub api_host: String,

    /// Account name; also used to filter issues by creator.
    #[serde(default)]
    pub name: String,

    /// Repository holding the issues.
    #[serde(default)]
    pub repo: String,

    /// API token for basic auth.
    #[serde(default)]
    pub token: String,

    /// Public host of this blog, used when rewriting image links in
    /// pushed issue bodies.
    #[serde(default)]
    pub web_host: String,
}

impl TrackerConfig {
    /// Whether enough account information is present to talk to the API.
    pub fn is_configured(&self) -> bool {
        !self.name.is_empty() && !self.repo.is_empty()
    }
}
