//! `[base]` section configuration.
//!
//! Contains site identity and the runtime environment switch.

use super::defaults;
use educe::Educe;
use serde::{Deserialize, Serialize};

/// Runtime environment.
///
/// `local` keeps assets untransformed for fast reload and shows
/// work-in-progress documents; `prod` minifies assets and hides them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    #[default]
    Local,
    Prod,
}

/// `[base]` section in blogd.toml - site identity.
///
/// # Example
/// ```toml
/// [base]
/// title = "My Blog"
/// env = "prod"
/// ```
#[derive(Debug, Clone, Educe, Serialize, Deserialize)]
#[educe(Default)]
#[serde(deny_unknown_fields)]
pub struct BaseConfig {
    /// Site title displayed in browser tab and headers.
    #[serde(default = "defaults::base::title")]
    #[educe(Default = defaults::base::title())]
    pub title: String,

    /// Runtime environment (`local` or `prod`).
    #[serde(default)]
    pub env: Env,
}
