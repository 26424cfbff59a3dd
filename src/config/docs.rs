//! `[docs]` section configuration.
//!
//! Paths of the managed document tree, the template view directory, the
//! resource cache snapshot, and the public URL layout.

use super::defaults;
use educe::Educe;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};

/// `[docs]` section in blogd.toml - document tree and URL layout.
///
/// # Example
/// ```toml
/// [docs]
/// dir = "docs"
/// views = "views"
/// prefix = "/blog/"
/// static_prefix = "/public/"
/// tracker_dir = "tracker"
///
/// [docs.forward]
/// "/" = "/blog/tracker"
/// ```
#[derive(Debug, Clone, Educe, Serialize, Deserialize)]
#[educe(Default)]
#[serde(deny_unknown_fields)]
pub struct DocsConfig {
    /// Document root directory (relative to project root).
    #[serde(default = "defaults::docs::dir")]
    #[educe(Default = defaults::docs::dir())]
    pub dir: PathBuf,

    /// Template view base directory (relative to project root).
    #[serde(default = "defaults::docs::views")]
    #[educe(Default = defaults::docs::views())]
    pub views: PathBuf,

    /// Resource cache snapshot file (relative to project root).
    #[serde(default = "defaults::docs::cache_file")]
    #[educe(Default = defaults::docs::cache_file())]
    pub cache_file: PathBuf,

    /// URL prefix for rendered documents.
    #[serde(default = "defaults::docs::prefix")]
    #[educe(Default = defaults::docs::prefix())]
    pub prefix: String,

    /// URL prefix for static assets served out of the document root.
    #[serde(default = "defaults::docs::static_prefix")]
    #[educe(Default = defaults::docs::static_prefix())]
    pub static_prefix: String,

    /// Subdirectory of `dir` that is synchronized with the issue tracker.
    #[serde(default = "defaults::docs::tracker_dir")]
    #[educe(Default = defaults::docs::tracker_dir())]
    pub tracker_dir: String,

    /// Request-path forwarding map (e.g. `"/" = "/blog/tracker"`).
    #[serde(default)]
    pub forward: BTreeMap<String, String>,
}
