//! Site configuration management for `blogd.toml`.
//!
//! # Sections
//!
//! | Section     | Purpose                                       |
//! |-------------|-----------------------------------------------|
//! | `[base]`    | Site identity and environment (local/prod)    |
//! | `[serve]`   | Server settings (port, interface, watch)      |
//! | `[docs]`    | Document tree, views, cache file, URL layout  |
//! | `[tracker]` | Issue tracker account for document sync       |
//!
//! # Example
//!
//! ```toml
//! [base]
//! title = "My Blog"
//! env = "local"
//!
//! [serve]
//! port = 7001
//!
//! [docs]
//! dir = "docs"
//! views = "views"
//!
//! [docs.forward]
//! "/" = "/blog/tracker"
//!
//! [tracker]
//! name = "alice"
//! repo = "blog"
//! ```

mod base;
pub mod defaults;
mod docs;
mod error;
mod serve;
mod tracker;

pub use base::Env;
pub use tracker::TrackerConfig;

use base::BaseConfig;
use docs::DocsConfig;
use error::ConfigError;
use serve::ServeConfig;

use crate::cli::{Cli, Commands};
use anyhow::Result;
use educe::Educe;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Component, Path, PathBuf},
};

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration structure representing blogd.toml
#[derive(Debug, Clone, Educe, Serialize, Deserialize)]
#[educe(Default)]
#[serde(deny_unknown_fields)]
pub struct SiteConfig {
    /// Project root directory (set after loading)
    #[serde(skip)]
    pub root: PathBuf,

    /// Absolute path to the config file (set after loading)
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Site identity
    #[serde(default)]
    pub base: BaseConfig,

    /// Server settings
    #[serde(default)]
    pub serve: ServeConfig,

    /// Document tree and URL layout
    #[serde(default)]
    pub docs: DocsConfig,

    /// Issue tracker account
    #[serde(default)]
    pub tracker: TrackerConfig,
}

impl SiteConfig {
    /// Parse configuration from TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: SiteConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration from file path
    pub fn from_path(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;
        Self::from_str(&content)
    }

    /// Update configuration with CLI arguments and normalize paths.
    pub fn update_with_cli(&mut self, cli: &Cli) {
        let root = cli
            .root
            .as_deref()
            .unwrap_or(Path::new("./"))
            .to_path_buf();
        let root = normalize_path(&root);

        self.config_path = normalize_path(&root.join(&cli.config));
        self.docs.dir = normalize_path(&root.join(&self.docs.dir));
        self.docs.views = normalize_path(&root.join(&self.docs.views));
        self.docs.cache_file = normalize_path(&root.join(&self.docs.cache_file));
        self.root = root;

        if let Commands::Serve {
            interface,
            port,
            watch,
        } = &cli.command
        {
            update_option(&mut self.serve.interface, interface.as_ref());
            update_option(&mut self.serve.port, port.as_ref());
            update_option(&mut self.serve.watch, watch.as_ref());
        }
    }

    /// Validate paths and addresses before running a command.
    pub fn validate(&self) -> Result<()> {
        if self.serve.interface.parse::<std::net::IpAddr>().is_err() {
            return Err(ConfigError::Interface(self.serve.interface.clone()).into());
        }
        if !self.docs.dir.is_dir() {
            return Err(ConfigError::MissingDocDir(self.docs.dir.clone()).into());
        }
        if !self.docs.views.is_dir() {
            return Err(ConfigError::MissingViewDir(self.docs.views.clone()).into());
        }
        Ok(())
    }

    /// Whether the server runs in local (development) mode.
    pub fn is_local(&self) -> bool {
        self.base.env == Env::Local
    }

    /// Absolute document root directory.
    pub fn doc_dir(&self) -> &Path {
        &self.docs.dir
    }

    /// Absolute template view base directory.
    pub fn views_dir(&self) -> &Path {
        &self.docs.views
    }

    /// Absolute path of the tracker-synchronized document directory.
    pub fn tracker_dir(&self) -> PathBuf {
        self.docs.dir.join(&self.docs.tracker_dir)
    }

    /// Absolute path of the resource cache snapshot.
    pub fn cache_path(&self) -> &Path {
        &self.docs.cache_file
    }
}

/// Update config option if CLI value is provided
fn update_option<T: Clone>(config_option: &mut T, cli_option: Option<&T>) {
    if let Some(option) = cli_option {
        *config_option = option.clone();
    }
}

/// Lexically normalize a path: make absolute against the current directory
/// and resolve `.`/`..` components without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_resolves_dots() {
        let normalized = normalize_path(Path::new("/a/b/../c/./d"));
        assert_eq!(normalized, PathBuf::from("/a/c/d"));
    }

    #[test]
    fn test_normalize_path_relative_becomes_absolute() {
        let normalized = normalize_path(Path::new("docs"));
        assert!(normalized.is_absolute());
        assert!(normalized.ends_with("docs"));
    }

    #[test]
    fn test_full_config_roundtrip() {
        let content = r#"
            [base]
            title = "Test"
            env = "prod"

            [serve]
            port = 3000

            [docs]
            dir = "documents"

            [tracker]
            name = "alice"
            repo = "blog"
        "#;
        let config = SiteConfig::from_str(content).unwrap();

        assert_eq!(config.base.title, "Test");
        assert!(!config.is_local());
        assert_eq!(config.serve.port, 3000);
        assert_eq!(config.docs.dir, PathBuf::from("documents"));
        assert_eq!(config.tracker.name, "alice");
    }

    #[test]
    fn test_unknown_section_rejection() {
        let result = SiteConfig::from_str("[unknown]\nfoo = 1");
        assert!(result.is_err());
    }
}
