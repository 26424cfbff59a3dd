//! Default values for configuration fields.
//!
//! Each section has its own submodule so serde `default = "..."` attributes
//! read naturally, e.g. `defaults::serve::port`.

pub const fn r#true() -> bool {
    true
}

pub mod base {
    pub fn title() -> String {
        "blog".into()
    }
}

pub mod serve {
    pub fn interface() -> String {
        "127.0.0.1".into()
    }

    pub const fn port() -> u16 {
        7001
    }
}

pub mod docs {
    use std::path::PathBuf;

    pub fn dir() -> PathBuf {
        "docs".into()
    }

    pub fn views() -> PathBuf {
        "views".into()
    }

    pub fn cache_file() -> PathBuf {
        ".cache/resources.json".into()
    }

    pub fn prefix() -> String {
        "/blog/".into()
    }

    pub fn static_prefix() -> String {
        "/public/".into()
    }

    pub fn tracker_dir() -> String {
        "tracker".into()
    }
}

pub mod tracker {
    pub fn api_host() -> String {
        "api.github.com".into()
    }
}
