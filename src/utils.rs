//! Small shared helpers: url/path joining, timestamps, html escaping.

use anyhow::{Context, Result};
use regex::Regex;
use std::{
    path::{Component, Path, PathBuf},
    sync::LazyLock,
    time::UNIX_EPOCH,
};

static REMOTE_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:https?:)?//").unwrap());

/// Whether a target is a remote url (`http://`, `https://` or protocol-relative `//`).
pub fn is_remote_url(target: &str) -> bool {
    REMOTE_URL_RE.is_match(target)
}

/// Join a relative target against a base directory and resolve `.`/`..`
/// lexically. Absolute targets are returned as-is (normalized).
pub fn join_path(base_dir: &Path, target: &str) -> PathBuf {
    let raw = if Path::new(target).is_absolute() {
        PathBuf::from(target)
    } else {
        base_dir.join(target)
    };

    let mut joined = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                joined.pop();
            }
            other => joined.push(other),
        }
    }
    joined
}

/// File modification time in milliseconds since the unix epoch.
pub fn mtime_ms(path: &Path) -> Result<i64> {
    let modified = std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let duration = modified.duration_since(UNIX_EPOCH).unwrap_or_default();
    Ok(duration.as_millis() as i64)
}

/// Current wall clock in milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Escape text for embedding into html body or attribute context.
pub fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_remote_url() {
        assert!(is_remote_url("https://example.com/a.css"));
        assert!(is_remote_url("http://example.com"));
        assert!(is_remote_url("//cdn.example.com/lib.js"));
        assert!(!is_remote_url("./local.css"));
        assert!(!is_remote_url("/abs/path.js"));
    }

    #[test]
    fn test_join_path_relative() {
        let joined = join_path(Path::new("/docs/sub"), "../img/a.png");
        assert_eq!(joined, PathBuf::from("/docs/img/a.png"));
    }

    #[test]
    fn test_join_path_absolute_target() {
        let joined = join_path(Path::new("/docs"), "/etc/passwd");
        assert_eq!(joined, PathBuf::from("/etc/passwd"));
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(
            html_escape(r#"<a href="x">&'"#),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;"
        );
    }
}
