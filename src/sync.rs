//! Bidirectional document sync with the remote issue tracker.
//!
//! One collection directory is bound to a tracker repository: each finished
//! markdown document maps to one issue. `pull` rewrites the whole directory
//! from the remote issue list; `push` sends locally modified documents back
//! as issue creates or updates, guided by the `syncTime` stamps kept in the
//! collection's `info.json` sidecar.
//!
//! A document is pushed only when its file mtime is past the recorded sync
//! time (or it was never synced), it has a title, it is not `[WIP]`, and
//! its body is long enough to be worth publishing. Sync stamps are written
//! slightly in the future so the sidecar write that follows a push does not
//! immediately re-qualify the file.

use crate::{
    config::SiteConfig,
    docs::{DirInfo, DocMeta, INFO_FILE},
    engine::markdown::md_info,
    log,
    utils::{is_remote_url, join_path, mtime_ms, now_ms},
};
use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        LazyLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// Margin added to sync stamps so the post-push file write stays older.
const SYNC_TIME_SKEW_MS: i64 = 100;

/// Bodies shorter than this are considered unfinished and never pushed.
const MIN_PUSH_BODY_LEN: usize = 100;

static IMG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]+)\)").unwrap());

// ============================================================================
// Tracker API client
// ============================================================================

/// An issue as returned by the tracker API.
#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub html_url: String,
    pub created_at: String,
    pub user: IssueUser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueUser {
    pub login: String,
}

/// Blocking client for the issue endpoints of the tracker API.
pub struct Tracker {
    config: &'static SiteConfig,
    client: reqwest::blocking::Client,
}

impl Tracker {
    pub fn new(config: &'static SiteConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("blogd/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        let tracker = &self.config.tracker;
        format!(
            "https://{}/repos/{}/{}/{path}",
            tracker.api_host, tracker.name, tracker.repo
        )
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder) -> Result<reqwest::blocking::Response> {
        let tracker = &self.config.tracker;
        let response = request
            .basic_auth(&tracker.name, Some(&tracker.token))
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()?;
        if !response.status().is_success() {
            bail!("tracker API returned {}", response.status());
        }
        Ok(response)
    }

}

/// The issue operations the syncer depends on. `Tracker` is the live
/// implementation; tests substitute their own.
pub trait IssueApi: Send + Sync {
    /// Issues created by the configured account, newest first.
    fn list_issues(&self) -> Result<Vec<Issue>>;

    /// Create a new issue.
    fn create_issue(&self, title: &str, body: &str) -> Result<Issue>;

    /// Update an existing issue.
    fn update_issue(&self, number: u64, title: &str, body: &str) -> Result<Issue>;
}

impl IssueApi for Tracker {
    fn list_issues(&self) -> Result<Vec<Issue>> {
        let url = self.url(&format!("issues?creator={}", self.config.tracker.name));
        let issues = self.send(self.client.get(url))?.json()?;
        Ok(issues)
    }

    fn create_issue(&self, title: &str, body: &str) -> Result<Issue> {
        let request = self
            .client
            .post(self.url("issues"))
            .json(&serde_json::json!({ "title": title, "body": body }));
        Ok(self.send(request)?.json()?)
    }

    fn update_issue(&self, number: u64, title: &str, body: &str) -> Result<Issue> {
        let request = self
            .client
            .patch(self.url(&format!("issues/{number}")))
            .json(&serde_json::json!({ "title": title, "body": body }));
        Ok(self.send(request)?.json()?)
    }
}

// ============================================================================
// Syncer
// ============================================================================

/// Document/issue synchronizer over the tracker collection directory.
/// At most one sync runs at a time; overlapping triggers are dropped.
pub struct Syncer {
    config: &'static SiteConfig,
    tracker: Box<dyn IssueApi>,
    busy: AtomicBool,
}

impl Syncer {
    pub fn new(config: &'static SiteConfig) -> Result<Self> {
        Ok(Self::with_api(config, Box::new(Tracker::new(config)?)))
    }

    fn with_api(config: &'static SiteConfig, tracker: Box<dyn IssueApi>) -> Self {
        Self {
            config,
            tracker,
            busy: AtomicBool::new(false),
        }
    }

    fn info_path(&self) -> PathBuf {
        self.config.tracker_dir().join(INFO_FILE)
    }

    /// Push local changes, unless a sync is already running.
    pub fn sync(&self) {
        if !self.begin() {
            return;
        }

        if let Err(err) = self.push() {
            log!("sync"; "push failed: {err:#}");
        }

        self.end();
    }

    /// Claim the sync slot. Returns false when a sync is already running.
    fn begin(&self) -> bool {
        !self.busy.swap(true, Ordering::SeqCst)
    }

    fn end(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    /// Rewrite the tracker collection from the remote issue list.
    ///
    /// Issues are materialized oldest-first as `issue1.md`, `issue2.md`, ...
    /// and the sidecar is rebuilt with fresh sync stamps. The sidecar's own
    /// title and weight survive the rewrite.
    pub fn pull(&self) -> Result<()> {
        let started = Instant::now();
        let dir = self.config.tracker_dir();
        fs::create_dir_all(&dir)?;

        let mut issues = self.tracker.list_issues()?;
        issues.retain(|issue| issue.user.login == self.config.tracker.name);
        issues.reverse();

        let mut info = load_info(&self.info_path()).unwrap_or_default();
        info.kind = Some("tracker".to_string());
        info.meta.clear();

        for (index, issue) in issues.iter().enumerate() {
            let name = format!("issue{}", index + 1);
            let body = issue.body.as_deref().unwrap_or_default();
            let content = format!("# {}\n{}", issue.title, body);
            fs::write(dir.join(format!("{name}.md")), content)?;
            info.meta.insert(name, meta_from_issue(issue));
        }

        fs::write(self.info_path(), serde_json::to_string_pretty(&info)?)?;
        log!("sync";
            "pull done, {} issues in {}ms",
            issues.len(),
            started.elapsed().as_millis()
        );

        Ok(())
    }

    /// Push locally modified documents to the tracker.
    ///
    /// A missing or malformed sidecar means local state is not trustworthy;
    /// the push is abandoned in favor of a fresh pull.
    pub fn push(&self) -> Result<()> {
        let info_path = self.info_path();
        let Some(mut info) = load_info(&info_path) else {
            log!("sync"; "unreadable sidecar {}, falling back to pull", info_path.display());
            return self.pull();
        };

        let dir = self.config.tracker_dir();
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
            .collect();
        files.sort();

        let mut has_update = false;
        for file in files {
            match self.push_file(&file, &mut info) {
                Ok(true) => has_update = true,
                Ok(false) => {}
                // One broken document must not stall the rest of the batch.
                Err(err) => log!("sync"; "push failed for {}: {err:#}", file.display()),
            }
        }

        if has_update {
            fs::write(&info_path, serde_json::to_string_pretty(&info)?)?;
        }

        Ok(())
    }

    /// Push a single document when it qualifies. Returns whether the
    /// sidecar was changed.
    fn push_file(&self, file: &Path, info: &mut DirInfo) -> Result<bool> {
        let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
            return Ok(false);
        };

        let meta = info.meta.get(stem).cloned().unwrap_or_default();
        if !is_newer(&meta, mtime_ms(file)?) {
            return Ok(false);
        }

        let Some(md) = md_info(file)? else {
            return Ok(false);
        };
        if md.title.is_empty() || md.is_wip || md.body.trim().len() < MIN_PUSH_BODY_LEN {
            return Ok(false);
        }

        let base_dir = file.parent().unwrap_or(Path::new("/"));
        let body = rewrite_images(
            &md.body,
            base_dir,
            self.config.doc_dir(),
            &self.config.tracker.web_host,
            &self.config.docs.static_prefix,
        );

        let issue = match meta.issue_id {
            Some(number) => self.tracker.update_issue(number, &md.title, &body)?,
            None => self.tracker.create_issue(&md.title, &body)?,
        };

        info.meta
            .insert(stem.to_string(), meta_from_issue(&issue));
        fs::write(file, format!("# {}\n\n{body}", md.title))?;
        log!("sync"; "pushed {} to issue {}", file.display(), issue.number);

        Ok(true)
    }
}

/// Sidecar meta derived from a tracker issue. The sync stamp sits slightly
/// in the future so the file write that follows stays older than it.
fn meta_from_issue(issue: &Issue) -> DocMeta {
    let ctime = chrono::DateTime::parse_from_rfc3339(&issue.created_at)
        .map(|time| time.timestamp_millis())
        .unwrap_or_default();

    DocMeta {
        origin_url: Some(issue.html_url.clone()),
        issue_id: Some(issue.number),
        sync_time: Some(now_ms() + SYNC_TIME_SKEW_MS),
        ctime: Some(ctime),
    }
}

/// Whether a document has local changes the tracker has not seen.
fn is_newer(meta: &DocMeta, mtime: i64) -> bool {
    match (meta.sync_time, meta.issue_id) {
        (Some(sync_time), Some(_)) => mtime > sync_time,
        _ => true,
    }
}

/// Replace local image targets with absolute urls under the public host.
/// Remote targets are left alone.
fn rewrite_images(
    body: &str,
    base_dir: &Path,
    doc_dir: &Path,
    web_host: &str,
    static_prefix: &str,
) -> String {
    IMG_RE
        .replace_all(body, |caps: &regex::Captures| {
            let (alt, src) = (&caps[1], &caps[2]);
            if is_remote_url(src) {
                return caps[0].to_string();
            }

            let resolved = join_path(base_dir, src);
            match resolved.strip_prefix(doc_dir) {
                Ok(rel) => format!(
                    "![{alt}](https://{web_host}{static_prefix}{})",
                    rel.display()
                ),
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Parse the sidecar; `None` when missing or malformed.
fn load_info(path: &Path) -> Option<DirInfo> {
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn issue(number: u64, title: &str, login: &str) -> Issue {
        Issue {
            number,
            title: title.into(),
            body: Some("remote body".into()),
            html_url: format!("https://tracker.example.com/i/{number}"),
            created_at: "2024-05-01T10:00:00Z".into(),
            user: IssueUser {
                login: login.into(),
            },
        }
    }

    /// In-memory tracker recording every call it receives.
    struct StubApi {
        issues: Vec<Issue>,
        fail_titles: Vec<&'static str>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl StubApi {
        fn new(issues: Vec<Issue>, fail_titles: Vec<&'static str>) -> (Self, Arc<Mutex<Vec<String>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let api = Self {
                issues,
                fail_titles,
                calls: Arc::clone(&calls),
            };
            (api, calls)
        }
    }

    impl IssueApi for StubApi {
        fn list_issues(&self) -> Result<Vec<Issue>> {
            self.calls.lock().push("list".into());
            Ok(self.issues.clone())
        }

        fn create_issue(&self, title: &str, _body: &str) -> Result<Issue> {
            self.calls.lock().push(format!("create {title}"));
            if self.fail_titles.contains(&title) {
                bail!("tracker rejected {title}");
            }
            Ok(issue(90 + self.calls.lock().len() as u64, title, "alice"))
        }

        fn update_issue(&self, number: u64, title: &str, _body: &str) -> Result<Issue> {
            self.calls.lock().push(format!("update {number}"));
            Ok(issue(number, title, "alice"))
        }
    }

    fn test_syncer(docs: &TempDir, api: StubApi) -> Syncer {
        let mut config = SiteConfig::default();
        config.docs.dir = docs.path().to_path_buf();
        config.tracker.name = "alice".into();
        config.tracker.repo = "blog".into();
        let config: &'static SiteConfig = Box::leak(Box::new(config));
        Syncer::with_api(config, Box::new(api))
    }

    fn tracker_dir(docs: &TempDir) -> PathBuf {
        let dir = docs.path().join("tracker");
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn read_info(dir: &Path) -> DirInfo {
        serde_json::from_str(&fs::read_to_string(dir.join(INFO_FILE)).unwrap()).unwrap()
    }

    #[test]
    fn test_push_skips_wip_short_and_clean_docs() {
        let docs = TempDir::new().unwrap();
        let dir = tracker_dir(&docs);
        let long = "x".repeat(120);
        fs::write(dir.join("wip.md"), format!("# [WIP] Draft\n\n{long}")).unwrap();
        fs::write(dir.join("short.md"), "# Short\n\ntiny body").unwrap();
        fs::write(dir.join("clean.md"), format!("# Clean\n\n{long}")).unwrap();
        let sync_time = now_ms() + 60_000;
        fs::write(
            dir.join(INFO_FILE),
            format!(r#"{{ "meta": {{ "clean": {{ "issueId": 5, "syncTime": {sync_time} }} }} }}"#),
        )
        .unwrap();

        let (api, calls) = StubApi::new(Vec::new(), Vec::new());
        let syncer = test_syncer(&docs, api);
        syncer.push().unwrap();

        // Nothing qualified, so the tracker was never contacted and the
        // sidecar kept its stamps.
        assert!(calls.lock().is_empty());
        let info = read_info(&dir);
        assert_eq!(info.meta["clean"].issue_id, Some(5));
        assert_eq!(info.meta["clean"].sync_time, Some(sync_time));
    }

    #[test]
    fn test_push_continues_after_one_doc_fails() {
        let docs = TempDir::new().unwrap();
        let dir = tracker_dir(&docs);
        let long = "x".repeat(120);
        fs::write(dir.join("a.md"), format!("# Alpha\n\n{long}")).unwrap();
        fs::write(dir.join("b.md"), format!("# Beta\n\n{long}")).unwrap();
        fs::write(dir.join(INFO_FILE), r#"{ "meta": {} }"#).unwrap();

        let (api, calls) = StubApi::new(Vec::new(), vec!["Alpha"]);
        let syncer = test_syncer(&docs, api);
        syncer.push().unwrap();

        // The failed first document does not stall the second one.
        assert_eq!(calls.lock().as_slice(), ["create Alpha", "create Beta"]);
        let info = read_info(&dir);
        assert!(info.meta.get("a").is_none());
        assert!(info.meta["b"].issue_id.is_some());
    }

    #[test]
    fn test_push_malformed_sidecar_falls_back_to_pull() {
        let docs = TempDir::new().unwrap();
        let dir = tracker_dir(&docs);
        fs::write(dir.join(INFO_FILE), "not json").unwrap();

        let (api, calls) = StubApi::new(
            vec![issue(7, "Remote", "alice"), issue(8, "Other", "bob")],
            Vec::new(),
        );
        let syncer = test_syncer(&docs, api);
        syncer.push().unwrap();

        assert_eq!(calls.lock().as_slice(), ["list"]);
        // Only the configured account's issues are materialized.
        let content = fs::read_to_string(dir.join("issue1.md")).unwrap();
        assert!(content.starts_with("# Remote"));
        assert!(!dir.join("issue2.md").exists());
        let info = read_info(&dir);
        assert_eq!(info.meta["issue1"].issue_id, Some(7));
    }

    #[test]
    fn test_is_newer_never_synced() {
        assert!(is_newer(&DocMeta::default(), 0));
        assert!(is_newer(
            &DocMeta {
                sync_time: Some(1_000),
                ..Default::default()
            },
            0
        ));
        assert!(is_newer(
            &DocMeta {
                issue_id: Some(1),
                ..Default::default()
            },
            0
        ));
    }

    #[test]
    fn test_is_newer_compares_mtime_to_sync_time() {
        let meta = DocMeta {
            issue_id: Some(1),
            sync_time: Some(1_000),
            ..Default::default()
        };

        assert!(!is_newer(&meta, 999));
        assert!(!is_newer(&meta, 1_000));
        assert!(is_newer(&meta, 1_001));
    }

    #[test]
    fn test_rewrite_images_local() {
        let body = "intro\n![shot](./img/shot.png)\noutro";
        let out = rewrite_images(
            body,
            Path::new("/docs/tracker"),
            Path::new("/docs"),
            "blog.example.com",
            "/public/",
        );

        assert!(out.contains(
            "![shot](https://blog.example.com/public/tracker/img/shot.png)"
        ));
    }

    #[test]
    fn test_rewrite_images_keeps_remote_and_foreign() {
        let body = "![a](https://cdn.example.com/a.png) ![b](../../etc/b.png)";
        let out = rewrite_images(
            body,
            Path::new("/docs/tracker"),
            Path::new("/docs"),
            "blog.example.com",
            "/public/",
        );

        // Remote urls and paths escaping the document root are untouched.
        assert_eq!(out, body);
    }

    #[test]
    fn test_rewrite_images_empty_alt() {
        let out = rewrite_images(
            "![](./a.png)",
            Path::new("/docs/tracker"),
            Path::new("/docs"),
            "h",
            "/p/",
        );
        assert_eq!(out, "![](https://h/p/tracker/a.png)");
    }

    #[test]
    fn test_overlapping_sync_is_dropped() {
        let config: &'static SiteConfig = Box::leak(Box::new(SiteConfig::default()));
        let syncer = Syncer::new(config).unwrap();

        assert!(syncer.begin());
        // A second trigger while the first runs is a no-op.
        assert!(!syncer.begin());
        syncer.end();
        assert!(syncer.begin());
    }

    #[test]
    fn test_meta_from_issue() {
        let issue = Issue {
            number: 12,
            title: "T".into(),
            body: Some("b".into()),
            html_url: "https://tracker.example.com/i/12".into(),
            created_at: "2024-05-01T10:00:00Z".into(),
            user: IssueUser {
                login: "alice".into(),
            },
        };

        let before = now_ms();
        let meta = meta_from_issue(&issue);

        assert_eq!(meta.issue_id, Some(12));
        assert_eq!(meta.origin_url.as_deref(), Some("https://tracker.example.com/i/12"));
        assert_eq!(meta.ctime, Some(1_714_557_600_000));
        assert!(meta.sync_time.unwrap() >= before + SYNC_TIME_SKEW_MS);
    }
}
