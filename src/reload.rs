//! Live reload over websocket.
//!
//! The notifier keeps a manifest from source file to the pages rendered
//! from it. The render hook feeds it: after every page render the ordered
//! source list is folded in, and each entry remembers how many local
//! stylesheets preceded it on that page. That count is the position of the
//! page's matching `<style>` element, letting the client hot-swap a single
//! stylesheet without a reload.
//!
//! A notify watcher over the view and document trees drives change
//! delivery: debounced changes are looked up in the manifest and pushed to
//! every connected `/hmr` websocket. Style changes ship the recompiled css
//! inline; anything else makes affected clients reload.

use crate::{
    config::SiteConfig,
    docs::DocIndex,
    engine::{Engine, RenderNotice},
    log,
    utils::is_remote_url,
};
use anyhow::{Context, Result};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tungstenite::{Message, WebSocket};

const DEBOUNCE_MS: u64 = 300;

type Socket = WebSocket<Box<dyn tiny_http::ReadWrite + Send>>;

/// One page that uses a given source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub req_path: String,
    /// Count of local stylesheets preceding this source on the page, i.e.
    /// the index of the page's `<style>` element for a style source.
    pub style_index: usize,
}

/// Payload sent to clients on a source change.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReloadPayload<'a> {
    urls: &'a [ManifestEntry],
    change_path: &'a str,
    /// Recompiled css for style changes; absent otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    style: Option<String>,
}

/// Source-to-pages manifest plus the connected websocket clients.
#[derive(Default)]
pub struct Notifier {
    manifest: RwLock<FxHashMap<String, Vec<ManifestEntry>>>,
    sockets: Mutex<Vec<Socket>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a finished render into the manifest.
    pub fn record(&self, notice: &RenderNotice) {
        let mut manifest = self.manifest.write();
        let mut style_index = 0;

        for source in &notice.sources {
            let entries = manifest.entry(source.clone()).or_default();
            match entries
                .iter_mut()
                .find(|entry| entry.req_path == notice.req_path)
            {
                Some(entry) => entry.style_index = style_index,
                None => entries.push(ManifestEntry {
                    req_path: notice.req_path.clone(),
                    style_index,
                }),
            }

            if is_local_style(source) {
                style_index += 1;
            }
        }
    }

    /// Adopt a freshly upgraded `/hmr` connection.
    pub fn attach(&self, socket: Socket) {
        self.sockets.lock().push(socket);
    }

    /// Notify clients about a changed source file. Style changes carry the
    /// recompiled css so clients can swap it in place.
    pub fn handle_change(&self, path: &Path, engine: &Engine) {
        let key = path.to_string_lossy();
        let urls = match self.manifest.read().get(key.as_ref()) {
            Some(entries) if !entries.is_empty() => entries.clone(),
            _ => return,
        };

        let style = if is_local_style(&key) {
            match engine.read_resource(path) {
                Ok(css) => Some(css),
                Err(err) => {
                    log!("reload"; "style recompile failed for {key}: {err:#}");
                    None
                }
            }
        } else {
            None
        };

        let payload = ReloadPayload {
            urls: &urls,
            change_path: &key,
            style,
        };
        match serde_json::to_string(&payload) {
            Ok(json) => self.broadcast(&json),
            Err(err) => log!("reload"; "payload encode failed: {err}"),
        }
    }

    /// Send to every client, dropping the ones that are gone.
    fn broadcast(&self, json: &str) {
        self.sockets
            .lock()
            .retain_mut(|socket| socket.send(Message::text(json.to_string())).is_ok());
    }

    #[cfg(test)]
    fn entries_for(&self, source: &str) -> Vec<ManifestEntry> {
        self.manifest
            .read()
            .get(source)
            .cloned()
            .unwrap_or_default()
    }
}

/// Local stylesheet sources occupy a `<style>` slot on the page.
fn is_local_style(url: &str) -> bool {
    !is_remote_url(url) && (url.ends_with(".css") || url.ends_with(".scss"))
}

// =============================================================================
// Watcher
// =============================================================================

/// Check if path is a temp/backup file (editor artifacts).
fn is_temp_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    matches!(ext, "bck" | "bak" | "backup" | "swp" | "swo" | "tmp")
        || name.ends_with('~')
        || name.starts_with('.')
}

/// Batches rapid file events before delivery.
struct Debouncer {
    pending: FxHashSet<PathBuf>,
    last_event: Option<Instant>,
}

impl Debouncer {
    fn new() -> Self {
        Self {
            pending: FxHashSet::default(),
            last_event: None,
        }
    }

    fn add(&mut self, event: Event) {
        for path in event.paths {
            if !is_temp_file(&path) {
                self.pending.insert(path);
            }
        }
        self.last_event = Some(Instant::now());
    }

    fn ready(&self) -> bool {
        !self.pending.is_empty()
            && self
                .last_event
                .is_some_and(|t| t.elapsed() >= Duration::from_millis(DEBOUNCE_MS))
    }

    fn take(&mut self) -> Vec<PathBuf> {
        self.last_event = None;
        self.pending.drain().collect()
    }

    fn timeout(&self) -> Duration {
        if self.pending.is_empty() {
            Duration::from_secs(60)
        } else {
            Duration::from_millis(DEBOUNCE_MS)
        }
    }
}

const fn is_relevant(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    )
}

/// Start the blocking file watcher over the view and document trees.
///
/// Markdown changes additionally run sidecar maintenance in local mode,
/// keeping listing ctimes current while writing.
pub fn watch_blocking(
    config: &'static SiteConfig,
    engine: Arc<Engine>,
    docs: Arc<DocIndex>,
    notifier: Arc<Notifier>,
) -> Result<()> {
    if !config.serve.watch {
        return Ok(());
    }

    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher = notify::recommended_watcher(tx).context("failed to create file watcher")?;
    for dir in [config.views_dir(), config.doc_dir()] {
        if dir.exists() {
            watcher
                .watch(dir, RecursiveMode::Recursive)
                .with_context(|| format!("failed to watch {}", dir.display()))?;
        }
    }
    log!("watch"; "watching {} and {}", config.views_dir().display(), config.doc_dir().display());

    let mut debouncer = Debouncer::new();
    loop {
        match rx.recv_timeout(debouncer.timeout()) {
            Ok(Ok(event)) if is_relevant(&event) => debouncer.add(event),
            Ok(Err(err)) => log!("watch"; "error: {err}"),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) if debouncer.ready() => {
                for path in debouncer.take() {
                    if config.is_local()
                        && path.starts_with(config.doc_dir())
                        && let Err(err) = docs.sync_meta(Some(&path))
                    {
                        log!("watch"; "sidecar update failed for {}: {err:#}", path.display());
                    }
                    notifier.handle_change(&path, &engine);
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            _ => {}
        }
    }

    Ok(())
}
