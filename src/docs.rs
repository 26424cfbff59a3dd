//! Document indexer.
//!
//! The document tree is one directory per collection, each holding markdown
//! files and an optional `info.json` sidecar:
//!
//! ```json
//! {
//!   "title": "Notes",
//!   "weight": 10,
//!   "meta": { "post-name": { "ctime": 1700000000000 } }
//! }
//! ```
//!
//! Listings merge per-file sidecar meta over the markdown front-line info,
//! hide `[WIP]` documents outside local mode, and sort newest first. Both
//! the directory scan and the per-file info go through the [`FileCache`],
//! so a listing render touches no markdown file that has not changed.
//!
//! `sync_meta` is the sidecar maintainer: it stamps a `ctime` for each
//! finished document on first sight, drops the stamp when a document
//! regresses to `[WIP]`, and removes meta for deleted files.

use crate::{
    cache::FileCache,
    config::SiteConfig,
    engine::markdown::md_info,
    log,
    utils::mtime_ms,
};
use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// Sidecar file name kept next to the markdown files of a collection.
pub const INFO_FILE: &str = "info.json";

// ============================================================================
// Sidecar types
// ============================================================================

/// Per-document sidecar meta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocMeta {
    /// Tracker page url, present for synced documents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_url: Option<String>,
    /// Remote issue number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<u64>,
    /// Last push/pull time; documents modified after it get pushed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_time: Option<i64>,
    /// Display time. Absent while the document is work in progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctime: Option<i64>,
}

/// A collection's `info.json` sidecar. The `doc_len`, `doc_link` and
/// `real_link` fields are computed at read time and never written back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DirInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Collection kind marker (e.g. `"tracker"` for the synced directory).
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Ordering weight for the collection index; higher sorts first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
    pub meta: BTreeMap<String, DocMeta>,

    /// Count of finished (ctime-stamped) documents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_len: Option<usize>,
    /// Public link, after forwarding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_link: Option<String>,
    /// Public link before forwarding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_link: Option<String>,
}

/// One document in a collection listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocEntry {
    /// Absolute path of the markdown source.
    pub file_url: String,
    /// Public `.html` link under the document url prefix.
    pub link: String,
    pub title: String,
    #[serde(rename = "isWIP")]
    pub is_wip: bool,
    /// Sidecar ctime when stamped, file mtime otherwise.
    pub ctime: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<u64>,
}

/// A rendered collection: its documents (newest first) plus sidecar info.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirListing {
    pub doc_list: Vec<DocEntry>,
    pub doc_info: DirInfo,
}

// ============================================================================
// Indexer
// ============================================================================

/// Indexer over the managed document tree. Shares the process-wide cache.
pub struct DocIndex {
    config: &'static SiteConfig,
    cache: FileCache,
    /// Inverse of the configured forward map: real link to public link.
    forward_inverse: FxHashMap<String, String>,
}

impl DocIndex {
    pub fn new(config: &'static SiteConfig, cache: FileCache) -> Self {
        let forward_inverse = config
            .docs
            .forward
            .iter()
            .map(|(public, real)| (real.clone(), public.clone()))
            .collect();

        Self {
            config,
            cache,
            forward_inverse,
        }
    }

    /// List a collection directory: markdown entries merged with sidecar
    /// meta, WIP-filtered outside local mode, sorted newest first.
    pub fn dir_listing(&self, dir: &Path) -> Result<DirListing> {
        let names = self.md_names(dir)?;
        let doc_info = self.read_info(dir)?.unwrap_or_default();

        let mut doc_list = Vec::with_capacity(names.len());
        for name in &names {
            let file = dir.join(name);
            let stem = name.trim_end_matches(".md");
            let meta = doc_info.meta.get(stem).cloned().unwrap_or_default();
            doc_list.push(self.doc_entry(&file, meta)?);
        }

        if !self.config.is_local() {
            doc_list.retain(|doc| !doc.is_wip);
        }
        doc_list.sort_by_key(|doc| std::cmp::Reverse(doc.ctime));

        Ok(DirListing { doc_list, doc_info })
    }

    /// Read a collection's sidecar, with links and document count filled
    /// in. `Ok(None)` when the directory carries no sidecar.
    pub fn read_info(&self, dir: &Path) -> Result<Option<DirInfo>> {
        let info_path = dir.join(INFO_FILE);
        if !info_path.exists() {
            return Ok(None);
        }

        let real_link = self.dir_link(dir);
        let doc_link = self
            .forward_inverse
            .get(&real_link)
            .cloned()
            .unwrap_or_else(|| real_link.clone());

        let json = self.cache.wrap(&info_path, || {
            let text = fs::read_to_string(&info_path)
                .with_context(|| format!("failed to read {}", info_path.display()))?;
            let mut info: DirInfo = serde_json::from_str(&text)
                .with_context(|| format!("malformed sidecar {}", info_path.display()))?;

            info.doc_len = Some(
                info.meta
                    .values()
                    .filter(|meta| meta.ctime.is_some())
                    .count(),
            );
            info.real_link = Some(real_link.clone());
            info.doc_link = Some(doc_link.clone());

            Ok(serde_json::to_string(&info)?)
        })?;

        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Sidecar info of every collection that has a title and at least one
    /// finished document, sorted by descending weight.
    pub fn read_all_info(&self) -> Result<Vec<DirInfo>> {
        let mut all = Vec::new();
        for entry in fs::read_dir(self.config.doc_dir())? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(info) = self.read_info(&entry.path())? {
                all.push(info);
            }
        }

        all.retain(|info| info.title.is_some() && info.doc_len.unwrap_or(0) > 0);
        all.sort_by_key(|info| std::cmp::Reverse(info.weight.unwrap_or(0)));
        Ok(all)
    }

    /// Maintain sidecars after a file change. `changed` scopes the pass to
    /// one file; `None` walks the whole document tree. Non-markdown changes
    /// are ignored.
    pub fn sync_meta(&self, changed: Option<&Path>) -> Result<()> {
        let files: Vec<PathBuf> = match changed {
            Some(path) if path.extension().is_some_and(|ext| ext == "md") => {
                vec![path.to_path_buf()]
            }
            Some(_) => return Ok(()),
            None => WalkDir::new(self.config.doc_dir())
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "md"))
                .map(|entry| entry.into_path())
                .collect(),
        };

        // Sidecars grouped by directory; only dirty ones are written back.
        let mut sidecars: FxHashMap<PathBuf, (DirInfo, bool)> = FxHashMap::default();

        for file in files {
            let Some(dir) = file.parent() else { continue };
            let info_path = dir.join(INFO_FILE);
            let (info, dirty) = sidecars
                .entry(info_path.clone())
                .or_insert_with(|| (load_sidecar(&info_path), false));

            let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            if file.exists() {
                let is_wip = md_info(&file)?.is_some_and(|md| md.is_wip);
                let meta = info.meta.entry(stem.to_string()).or_default();
                if !is_wip && meta.ctime.is_none() {
                    meta.ctime = Some(mtime_ms(&file)?);
                } else if is_wip && meta.ctime.is_some() {
                    meta.ctime = None;
                } else {
                    continue;
                }
            } else if info.meta.remove(stem).is_none() {
                continue;
            }

            *dirty = true;
        }

        for (path, (info, dirty)) in sidecars {
            if !dirty {
                continue;
            }
            log!("docs"; "update info {}", path.display());
            fs::write(&path, serde_json::to_string_pretty(&info)?)?;
        }

        Ok(())
    }

    /// Public `.html` link for a markdown file under the document root.
    pub fn doc_link(&self, file: &Path) -> Option<String> {
        let rel = file.strip_prefix(self.config.doc_dir()).ok()?;
        let rel = rel.to_string_lossy();
        let rel = rel.strip_suffix(".md").unwrap_or(&rel);
        Some(format!("{}{rel}.html", self.config.docs.prefix))
    }

    /// Public link for a collection directory.
    fn dir_link(&self, dir: &Path) -> String {
        let rel = dir
            .strip_prefix(self.config.doc_dir())
            .map(|rel| rel.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}{rel}", self.config.docs.prefix)
    }

    /// Cached markdown file names of a directory, invalidated by the
    /// directory's own mtime.
    fn md_names(&self, dir: &Path) -> Result<Vec<String>> {
        let json = self.cache.wrap(dir, || {
            let mut names: Vec<String> = fs::read_dir(dir)?
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter(|name| name.ends_with(".md"))
                .collect();
            names.sort();
            Ok(serde_json::to_string(&names)?)
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Cached listing entry for one markdown file. Sidecar meta is merged
    /// inside the cached computation, keyed by the file's own mtime.
    fn doc_entry(&self, file: &Path, meta: DocMeta) -> Result<DocEntry> {
        let json = self.cache.wrap(file, || {
            let md = md_info(file)?.unwrap_or_default();
            let entry = DocEntry {
                file_url: file.to_string_lossy().into_owned(),
                link: self.doc_link(file).unwrap_or_default(),
                title: md.title,
                is_wip: md.is_wip,
                ctime: meta.ctime.unwrap_or(mtime_ms(file)?),
                origin_url: meta.origin_url.clone(),
                issue_id: meta.issue_id,
            };
            Ok(serde_json::to_string(&entry)?)
        })?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Load a sidecar for mutation; malformed or missing files start fresh.
fn load_sidecar(path: &Path) -> DirInfo {
    fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}
