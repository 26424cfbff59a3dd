//! Tag-based template engine.
//!
//! A single rendering pass per request: the page template and its required
//! sub-templates are walked depth-first, collecting inline head/body markup
//! and style/script resources into ordered, request-scoped buckets, which
//! are then flattened into the final html document.
//!
//! Resource reads are routed through the [`FileCache`] so unchanged files
//! are never re-read or re-transformed. After every render the engine
//! invokes the render hook (registered once at startup) with the request
//! path and the ordered, de-duplicated list of source files the render
//! touched, which is the sole coupling point to the live-reload notifier.

pub mod assets;
pub mod markdown;
pub mod parser;

use crate::{
    cache::FileCache,
    config::SiteConfig,
    utils::{is_remote_url, join_path},
};
use anyhow::{Context, Result};
use markdown::Markdown;
use parking_lot::RwLock;
use parser::{Attrs, BucketKind, Node, attr};
use regex::Regex;
use serde_json::Value;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

static VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([\w.]+)\s*\}\}").unwrap());

/// Emitted after each page render; consumed by the live-reload notifier.
#[derive(Debug, Clone)]
pub struct RenderNotice {
    pub req_path: String,
    pub sources: Vec<String>,
}

type RenderHook = Box<dyn Fn(&RenderNotice) + Send + Sync>;

/// A style or script resource collected during a render. Actual disk reads
/// and transforms are deferred to assembly so all resources for a page are
/// known before any are rendered into tags.
struct Resource {
    /// Resolved path string or remote url.
    url: String,
    path: Option<PathBuf>,
    is_remote: bool,
    /// Inline code from a bucket tag, overriding any file read.
    code: Option<String>,
    attrs: Attrs,
}

/// Request-scoped render buckets, reset for every render.
#[derive(Default)]
struct RenderState {
    pre: String,
    post: String,
    head: Vec<String>,
    body: Vec<String>,
    style: Vec<Resource>,
    script: Vec<Resource>,
    sources: Vec<String>,
}

impl RenderState {
    /// Record a touched resource. Returns false when already present.
    fn add_source(&mut self, url: &str) -> bool {
        if self.sources.iter().any(|s| s == url) {
            return false;
        }
        self.sources.push(url.to_string());
        true
    }
}

/// The template engine. One instance per process, shared across requests.
pub struct Engine {
    config: &'static SiteConfig,
    cache: FileCache,
    md: Markdown,
    hook: RwLock<Option<RenderHook>>,
}

impl Engine {
    pub fn new(config: &'static SiteConfig, cache: FileCache) -> Self {
        Self {
            config,
            cache,
            md: Markdown::new(config),
            hook: RwLock::new(None),
        }
    }

    /// Register the render-completed hook. Called once at startup.
    pub fn set_render_hook(&self, hook: RenderHook) {
        *self.hook.write() = Some(hook);
    }

    /// Render a page view (path relative to the view base directory) for
    /// the given request path, with `scope` available to interpolations.
    pub fn render_page(&self, req_path: &str, view: &str, scope: &Value) -> Result<String> {
        let mut state = RenderState::default();
        let mut discarded = String::new();

        let target = format!("~/{}", view.trim_start_matches('/'));
        self.handle_require(
            &mut state,
            None,
            &target,
            &Attrs::new(),
            scope,
            &mut discarded,
        )?;

        let notice = RenderNotice {
            req_path: req_path.to_string(),
            sources: state.sources.clone(),
        };
        if let Some(hook) = self.hook.read().as_ref() {
            hook(&notice);
        }

        self.assemble(state)
    }

    /// Read a local resource through the cache, applying the script/style
    /// transform matching its extension.
    pub fn read_resource(&self, path: &Path) -> Result<String> {
        let is_local = self.config.is_local();
        let owned = path.to_path_buf();
        self.cache.wrap(path, move || {
            let code = fs::read_to_string(&owned)
                .with_context(|| format!("failed to read {}", owned.display()))?;
            let transformed = match owned.extension().and_then(|e| e.to_str()) {
                Some("js") => assets::transform_js(&code, is_local),
                Some("css" | "scss") => assets::transform_css(&code, &owned, is_local),
                _ => code,
            };
            Ok(transformed)
        })
    }

    /// Render a markdown document to html, cached by path.
    pub fn render_markdown(&self, path: &Path) -> Result<String> {
        let owned = path.to_path_buf();
        let md = &self.md;
        self.cache.wrap(path, move || {
            let text = fs::read_to_string(&owned)
                .with_context(|| format!("failed to read {}", owned.display()))?;
            Ok(md.render(&text, &owned))
        })
    }

    // ------------------------------------------------------------------
    // Render pass
    // ------------------------------------------------------------------

    fn render_nodes(
        &self,
        state: &mut RenderState,
        nodes: &[Node],
        scope: &Value,
        file: &Path,
        out: &mut String,
    ) -> Result<()> {
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Var(path) => out.push_str(&lookup(scope, path)),
                Node::Document { attrs, children } => {
                    state.pre = format!("<!DOCTYPE html><html{}>", format_attrs(attrs));
                    state.post = "</html>".to_string();
                    // Children render only for their bucket side effects.
                    let mut scratch = String::new();
                    self.render_nodes(state, children, scope, file, &mut scratch)?;
                }
                Node::Bucket { kind, children } => {
                    let mut code = String::new();
                    self.render_nodes(state, children, scope, file, &mut code)?;
                    match kind {
                        BucketKind::Head => state.head.push(code),
                        BucketKind::Body => state.body.push(code),
                        BucketKind::Style => state.style.push(Resource {
                            url: String::new(),
                            path: None,
                            is_remote: false,
                            code: Some(code),
                            attrs: Attrs::new(),
                        }),
                        BucketKind::Script => state.script.push(Resource {
                            url: String::new(),
                            path: None,
                            is_remote: false,
                            code: Some(code),
                            attrs: Attrs::new(),
                        }),
                    }
                }
                Node::Require { target, attrs } => {
                    // Both the target and attribute values may reference
                    // the current scope.
                    let target = interpolate(target, scope);
                    let attrs: Attrs = attrs
                        .iter()
                        .map(|(key, value)| (key.clone(), interpolate(value, scope)))
                        .collect();
                    self.handle_require(state, Some(file), &target, &attrs, scope, out)?;
                }
            }
        }
        Ok(())
    }

    /// Dispatch one `require` target by extension. Remote targets bypass
    /// local resolution and caching entirely.
    fn handle_require(
        &self,
        state: &mut RenderState,
        from: Option<&Path>,
        target: &str,
        attrs: &Attrs,
        scope: &Value,
        out: &mut String,
    ) -> Result<()> {
        if is_remote_url(target) {
            let first_seen = state.add_source(target);
            let resource = Resource {
                url: target.to_string(),
                path: None,
                is_remote: true,
                code: None,
                attrs: attrs.clone(),
            };
            if first_seen && (target.ends_with(".css") || target.ends_with(".scss")) {
                state.style.push(resource);
            } else if first_seen && target.ends_with(".js") {
                state.script.push(resource);
            }
            return Ok(());
        }

        let path = self.resolve(from, target);
        let url = path.to_string_lossy().into_owned();
        let first_seen = state.add_source(&url);

        match path.extension().and_then(|e| e.to_str()) {
            Some("tpl") => {
                let owned = path.clone();
                let source = self.cache.wrap(&path, move || {
                    fs::read_to_string(&owned)
                        .with_context(|| format!("failed to read {}", owned.display()))
                })?;
                let nodes = parser::parse(&source)
                    .with_context(|| format!("failed to parse {}", path.display()))?;
                let merged = merge_scope(scope, attrs);
                self.render_nodes(state, &nodes, &merged, &path, out)?;
            }
            Some("css" | "scss") => {
                if first_seen {
                    state.style.push(Resource {
                        url,
                        path: Some(path),
                        is_remote: false,
                        code: None,
                        attrs: attrs.clone(),
                    });
                }
            }
            Some("js") => {
                if first_seen {
                    state.script.push(Resource {
                        url,
                        path: Some(path),
                        is_remote: false,
                        code: None,
                        attrs: attrs.clone(),
                    });
                }
            }
            Some("md") => out.push_str(&self.render_markdown(&path)?),
            _ if path.is_dir() => {
                // Component directory: fixed index lookup order.
                for name in ["index.tpl", "index.css", "index.scss", "index.js"] {
                    let sub = path.join(name);
                    if sub.exists() {
                        let sub = sub.to_string_lossy().into_owned();
                        self.handle_require(state, from, &sub, attrs, scope, out)?;
                    }
                }
            }
            // Unknown extensions are ignored, matching the tag's permissive
            // contract for user templates.
            _ => {}
        }

        Ok(())
    }

    /// Resolve a require target relative to the requiring template.
    /// `~/` resolves from the view base directory.
    fn resolve(&self, from: Option<&Path>, target: &str) -> PathBuf {
        if let Some(rest) = target.strip_prefix("~/") {
            return join_path(self.config.views_dir(), rest);
        }

        let base = from
            .and_then(Path::parent)
            .unwrap_or_else(|| self.config.views_dir());
        join_path(base, target)
    }

    /// Flatten buckets into the final document.
    fn assemble(&self, state: RenderState) -> Result<String> {
        let head = state.head.concat();
        let body = state.body.concat();

        let mut styles = Vec::with_capacity(state.style.len());
        for resource in &state.style {
            styles.push(self.style_tag(resource)?);
        }

        let mut scripts = Vec::with_capacity(state.script.len());
        for resource in &state.script {
            scripts.push(self.script_tag(resource)?);
        }

        Ok(format!(
            "{}<head>{}{}</head><body>{}{}</body>{}",
            state.pre,
            head,
            styles.join("\n"),
            body,
            scripts.join("\n"),
            state.post,
        ))
    }

    fn style_tag(&self, resource: &Resource) -> Result<String> {
        if resource.is_remote {
            return Ok(format!(
                "<link rel=\"stylesheet\" href='{}'>",
                resource.url
            ));
        }
        let css = match &resource.code {
            Some(code) => code.clone(),
            None => self.read_resource(resource.path.as_deref().expect("local style path"))?,
        };
        Ok(format!("<style>{css}</style>"))
    }

    fn script_tag(&self, resource: &Resource) -> Result<String> {
        if resource.is_remote {
            let is_async = attr(&resource.attrs, "async").is_some();
            return Ok(format!(
                "<script {}src='{}'></script>",
                if is_async { "async " } else { "" },
                resource.url
            ));
        }
        let js = match &resource.code {
            Some(code) => assets::transform_js(code, self.config.is_local()),
            None => self.read_resource(resource.path.as_deref().expect("local script path"))?,
        };
        Ok(format!("<script>{js}</script>"))
    }
}

// ============================================================================
// Scope helpers
// ============================================================================

/// Dotted-path lookup into the scope; missing keys render empty.
fn lookup(scope: &Value, path: &str) -> String {
    let pointer = format!("/{}", path.replace('.', "/"));
    match scope.pointer(&pointer) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Substitute `{{ key }}` occurrences in a require target.
fn interpolate(target: &str, scope: &Value) -> String {
    VAR_RE
        .replace_all(target, |caps: &regex::Captures| lookup(scope, &caps[1]))
        .into_owned()
}

/// Merge tag attributes over the inherited scope; attributes win.
fn merge_scope(scope: &Value, attrs: &Attrs) -> Value {
    if attrs.is_empty() {
        return scope.clone();
    }

    let mut map = match scope {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    for (key, value) in attrs {
        map.insert(key.clone(), Value::String(value.clone()));
    }
    Value::Object(map)
}

fn format_attrs(attrs: &Attrs) -> String {
    attrs
        .iter()
        .map(|(key, value)| format!(" {key}=\"{value}\""))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_engine(views: &TempDir, docs: &TempDir) -> Engine {
        let mut config = SiteConfig::default();
        config.docs.views = views.path().to_path_buf();
        config.docs.dir = docs.path().to_path_buf();
        let config: &'static SiteConfig = Box::leak(Box::new(config));
        Engine::new(config, FileCache::load(None))
    }

    fn write(dir: &TempDir, rel: &str, content: &str) -> PathBuf {
        let path = dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_render_basic_document() {
        let views = TempDir::new().unwrap();
        let docs = TempDir::new().unwrap();
        write(
            &views,
            "page/index.tpl",
            r#"{% html lang="en" %}{% head %}<title>{{ title }}</title>{% endhead %}{% body %}<p>hi</p>{% endbody %}{% endhtml %}"#,
        );

        let engine = test_engine(&views, &docs);
        let html = engine
            .render_page("/", "page/index.tpl", &json!({ "title": "Home" }))
            .unwrap();

        assert_eq!(
            html,
            "<!DOCTYPE html><html lang=\"en\"><head><title>Home</title></head><body><p>hi</p></body></html>"
        );
    }

    #[test]
    fn test_duplicate_stylesheet_registered_once() {
        let views = TempDir::new().unwrap();
        let docs = TempDir::new().unwrap();
        write(&views, "a.css", ".a { color: red; }");
        write(
            &views,
            "page/index.tpl",
            r#"{% require "../a.css" %}{% require "../a.css" %}"#,
        );

        let engine = test_engine(&views, &docs);
        let html = engine
            .render_page("/", "page/index.tpl", &json!({}))
            .unwrap();

        assert_eq!(html.matches("<style>").count(), 1);
    }

    #[test]
    fn test_sources_preserve_encounter_order() {
        let views = TempDir::new().unwrap();
        let docs = TempDir::new().unwrap();
        write(&views, "part.tpl", r#"{% require "./s.css" %}"#);
        write(&views, "s.css", ".s {}");
        write(&views, "app.js", "let x = 1;");
        write(&docs, "note.md", "# T\n\nbody");
        let md_path = docs.path().join("note.md");
        write(
            &views,
            "page/index.tpl",
            &format!(
                r#"{{% require "../part.tpl" %}}{{% require "../app.js" %}}{{% require "{}" %}}"#,
                md_path.display()
            ),
        );

        let engine = test_engine(&views, &docs);
        let captured: Arc<Mutex<Option<RenderNotice>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&captured);
        engine.set_render_hook(Box::new(move |notice| {
            *sink.lock() = Some(notice.clone());
        }));

        engine
            .render_page("/blog/note.html", "page/index.tpl", &json!({}))
            .unwrap();

        let notice = captured.lock().clone().unwrap();
        assert_eq!(notice.req_path, "/blog/note.html");
        let sources: Vec<_> = notice
            .sources
            .iter()
            .map(|s| Path::new(s).file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(
            sources,
            vec!["index.tpl", "part.tpl", "s.css", "app.js", "note.md"]
        );
    }

    #[test]
    fn test_component_directory_fixed_order() {
        let views = TempDir::new().unwrap();
        let docs = TempDir::new().unwrap();
        write(&views, "component/panel/index.tpl", "{% body %}panel{% endbody %}");
        write(&views, "component/panel/index.scss", ".panel { color: blue; }");
        write(&views, "component/panel/index.js", "let p = 1;");
        write(
            &views,
            "page/index.tpl",
            r#"{% require "~/component/panel" %}"#,
        );

        let engine = test_engine(&views, &docs);
        let html = engine
            .render_page("/", "page/index.tpl", &json!({}))
            .unwrap();

        assert!(html.contains("panel</body>") || html.contains("panel"));
        let style_pos = html.find("<style>").unwrap();
        let script_pos = html.find("<script>").unwrap();
        assert!(style_pos < script_pos);
    }

    #[test]
    fn test_remote_resources_embed_as_tags() {
        let views = TempDir::new().unwrap();
        let docs = TempDir::new().unwrap();
        write(
            &views,
            "page/index.tpl",
            r#"{% require "https://cdn.example.com/lib.css" %}{% require "https://cdn.example.com/lib.js" async %}"#,
        );

        let engine = test_engine(&views, &docs);
        let html = engine
            .render_page("/", "page/index.tpl", &json!({}))
            .unwrap();

        assert!(html.contains("<link rel=\"stylesheet\" href='https://cdn.example.com/lib.css'>"));
        assert!(html.contains("<script async src='https://cdn.example.com/lib.js'></script>"));
    }

    #[test]
    fn test_sub_template_scope_merge() {
        let views = TempDir::new().unwrap();
        let docs = TempDir::new().unwrap();
        write(&views, "part.tpl", "{% body %}{{ name }}/{{ site }}{% endbody %}");
        write(
            &views,
            "page/index.tpl",
            r#"{% require "../part.tpl" name="override" %}"#,
        );

        let engine = test_engine(&views, &docs);
        let html = engine
            .render_page(
                "/",
                "page/index.tpl",
                &json!({ "name": "inherited", "site": "blog" }),
            )
            .unwrap();

        // Tag attributes override inherited scope keys.
        assert!(html.contains("override/blog"));
    }

    #[test]
    fn test_attr_values_interpolate_from_scope() {
        let views = TempDir::new().unwrap();
        let docs = TempDir::new().unwrap();
        write(&views, "part.tpl", "{% body %}[{{ label }}]{% endbody %}");
        write(
            &views,
            "page/index.tpl",
            r#"{% require "../part.tpl" label="{{ docTitle }}" %}"#,
        );

        let engine = test_engine(&views, &docs);
        let html = engine
            .render_page("/", "page/index.tpl", &json!({ "docTitle": "Notes" }))
            .unwrap();

        assert!(html.contains("[Notes]"));
    }

    #[test]
    fn test_markdown_require_renders_inline() {
        let views = TempDir::new().unwrap();
        let docs = TempDir::new().unwrap();
        write(&docs, "post.md", "# Title\n\nSome *text*");
        let md_path = docs.path().join("post.md");
        write(
            &views,
            "page/index.tpl",
            &format!(
                r#"{{% body %}}{{% require "{}" %}}{{% endbody %}}"#,
                md_path.display()
            ),
        );

        let engine = test_engine(&views, &docs);
        let html = engine
            .render_page("/", "page/index.tpl", &json!({}))
            .unwrap();

        assert!(html.contains("<em>text</em>"));
        assert!(html.contains("markdown-head"));
    }

    #[test]
    fn test_require_target_interpolation() {
        let views = TempDir::new().unwrap();
        let docs = TempDir::new().unwrap();
        write(&docs, "a.md", "# A\n\ncontent-a");
        let md_path = docs.path().join("a.md");
        write(
            &views,
            "page/index.tpl",
            r#"{% body %}{% require "{{ mdPath }}" %}{% endbody %}"#,
        );

        let engine = test_engine(&views, &docs);
        let html = engine
            .render_page(
                "/",
                "page/index.tpl",
                &json!({ "mdPath": md_path.to_string_lossy() }),
            )
            .unwrap();

        assert!(html.contains("content-a"));
    }

    #[test]
    fn test_inline_style_and_script_buckets() {
        let views = TempDir::new().unwrap();
        let docs = TempDir::new().unwrap();
        write(
            &views,
            "page/index.tpl",
            "{% style %}.inline { color: red; }{% endstyle %}{% script %}let inline = 1;{% endscript %}",
        );

        let engine = test_engine(&views, &docs);
        let html = engine
            .render_page("/", "page/index.tpl", &json!({}))
            .unwrap();

        assert!(html.contains("<style>.inline { color: red; }</style>"));
        assert!(html.contains("<script>let inline = 1;</script>"));
    }
}
