//! Markdown rendering with blog-specific rewrites.
//!
//! Plain markdown-to-html conversion (pulldown-cmark) with three structural
//! overrides:
//!
//! - headings get an anchor id derived from their text plus a fixed class,
//!   for anchor navigation and table-of-contents generation;
//! - links open in a new tab, and links pointing at a `.js` file inside the
//!   managed document tree route through the `/blog/code` view;
//! - local images are remapped under the public static prefix and wrapped
//!   in a link opening the full-size image in a new tab.
//!
//! Also hosts the `# Title` / `[WIP]` front-line parsing shared by the
//! document indexer and the sync routines.

use crate::{
    config::SiteConfig,
    utils::{html_escape, is_remote_url, join_path},
};
use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd, html};
use regex::Regex;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*#[ \t]*([^\n]+)\n+").unwrap());
static WIP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^\[wip]").unwrap());

// ============================================================================
// Document front-line info
// ============================================================================

/// Title/body split of a markdown document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MdInfo {
    pub title: String,
    pub body: String,
    pub is_wip: bool,
}

/// Parse a leading `# Title` line. Returns `None` when the document has no
/// leading heading.
pub fn parse_info(content: &str) -> Option<MdInfo> {
    let captures = TITLE_RE.captures(content)?;
    let title = captures[1].trim_end().to_string();
    let body = content[captures[0].len()..].to_string();
    let is_wip = WIP_RE.is_match(&title);

    Some(MdInfo {
        title,
        body,
        is_wip,
    })
}

/// Read and parse a markdown file's front-line info.
pub fn md_info(path: &Path) -> anyhow::Result<Option<MdInfo>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    Ok(parse_info(&content))
}

// ============================================================================
// Renderer
// ============================================================================

/// Markdown renderer bound to the site's document root and static prefix.
pub struct Markdown {
    doc_dir: PathBuf,
    static_prefix: String,
}

impl Markdown {
    pub fn new(config: &SiteConfig) -> Self {
        Self {
            doc_dir: config.doc_dir().to_path_buf(),
            static_prefix: config.docs.static_prefix.clone(),
        }
    }

    /// Render markdown text to html. `res_url` is the on-disk location of
    /// the source file, used to resolve relative links and images.
    pub fn render(&self, text: &str, res_url: &Path) -> String {
        let options = Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH;
        let events: Vec<Event> = Parser::new_ext(text, options).collect();
        let base_dir = res_url.parent().unwrap_or(Path::new("/")).to_path_buf();

        let mut rewritten: Vec<Event> = Vec::with_capacity(events.len());
        let mut i = 0;
        while i < events.len() {
            match &events[i] {
                Event::Start(Tag::Heading {
                    level,
                    attrs,
                    ..
                }) => {
                    let text = heading_text(&events[i + 1..]);
                    rewritten.push(Event::Start(Tag::Heading {
                        level: *level,
                        id: Some(format!("heading-{text}").into()),
                        classes: vec!["markdown-head".into()],
                        attrs: attrs.clone(),
                    }));
                }
                Event::Start(Tag::Link { dest_url, .. }) => {
                    let href = self.rewrite_link(dest_url, &base_dir);
                    rewritten.push(Event::Html(
                        format!(r#"<a href="{}" target="_blank">"#, html_escape(&href)).into(),
                    ));
                }
                Event::End(TagEnd::Link) => rewritten.push(Event::Html("</a>".into())),
                Event::Start(Tag::Image { dest_url, .. }) => {
                    let src = self.rewrite_image(dest_url, &base_dir);
                    // Swallow the alt-text events up to the closing tag.
                    while i + 1 < events.len()
                        && !matches!(events[i + 1], Event::End(TagEnd::Image))
                    {
                        i += 1;
                    }
                    i += 1;
                    let src = html_escape(&src);
                    rewritten.push(Event::Html(
                        format!(
                            r#"<a href="{src}" class="img-link" target="_blank" rel="noopener noreferrer"><img src="{src}"></a>"#
                        )
                        .into(),
                    ));
                }
                other => rewritten.push(other.clone()),
            }
            i += 1;
        }

        let mut out = String::new();
        html::push_html(&mut out, rewritten.into_iter());
        out
    }

    /// Route `.js` links under the document root through the code view.
    fn rewrite_link(&self, href: &str, base_dir: &Path) -> String {
        if is_remote_url(href) {
            return href.to_string();
        }

        let resolved = join_path(base_dir, href);
        if resolved.extension().is_some_and(|ext| ext == "js")
            && let Ok(rel) = resolved.strip_prefix(&self.doc_dir)
        {
            let param = format!("/{}", rel.display());
            return format!("/blog/code?url={}", urlencoding::encode(&param));
        }

        href.to_string()
    }

    /// Remap local image paths under the public static prefix.
    fn rewrite_image(&self, src: &str, base_dir: &Path) -> String {
        if is_remote_url(src) {
            return src.to_string();
        }

        let resolved = join_path(base_dir, src);
        match resolved.strip_prefix(&self.doc_dir) {
            Ok(rel) => format!("{}{}", self.static_prefix, rel.display()),
            Err(_) => src.to_string(),
        }
    }
}

/// Concatenated text content of a heading, up to its end tag.
fn heading_text(events: &[Event]) -> String {
    let mut text = String::new();
    for event in events {
        match event {
            Event::End(TagEnd::Heading(_)) => break,
            Event::Text(t) | Event::Code(t) => text.push_str(t),
            _ => {}
        }
    }
    text
}
