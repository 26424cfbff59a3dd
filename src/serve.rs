//! Blog server built on `tiny_http`.
//!
//! Routes:
//!
//! - `GET /` and `GET /blog/*` - rendered document pages. Extensionless
//!   paths are collection listings, `.html` paths are document details,
//!   `.md` paths redirect permanently to their `.html` twin. The configured
//!   forward map rewrites public paths before resolution.
//! - `GET /blog` - collection dashboard.
//! - `GET /blog/code?url=...` - source view for `.js`/`.css` files inside
//!   the document tree.
//! - `GET <static_prefix>*` - raw files out of the document tree.
//! - `POST /sync` - trigger a tracker push in the background.
//! - `GET /hmr` - live reload websocket upgrade; `/hmr.js` is the client.
//!
//! The main thread runs the request loop; the file watcher runs on its own
//! thread. Ctrl+C unblocks the loop and flushes the resource cache.

use crate::{
    cache::FileCache,
    config::SiteConfig,
    docs::{DocEntry, DocIndex},
    engine::{Engine, markdown::md_info},
    log,
    reload::{Notifier, watch_blocking},
    sync::Syncer,
    utils::{html_escape, join_path},
};
use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tungstenite::protocol::Role;

/// Live reload client (embedded at compile time).
const HMR_SCRIPT: &str = include_str!("embed/hmr.js");

/// Try binding to port, retry with incremented port if in use.
const MAX_PORT_RETRIES: u16 = 10;

/// Everything a request handler needs, shared across threads.
pub struct App {
    pub config: &'static SiteConfig,
    pub cache: FileCache,
    pub engine: Arc<Engine>,
    pub docs: Arc<DocIndex>,
    pub notifier: Arc<Notifier>,
    pub syncer: Option<Arc<Syncer>>,
}

// ============================================================================
// Server Entry Point
// ============================================================================

/// Start the blog server. Blocks until Ctrl+C.
pub fn serve_site(app: App) -> Result<()> {
    let config = app.config;
    let interface: std::net::IpAddr = config.serve.interface.parse()?;

    let (server, addr) = try_bind_port(interface, config.serve.port, MAX_PORT_RETRIES)?;
    let server = Arc::new(server);

    // Ctrl+C: flush the resource cache, then unblock the request loop.
    let server_for_signal = Arc::clone(&server);
    let cache_for_signal = app.cache.clone();
    ctrlc::set_handler(move || {
        log!("serve"; "shutting down...");
        cache_for_signal.flush();
        server_for_signal.unblock();
    })
    .context("failed to set Ctrl+C handler")?;

    log!("serve"; "http://{addr}");

    if config.serve.watch {
        let engine = Arc::clone(&app.engine);
        let docs = Arc::clone(&app.docs);
        let notifier = Arc::clone(&app.notifier);
        std::thread::spawn(move || {
            if let Err(err) = watch_blocking(config, engine, docs, notifier) {
                log!("watch"; "{err:#}");
            }
        });
    }

    for request in server.incoming_requests() {
        if let Err(err) = handle_request(&app, request) {
            log!("serve"; "request error: {err:#}");
        }
    }

    Ok(())
}

/// Try to bind to a port, retrying with incremented port numbers if in use.
fn try_bind_port(
    interface: std::net::IpAddr,
    base_port: u16,
    max_retries: u16,
) -> Result<(Server, SocketAddr)> {
    for offset in 0..max_retries {
        let port = base_port.saturating_add(offset);
        let addr = SocketAddr::new(interface, port);

        match Server::http(addr) {
            Ok(server) => {
                if offset > 0 {
                    log!("serve"; "port {base_port} in use, using {port} instead");
                }
                return Ok((server, addr));
            }
            Err(_) if offset + 1 < max_retries => continue,
            Err(err) => {
                return Err(anyhow::anyhow!(
                    "failed to bind after {} attempts (ports {}-{}): {}",
                    max_retries,
                    base_port,
                    port,
                    err
                ));
            }
        }
    }
    unreachable!()
}

// ============================================================================
// Routing
// ============================================================================

/// Classified request target.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    /// Rendered document page; carries the forwarded visit path.
    Doc(String),
    Dashboard,
    /// Source view; carries the raw `url` query parameter.
    Code(String),
    /// Static file; carries the path below the static prefix.
    Static(String),
    Sync,
    Hmr,
    HmrScript,
    NotFound,
}

fn classify(method: &Method, url: &str, config: &SiteConfig) -> Route {
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    };
    let path = urlencoding::decode(path)
        .map(std::borrow::Cow::into_owned)
        .unwrap_or_else(|_| path.to_string());

    if *method == Method::Post {
        return if path == "/sync" {
            Route::Sync
        } else {
            Route::NotFound
        };
    }
    if *method != Method::Get {
        return Route::NotFound;
    }

    match path.as_str() {
        "/hmr" => Route::Hmr,
        "/hmr.js" => Route::HmrScript,
        "/blog" => Route::Dashboard,
        "/blog/code" => Route::Code(query_param(query, "url").unwrap_or_default()),
        _ => {
            if let Some(rest) = path.strip_prefix(&config.docs.static_prefix) {
                return Route::Static(rest.to_string());
            }
            if path == "/" || path.starts_with(&config.docs.prefix) {
                let visit = match config.docs.forward.get(&path) {
                    Some(mapped) => mapped.clone(),
                    // An unmapped site root lands on the tracker collection.
                    None if path == "/" => {
                        format!("{}{}", config.docs.prefix, config.docs.tracker_dir)
                    }
                    None => path,
                };
                return Route::Doc(visit);
            }
            Route::NotFound
        }
    }
}

/// Extract and decode one query string parameter.
fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name)
            .then(|| urlencoding::decode(value).map(std::borrow::Cow::into_owned).ok())
            .flatten()
    })
}

fn handle_request(app: &App, request: Request) -> Result<()> {
    let url = request.url().to_string();
    let req_path = url.split('?').next().unwrap_or(&url).to_string();

    match classify(request.method(), &url, app.config) {
        Route::Doc(visit) => handle_doc(app, request, &url, &req_path, &visit),
        Route::Dashboard => handle_dashboard(app, request, &req_path),
        Route::Code(param) => handle_code(app, request, &req_path, &param),
        Route::Static(rest) => handle_static(app, request, &rest),
        Route::Sync => handle_sync(app, request),
        Route::Hmr => handle_hmr(app, request),
        Route::HmrScript => {
            let response = Response::from_string(HMR_SCRIPT).with_header(
                Header::from_bytes("Content-Type", "application/javascript; charset=utf-8")
                    .unwrap(),
            );
            request.respond(response)?;
            Ok(())
        }
        Route::NotFound => serve_not_found(request),
    }
}

// ============================================================================
// Document Pages
// ============================================================================

/// Listing, detail or redirect, depending on the visit path's extension.
fn handle_doc(app: &App, request: Request, url: &str, req_path: &str, visit: &str) -> Result<()> {
    let Some(md_path) = visit.strip_prefix(&app.config.docs.prefix) else {
        return serve_not_found(request);
    };

    match Path::new(md_path).extension().and_then(|e| e.to_str()) {
        None => handle_listing(app, request, req_path, md_path),
        Some("html") => handle_detail(app, request, req_path, md_path),
        Some("md") => {
            // Permanent redirect to the rendered twin.
            let response = Response::empty(StatusCode(301))
                .with_header(Header::from_bytes("Location", redirect_target(url)).unwrap());
            request.respond(response)?;
            Ok(())
        }
        Some(_) => serve_not_found(request),
    }
}

fn handle_listing(app: &App, request: Request, req_path: &str, md_path: &str) -> Result<()> {
    let dir = app.config.doc_dir().join(md_path.trim_matches('/'));
    if !dir.is_dir() {
        return serve_not_found(request);
    }

    let listing = app.docs.dir_listing(&dir)?;
    if listing.doc_list.is_empty() {
        return serve_not_found(request);
    }
    let all_info = app.docs.read_all_info()?;

    let scope = json!({
        "siteTitle": app.config.base.title,
        "docTitle": listing.doc_info.title.clone().unwrap_or_default(),
        "listHtml": list_html(&listing.doc_list),
        "navHtml": nav_html(&all_info),
    });
    render(app, request, req_path, "blog/list.tpl", &scope)
}

fn handle_detail(app: &App, request: Request, req_path: &str, md_path: &str) -> Result<()> {
    let rel = format!("{}.md", md_path.trim_end_matches(".html"));
    let file = app.config.doc_dir().join(&rel);
    if !file.exists() {
        return serve_not_found(request);
    }

    let dir = file.parent().unwrap_or(app.config.doc_dir());
    let listing = app.docs.dir_listing(dir)?;
    let all_info = app.docs.read_all_info()?;

    let file_url = file.to_string_lossy();
    let index = listing
        .doc_list
        .iter()
        .position(|doc| doc.file_url == file_url);

    // The document may be missing from the listing (WIP outside local
    // mode); fall back to its own front line.
    let (title, origin_url) = match index {
        Some(i) => {
            let doc = &listing.doc_list[i];
            (doc.title.clone(), doc.origin_url.clone())
        }
        None => (
            md_info(&file)?.map(|md| md.title).unwrap_or_default(),
            None,
        ),
    };
    // Newest first: prev is the older neighbor, next the newer one.
    let prev = index.and_then(|i| listing.doc_list.get(i + 1));
    let next = index.and_then(|i| i.checked_sub(1).map(|i| &listing.doc_list[i]));

    let scope = json!({
        "siteTitle": app.config.base.title,
        "title": title,
        "mdPath": file_url,
        "originUrl": origin_url.unwrap_or_default(),
        "prevHtml": neighbor_html(prev, "prev"),
        "nextHtml": neighbor_html(next, "next"),
        "navHtml": nav_html(&all_info),
    });
    render(app, request, req_path, "blog/detail.tpl", &scope)
}

fn handle_dashboard(app: &App, request: Request, req_path: &str) -> Result<()> {
    let all_info = app.docs.read_all_info()?;
    let scope = json!({
        "siteTitle": app.config.base.title,
        "navHtml": nav_html(&all_info),
    });
    render(app, request, req_path, "blog/index.tpl", &scope)
}

// ============================================================================
// Code View
// ============================================================================

fn handle_code(app: &App, request: Request, req_path: &str, param: &str) -> Result<()> {
    let Some(file) = resolve_code_path(app.config.doc_dir(), param) else {
        return serve_not_found(request);
    };

    let lang = file
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_string();
    let code = fs::read_to_string(&file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let scope = json!({
        "siteTitle": app.config.base.title,
        "lang": lang,
        "code": html_escape(&code),
    });
    render(app, request, req_path, "blog/code.tpl", &scope)
}

/// The `.html` twin of a `.md` url, keeping any query string.
fn redirect_target(url: &str) -> String {
    match url.split_once('?') {
        Some((path, query)) => format!("{}.html?{query}", path.trim_end_matches(".md")),
        None => format!("{}.html", url.trim_end_matches(".md")),
    }
}

/// Resolve the code view's `url` parameter against the document root.
/// Rejects paths that escape the root, missing files and anything that is
/// not a source file.
fn resolve_code_path(doc_dir: &Path, param: &str) -> Option<PathBuf> {
    let rel = param.strip_prefix('/')?;
    let file = join_path(doc_dir, rel);

    let is_source = file
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| matches!(ext, "js" | "css"));
    (file.starts_with(doc_dir) && is_source && file.is_file()).then_some(file)
}

// ============================================================================
// Static, Sync, Live Reload
// ============================================================================

fn handle_static(app: &App, request: Request, rest: &str) -> Result<()> {
    let doc_dir = app.config.doc_dir();
    let file = join_path(doc_dir, rest.trim_matches('/'));
    if !file.starts_with(doc_dir) || !file.is_file() {
        return serve_not_found(request);
    }

    let content =
        fs::read(&file).with_context(|| format!("failed to read {}", file.display()))?;
    let response = Response::from_data(content)
        .with_header(Header::from_bytes("Content-Type", guess_content_type(&file)).unwrap());
    request.respond(response)?;
    Ok(())
}

/// Kick off a tracker push in the background and return immediately.
fn handle_sync(app: &App, request: Request) -> Result<()> {
    match &app.syncer {
        Some(syncer) => {
            let syncer = Arc::clone(syncer);
            std::thread::spawn(move || syncer.sync());
        }
        None => log!("serve"; "sync requested but no tracker configured"),
    }

    request.respond(Response::empty(StatusCode(200)))?;
    Ok(())
}

/// Upgrade a `/hmr` request to a websocket and hand it to the notifier.
fn handle_hmr(app: &App, request: Request) -> Result<()> {
    let Some(key) = request
        .headers()
        .iter()
        .find(|header| header.field.equiv("Sec-WebSocket-Key"))
        .map(|header| header.value.as_str().to_string())
    else {
        request.respond(Response::empty(StatusCode(400)))?;
        return Ok(());
    };

    let accept = tungstenite::handshake::derive_accept_key(key.as_bytes());
    let response = Response::empty(StatusCode(101))
        .with_header(Header::from_bytes("Upgrade", "websocket").unwrap())
        .with_header(Header::from_bytes("Connection", "Upgrade").unwrap())
        .with_header(Header::from_bytes("Sec-WebSocket-Accept", accept).unwrap());

    let stream = request.upgrade("websocket", response);
    let socket = tungstenite::WebSocket::from_raw_socket(stream, Role::Server, None);
    app.notifier.attach(socket);
    Ok(())
}

// ============================================================================
// Response Helpers
// ============================================================================

fn render(app: &App, request: Request, req_path: &str, view: &str, scope: &Value) -> Result<()> {
    let html = app.engine.render_page(req_path, view, scope)?;
    let response = Response::from_string(html)
        .with_header(Header::from_bytes("Content-Type", "text/html; charset=utf-8").unwrap());
    request.respond(response)?;
    Ok(())
}

fn serve_not_found(request: Request) -> Result<()> {
    let response = Response::from_string("404 Not Found")
        .with_status_code(StatusCode(404))
        .with_header(Header::from_bytes("Content-Type", "text/plain").unwrap());
    request.respond(response)?;
    Ok(())
}

// ============================================================================
// Scope Fragments
// ============================================================================

/// Navigation fragment over the collection index.
fn nav_html(all_info: &[crate::docs::DirInfo]) -> String {
    all_info
        .iter()
        .filter_map(|info| {
            let title = info.title.as_deref()?;
            let link = info.doc_link.as_deref()?;
            Some(format!(
                r#"<a class="nav-item" href="{link}">{}</a>"#,
                html_escape(title)
            ))
        })
        .collect()
}

/// Listing fragment, one anchor per document.
fn list_html(docs: &[DocEntry]) -> String {
    docs.iter()
        .map(|doc| {
            format!(
                r#"<a class="doc-item" href="{}"><span class="doc-title">{}</span><time data-ctime="{}"></time></a>"#,
                doc.link,
                html_escape(&doc.title),
                doc.ctime
            )
        })
        .collect()
}

/// Prev/next link on detail pages; empty when there is no neighbor.
fn neighbor_html(doc: Option<&DocEntry>, class: &str) -> String {
    match doc {
        Some(doc) => format!(
            r#"<a class="doc-{class}" href="{}">{}</a>"#,
            doc.link,
            html_escape(&doc.title)
        ),
        None => String::new(),
    }
}

// ============================================================================
// Content Type Detection
// ============================================================================

/// Guess MIME content type from file extension.
fn guess_content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "application/javascript; charset=utf-8",
        Some("json") => "application/json; charset=utf-8",
        Some("xml") => "application/xml; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain; charset=utf-8",
        Some("md") => "text/markdown; charset=utf-8",
        _ => "application/octet-stream",
    }
}
