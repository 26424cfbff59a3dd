//! Script and style transforms.
//!
//! Local mode returns sources untouched for fast reload; any other mode
//! minifies. Transform failures are logged and degrade to an empty string
//! so a broken asset never fails the page render.

use crate::log;
use grass::{Options, OutputStyle};
use minify_js::{Session, TopLevelMode};
use std::path::Path;

/// Transform script text. Outside local mode the source is minified;
/// minify failure logs and yields an empty string.
pub fn transform_js(code: &str, is_local: bool) -> String {
    if is_local {
        return code.to_string();
    }

    let session = Session::new();
    let mut out = Vec::new();
    match minify_js::minify(&session, TopLevelMode::Global, code.as_bytes(), &mut out) {
        Ok(()) => String::from_utf8(out).unwrap_or_default(),
        Err(err) => {
            log!("assets"; "js minify failed: {err:?}");
            String::new()
        }
    }
}

/// Transform stylesheet text (`.css` or `.scss`): scss compilation handles
/// nesting and arithmetic; output is compressed outside local mode.
/// Pipeline failure logs and yields an empty string.
pub fn transform_css(code: &str, path: &Path, is_local: bool) -> String {
    let style = if is_local {
        OutputStyle::Expanded
    } else {
        OutputStyle::Compressed
    };

    match grass::from_string(code.to_owned(), &Options::default().style(style)) {
        Ok(css) => css,
        Err(err) => {
            log!("assets"; "css transform failed for {}: {err}", path.display());
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_js_local_passthrough() {
        let code = "const answer = 40 + 2;\nconsole.log(answer);";
        assert_eq!(transform_js(code, true), code);
    }

    #[test]
    fn test_js_minified_outside_local() {
        let code = "const answer = 40   +   2;\n\nconsole.log(answer);";
        let out = transform_js(code, false);

        assert!(!out.is_empty());
        assert!(out.len() < code.len());
    }

    #[test]
    fn test_js_broken_source_degrades_to_empty() {
        let out = transform_js("function {{{", false);
        assert_eq!(out, "");
    }

    #[test]
    fn test_css_nesting_expanded() {
        let scss = ".card { .title { color: red; } }";
        let out = transform_css(scss, Path::new("a.scss"), true);

        assert!(out.contains(".card .title"));
        assert!(out.contains("color: red"));
    }

    #[test]
    fn test_css_arithmetic() {
        let scss = ".box { width: 40px + 2px; }";
        let out = transform_css(scss, Path::new("a.scss"), true);

        assert!(out.contains("42px"));
    }

    #[test]
    fn test_css_compressed_outside_local() {
        let scss = ".a {\n  color: red;\n}\n";
        let out = transform_css(scss, Path::new("a.scss"), false);

        assert!(!out.contains('\n') || out.trim_end().lines().count() == 1);
        assert!(out.contains("color:red"));
    }

    #[test]
    fn test_css_broken_source_degrades_to_empty() {
        let out = transform_css(".a { color: ", Path::new("a.scss"), false);
        assert_eq!(out, "");
    }
}
