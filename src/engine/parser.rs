//! Tag-based template parser.
//!
//! Templates are plain html with two token forms:
//!
//! - `{{ key }}` - interpolation from the render scope (dotted path lookup)
//! - `{% tag ... %}` / `{% endtag %}` - structural tags
//!
//! The handled tag set is closed and small, so nodes are a fixed enum
//! dispatched through a single match at render time rather than an open
//! registration table:
//!
//! - `{% html lang="en" %} ... {% endhtml %}` - document envelope
//! - `{% head %}` / `{% body %}` / `{% style %}` / `{% script %}` - bucket
//!   blocks collecting their rendered children
//! - `{% require "./target" [async] [key="value"] %}` - unary resource tag

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Tag attributes in source order.
pub type Attrs = Vec<(String, String)>;

/// Look up an attribute value by key.
pub fn attr<'a>(attrs: &'a Attrs, key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}

/// Render bucket kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    Head,
    Body,
    Style,
    Script,
}

impl BucketKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "head" => Some(Self::Head),
            "body" => Some(Self::Body),
            "style" => Some(Self::Style),
            "script" => Some(Self::Script),
            _ => None,
        }
    }
}

/// Parsed template node.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Literal output.
    Text(String),
    /// `{{ dotted.path }}` interpolation.
    Var(String),
    /// `{% html %}` document envelope wrapping a subtree.
    Document { attrs: Attrs, children: Vec<Node> },
    /// `{% head %}`/`{% body %}`/`{% style %}`/`{% script %}` block.
    Bucket {
        kind: BucketKind,
        children: Vec<Node>,
    },
    /// `{% require "target" %}` unary tag.
    Require { target: String, attrs: Attrs },
}

/// Template parse failures.
#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("unknown tag `{0}`")]
    UnknownTag(String),
    #[error("unclosed tag `{0}`")]
    UnclosedTag(String),
    #[error("unexpected end tag `end{0}`")]
    UnexpectedEndTag(String),
    #[error("require tag without a target")]
    MissingTarget,
}

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{\{\s*(.+?)\s*\}\}|\{%\s*(.+?)\s*%\}").unwrap());

/// Parse template source into a node tree.
pub fn parse(source: &str) -> Result<Vec<Node>, TemplateError> {
    // Stack of open block tags; index 0 is the root.
    let mut stack: Vec<(Option<OpenTag>, Vec<Node>)> = vec![(None, Vec::new())];
    let mut cursor = 0;

    for token in TOKEN_RE.captures_iter(source) {
        let whole = token.get(0).unwrap();
        if whole.start() > cursor {
            push_text(&mut stack, &source[cursor..whole.start()]);
        }
        cursor = whole.end();

        if let Some(var) = token.get(1) {
            top(&mut stack).push(Node::Var(var.as_str().to_string()));
            continue;
        }

        let body = token.get(2).unwrap().as_str();
        let (name, target, attrs) = split_tag(body);

        if let Some(rest) = name.strip_prefix("end") {
            close_tag(&mut stack, rest)?;
        } else if name == "require" {
            let target = target
                .or_else(|| attr(&attrs, "href").map(String::from))
                .ok_or(TemplateError::MissingTarget)?;
            top(&mut stack).push(Node::Require { target, attrs });
        } else if name == "html" || BucketKind::from_name(&name).is_some() {
            stack.push((Some(OpenTag { name, attrs }), Vec::new()));
        } else {
            return Err(TemplateError::UnknownTag(name));
        }
    }

    if cursor < source.len() {
        push_text(&mut stack, &source[cursor..]);
    }

    if let Some((Some(open), _)) = stack.last()
        && stack.len() > 1
    {
        return Err(TemplateError::UnclosedTag(open.name.clone()));
    }

    let (_, nodes) = stack.pop().expect("root frame");
    Ok(nodes)
}

struct OpenTag {
    name: String,
    attrs: Attrs,
}

fn top<'a>(stack: &'a mut Vec<(Option<OpenTag>, Vec<Node>)>) -> &'a mut Vec<Node> {
    &mut stack.last_mut().expect("non-empty stack").1
}

fn push_text(stack: &mut Vec<(Option<OpenTag>, Vec<Node>)>, text: &str) {
    if !text.is_empty() {
        top(stack).push(Node::Text(text.to_string()));
    }
}

fn close_tag(
    stack: &mut Vec<(Option<OpenTag>, Vec<Node>)>,
    name: &str,
) -> Result<(), TemplateError> {
    let Some((Some(open), children)) = stack.pop() else {
        return Err(TemplateError::UnexpectedEndTag(name.to_string()));
    };
    if open.name != name {
        return Err(TemplateError::UnexpectedEndTag(name.to_string()));
    }

    let node = if open.name == "html" {
        Node::Document {
            attrs: open.attrs,
            children,
        }
    } else {
        Node::Bucket {
            kind: BucketKind::from_name(&open.name).expect("bucket tag"),
            children,
        }
    };
    top(stack).push(node);
    Ok(())
}

/// Split a tag body into (name, positional target, attrs).
///
/// Tokens are whitespace separated; values may be single or double quoted.
/// A bare word becomes a flag attribute with value `"true"`; the first
/// positional (non `key=value`) token after the name is the target.
fn split_tag(body: &str) -> (String, Option<String>, Attrs) {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in body.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => quote = Some(ch),
            None if ch.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(ch),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    let mut tokens = tokens.into_iter();
    let name = tokens.next().unwrap_or_default();
    let mut target = None;
    let mut attrs = Attrs::new();

    for token in tokens {
        if let Some((key, value)) = token.split_once('=') {
            let value = value.trim_matches(|c| c == '"' || c == '\'');
            attrs.push((key.to_string(), value.to_string()));
        } else if target.is_none() && !attr_like(&token) {
            target = Some(token);
        } else {
            attrs.push((token, "true".to_string()));
        }
    }

    (name, target, attrs)
}

/// Bare flags we recognize as attributes rather than positional targets.
fn attr_like(token: &str) -> bool {
    matches!(token, "async" | "defer")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_and_var() {
        let nodes = parse("hello {{ user.name }}!").unwrap();
        assert_eq!(
            nodes,
            vec![
                Node::Text("hello ".into()),
                Node::Var("user.name".into()),
                Node::Text("!".into()),
            ]
        );
    }

    #[test]
    fn test_parse_document_with_buckets() {
        let source = r#"{% html lang="en" %}{% head %}<meta>{% endhead %}{% body %}hi{% endbody %}{% endhtml %}"#;
        let nodes = parse(source).unwrap();

        let Node::Document { attrs, children } = &nodes[0] else {
            panic!("expected document node");
        };
        assert_eq!(attr(attrs, "lang"), Some("en"));
        assert_eq!(children.len(), 2);
        assert!(matches!(
            children[0],
            Node::Bucket {
                kind: BucketKind::Head,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_require_forms() {
        let nodes = parse(r#"{% require "./a.css" %}{% require href='./b.js' async %}"#).unwrap();

        assert_eq!(
            nodes[0],
            Node::Require {
                target: "./a.css".into(),
                attrs: vec![],
            }
        );
        let Node::Require { target, attrs } = &nodes[1] else {
            panic!("expected require node");
        };
        assert_eq!(target, "./b.js");
        assert_eq!(attr(attrs, "async"), Some("true"));
    }

    #[test]
    fn test_parse_unclosed_tag() {
        assert_eq!(
            parse("{% head %}oops"),
            Err(TemplateError::UnclosedTag("head".into()))
        );
    }

    #[test]
    fn test_parse_mismatched_end() {
        assert_eq!(
            parse("{% head %}{% endbody %}"),
            Err(TemplateError::UnexpectedEndTag("body".into()))
        );
    }

    #[test]
    fn test_parse_unknown_tag() {
        assert_eq!(
            parse("{% wat %}"),
            Err(TemplateError::UnknownTag("wat".into()))
        );
    }

    #[test]
    fn test_parse_require_without_target() {
        assert_eq!(parse("{% require %}"), Err(TemplateError::MissingTarget));
    }
}
