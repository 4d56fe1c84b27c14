//! Critical CSS inlining.
//!
//! There is no browser here, so "above the fold" is approximated
//! structurally: `<html>`, `<body>`, and the first `fold_elements` start
//! tags inside `<body>`. Every stylesheet rule whose selector subject could
//! match one of those elements is inlined in a `<style>` block ahead of the
//! page's stylesheet link. The full stylesheet stays linked.

use super::css::{self, Block, Node};
use super::html::{Token, tokenize};
use super::{expect_options, read_text, write_output};
use crate::registry::{Invocation, Outcome, TransformError, TransformOptions};

/// Marks an inlined block so a page is never processed twice.
const MARKER: &str = "data-critical";

#[derive(Debug, Clone, PartialEq)]
struct Element {
    tag: String,
    id: Option<String>,
    classes: Vec<String>,
}

impl Element {
    fn from_tag(name: &str, attrs: &[super::html::Attr]) -> Self {
        let value = |key: &str| {
            attrs
                .iter()
                .find(|a| a.is(key))
                .and_then(|a| a.value.clone())
        };
        Self {
            tag: name.to_ascii_lowercase(),
            id: value("id"),
            classes: value("class")
                .map(|c| c.split_ascii_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }
}

/// `<html>`, `<body>` and the first `limit` elements opened inside the body
/// (or in the whole document when there is no `<body>`).
fn fold_elements(tokens: &[Token], limit: usize) -> Vec<Element> {
    let has_body = tokens
        .iter()
        .any(|t| matches!(t, Token::StartTag { name, .. } if name.eq_ignore_ascii_case("body")));
    let mut fold = Vec::new();
    let mut in_body = !has_body;
    let mut counted = 0;
    for token in tokens {
        let Token::StartTag { name, attrs, .. } = token else {
            continue;
        };
        let element = Element::from_tag(name, attrs);
        match element.tag.as_str() {
            "html" => fold.push(element),
            "body" => {
                in_body = true;
                fold.push(element);
            }
            _ if in_body && counted < limit => {
                counted += 1;
                fold.push(element);
            }
            _ => {}
        }
    }
    fold
}

/// Split at top-level occurrences of `sep` (outside brackets and parens).
fn split_top_level(text: &str, is_sep: impl Fn(char) -> bool) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            _ => {}
        }
        if depth == 0 && is_sep(c) {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

#[derive(Debug, Default, PartialEq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
}

/// The rightmost compound of a selector, without pseudo-classes or
/// attribute tests. `None` when nothing concrete is left to match on.
fn subject(selector: &str) -> Option<Compound> {
    let last = split_top_level(selector, |c| c.is_ascii_whitespace() || matches!(c, '>' | '+' | '~'))
        .into_iter()
        .rfind(|part| !part.is_empty())?;

    let mut simple = String::new();
    let mut depth = 0usize;
    let mut pseudo = false;
    for c in last.chars() {
        match c {
            '[' | '(' => {
                depth += 1;
                continue;
            }
            ']' | ')' => {
                depth = depth.saturating_sub(1);
                continue;
            }
            _ if depth > 0 => continue,
            ':' => {
                pseudo = true;
                continue;
            }
            '.' | '#' => pseudo = false,
            _ => {}
        }
        if !pseudo {
            simple.push(c);
        }
    }

    let mut compound = Compound::default();
    let mut kind = None;
    let mut name = String::new();
    for c in simple.chars() {
        if matches!(c, '.' | '#') {
            compound.push(kind, std::mem::take(&mut name));
            kind = Some(c);
        } else {
            name.push(c);
        }
    }
    compound.push(kind, name);

    let universal = last.starts_with('*');
    let concrete = compound.tag.is_some() || compound.id.is_some() || !compound.classes.is_empty();
    (concrete || universal).then_some(compound)
}

impl Compound {
    fn push(&mut self, kind: Option<char>, value: String) {
        match kind {
            _ if value.is_empty() => {}
            Some('.') => self.classes.push(value),
            Some('#') => self.id = Some(value),
            _ if value == "*" => {}
            _ => self.tag = Some(value.to_ascii_lowercase()),
        }
    }

    fn matches(&self, element: &Element) -> bool {
        self.tag.as_ref().is_none_or(|t| *t == element.tag)
            && self.id.as_ref().is_none_or(|id| element.id.as_ref() == Some(id))
            && self.classes.iter().all(|c| element.classes.contains(c))
    }
}

fn prelude_matches(prelude: &str, fold: &[Element]) -> bool {
    split_top_level(prelude, |c| c == ',')
        .iter()
        .filter_map(|selector| subject(selector.trim()))
        .any(|compound| fold.iter().any(|element| compound.matches(element)))
}

fn is_conditional_group(prelude: &str) -> bool {
    let lower = prelude.to_ascii_lowercase();
    lower.starts_with("@media") || lower.starts_with("@supports")
}

/// Rules applying to the fold, with `@media` / `@supports` groups kept
/// around whichever of their children apply.
fn select(nodes: &[Node], fold: &[Element]) -> Vec<Node> {
    let mut selected = Vec::new();
    for node in nodes {
        let Node::Rule { prelude, block } = node else {
            continue;
        };
        match block {
            Block::Declarations(_) if prelude.starts_with('@') => {}
            Block::Declarations(_) if prelude_matches(prelude, fold) => selected.push(node.clone()),
            Block::Declarations(_) => {}
            Block::Rules(children) if is_conditional_group(prelude) => {
                let kept = select(children, fold);
                if !kept.is_empty() {
                    selected.push(Node::Rule {
                        prelude: prelude.clone(),
                        block: Block::Rules(kept),
                    });
                }
            }
            Block::Rules(_) => {}
        }
    }
    selected
}

/// A `<style data-critical>` start tag left by an earlier run.
fn is_critical_block(token: &Token) -> bool {
    match token {
        Token::StartTag { name, attrs, .. } => {
            name.eq_ignore_ascii_case("style")
                && attrs.iter().any(|a| a.name.eq_ignore_ascii_case(MARKER))
        }
        _ => false,
    }
}

/// Insert `block` before the first stylesheet link, else before `</head>`,
/// else at the very top.
fn insert_before_styles(page: &str, block: &str) -> String {
    let lower = page.to_ascii_lowercase();
    let link = lower.match_indices("<link").map(|(i, _)| i).find(|&i| {
        lower[i..]
            .find('>')
            .is_some_and(|end| lower[i..i + end].contains("stylesheet"))
    });
    let at = link.or_else(|| lower.find("</head")).unwrap_or(0);
    let mut out = String::with_capacity(page.len() + block.len());
    out.push_str(&page[..at]);
    out.push_str(block);
    out.push_str(&page[at..]);
    out
}

/// `critical-css`: inline the rules each page needs for its first paint.
///
/// Input 0 selects the pages, input 1 the stylesheets. Pages with nothing
/// to inline are left untouched.
pub fn inline(invocation: &Invocation) -> Result<Outcome, TransformError> {
    let TransformOptions::Critical {
        fold_elements: limit,
        minify,
    } = &invocation.options
    else {
        return Err(expect_options("critical-css", &invocation.options));
    };

    let mut rules = Vec::new();
    let mut outcome = Outcome::default();
    for sheet in invocation.files(1)? {
        let text = read_text(&sheet)?;
        outcome.bytes_in += text.len() as u64;
        rules.extend(css::parse(&text).map_err(|e| e.in_file(&sheet))?);
    }

    for page in invocation.files(0)? {
        let html = read_text(&page)?;
        outcome.bytes_in += html.len() as u64;
        let tokens = tokenize(&html).map_err(|e| e.in_file(&page))?;
        if tokens.iter().any(is_critical_block) {
            continue;
        }
        let critical = select(&rules, &fold_elements(&tokens, *limit));
        if critical.is_empty() {
            continue;
        }
        let styles = if *minify {
            css::to_minified(&critical)
        } else {
            css::to_pretty(&critical)
        };
        let updated = insert_before_styles(&html, &format!("<style {MARKER}>{styles}</style>"));
        let relative = invocation.relative(0, &page).to_path_buf();
        outcome.bytes_out += updated.len() as u64;
        outcome
            .written
            .push(write_output(&invocation.output, &relative, updated.as_bytes())?);
    }
    outcome.note = Some(format!("{} rules available", rules.len()));
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Input;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn element(tag: &str, id: Option<&str>, classes: &[&str]) -> Element {
        Element {
            tag: tag.into(),
            id: id.map(String::from),
            classes: classes.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn subject_takes_rightmost_compound() {
        assert_eq!(
            subject(".sidebar > a.active:hover"),
            Some(Compound {
                tag: Some("a".into()),
                id: None,
                classes: vec!["active".into()],
            })
        );
        assert_eq!(
            subject("ul li#first[data-x=\"a b\"]::before"),
            Some(Compound {
                tag: Some("li".into()),
                id: Some("first".into()),
                classes: vec![],
            })
        );
        assert_eq!(
            subject("a:not(.x) + .y"),
            Some(Compound {
                tag: None,
                id: None,
                classes: vec!["y".into()],
            })
        );
        assert_eq!(subject("::selection"), None);
        assert_eq!(subject("*"), Some(Compound::default()));
    }

    #[test]
    fn fold_is_limited_to_first_body_elements() {
        let tokens = tokenize(
            "<html><head><title>t</title></head><body class=\"theme\"><div class=\"sidebar\"><p>a</p></div><footer>f</footer></body></html>",
        )
        .unwrap();
        let fold = fold_elements(&tokens, 2);
        assert_eq!(
            fold,
            vec![
                element("html", None, &[]),
                element("body", None, &["theme"]),
                element("div", None, &["sidebar"]),
                element("p", None, &[]),
            ]
        );
    }

    #[test]
    fn selects_matching_rules_and_media_groups() {
        let rules = css::parse(
            "html { font-size: 16px }\n.sidebar, .nope { width: 18rem }\nfooter { color: gray }\n@media (min-width: 48em) { .sidebar { position: fixed } footer { x: y } }\n@font-face { font-family: x }",
        )
        .unwrap();
        let fold = vec![element("html", None, &[]), element("div", None, &["sidebar"])];
        assert_eq!(
            css::to_minified(&select(&rules, &fold)),
            "html{font-size:16px}.sidebar,.nope{width:18rem}@media (min-width: 48em){.sidebar{position:fixed}}"
        );
    }

    #[test]
    fn inserts_before_stylesheet_link() {
        let page = "<head><link rel=\"icon\" href=\"i.png\"><LINK rel=stylesheet href=\"/css/blog.css\"></head>";
        assert_eq!(
            insert_before_styles(page, "<style>x</style>"),
            "<head><link rel=\"icon\" href=\"i.png\"><style>x</style><LINK rel=stylesheet href=\"/css/blog.css\"></head>"
        );
        assert_eq!(
            insert_before_styles("<head><title>t</title></head>", "S"),
            "<head><title>t</title>S</head>"
        );
    }

    fn setup(tmp: &TempDir, page: &str) -> Invocation {
        let root = tmp.path();
        fs::create_dir_all(root.join("css")).unwrap();
        fs::write(root.join("css/blog.css"), "body { margin: 0 }\n.later { color: red }\n").unwrap();
        fs::write(root.join("index.html"), page).unwrap();
        Invocation {
            stage: "inline-critical".into(),
            inputs: vec![
                Input::new(root, &["**/*.html"]),
                Input::new(root.join("css"), &["blog.css"]),
            ],
            output: root.to_path_buf(),
            options: TransformOptions::Critical {
                fold_elements: 30,
                minify: true,
            },
        }
    }

    #[test]
    fn stage_inlines_once() {
        let tmp = TempDir::new().unwrap();
        let page = "<html><head><link rel=\"stylesheet\" href=\"/css/blog.css\"></head><body><p>x</p></body></html>";
        let invocation = setup(&tmp, page);

        let outcome = inline(&invocation).unwrap();
        assert_eq!(outcome.written, vec![Path::new("index.html").to_path_buf()]);
        let once = fs::read_to_string(tmp.path().join("index.html")).unwrap();
        assert_eq!(
            once,
            "<html><head><style data-critical>body{margin:0}</style><link rel=\"stylesheet\" href=\"/css/blog.css\"></head><body><p>x</p></body></html>"
        );

        let again = inline(&invocation).unwrap();
        assert!(again.written.is_empty());
        assert_eq!(fs::read_to_string(tmp.path().join("index.html")).unwrap(), once);
    }

    #[test]
    fn marker_in_page_text_does_not_block_inlining() {
        let tmp = TempDir::new().unwrap();
        let page = "<html><head></head><body><p>Use the data-critical attribute</p></body></html>";
        let invocation = setup(&tmp, page);

        let outcome = inline(&invocation).unwrap();
        assert_eq!(outcome.written.len(), 1);
        let inlined = fs::read_to_string(tmp.path().join("index.html")).unwrap();
        assert!(inlined.contains("<style data-critical>body{margin:0}</style></head>"));
        assert!(inlined.contains("Use the data-critical attribute"));
    }

    #[test]
    fn page_without_matches_is_untouched() {
        let tmp = TempDir::new().unwrap();
        let page = "<p>fragment</p>";
        let invocation = setup(&tmp, page);
        fs::write(tmp.path().join("css/blog.css"), ".later { color: red }").unwrap();
        let outcome = inline(&invocation).unwrap();
        assert!(outcome.written.is_empty());
        assert_eq!(fs::read_to_string(tmp.path().join("index.html")).unwrap(), page);
    }
}
