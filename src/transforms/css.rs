//! Stylesheet transforms: concatenate, vendor-prefix, minify.
//!
//! All three share a small CSS reader that understands exactly what they
//! need: comments, strings, `@` statements, rule blocks with declarations,
//! and conditional group rules (`@media`, `@supports`, ...) holding nested
//! rules. Anything it cannot balance (an unclosed block, string or comment)
//! is a syntax error, which is what makes a broken fragment fail the
//! concatenation stage before any output is written.

use super::{SyntaxError, expect_options, read_text, write_output};
use crate::registry::{Invocation, Outcome, TransformError, TransformOptions};
use std::path::Path;

/// At-rules whose block contains rules rather than declarations.
const GROUP_AT_RULES: &[&str] = &[
    "media",
    "supports",
    "document",
    "layer",
    "container",
    "keyframes",
    "-webkit-keyframes",
    "-moz-keyframes",
];

/// Properties that still need vendor-prefixed copies for the previous
/// release of the major engines.
const PREFIXED_PROPERTIES: &[(&str, &[&str])] = &[
    ("appearance", &["-webkit-", "-moz-"]),
    ("backdrop-filter", &["-webkit-"]),
    ("box-decoration-break", &["-webkit-"]),
    ("clip-path", &["-webkit-"]),
    ("hyphens", &["-webkit-", "-ms-"]),
    ("mask-image", &["-webkit-"]),
    ("tab-size", &["-moz-"]),
    ("text-size-adjust", &["-webkit-", "-ms-"]),
    ("user-select", &["-webkit-", "-moz-", "-ms-"]),
];

#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub property: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Declarations(Vec<Declaration>),
    Rules(Vec<Node>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// A top-level `/* ... */` comment, delimiters included.
    Comment(String),
    /// An at-rule without a block, e.g. `@import url(x.css)`.
    Statement(String),
    Rule { prelude: String, block: Block },
}

struct Reader {
    chars: Vec<char>,
    pos: usize,
}

impl Reader {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.chars.get(self.pos + i) == Some(&c))
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::at(&self.chars, self.pos, message)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    /// Consume a comment starting at `/*`, returning it with delimiters.
    fn comment(&mut self) -> Result<String, SyntaxError> {
        let start = self.pos;
        self.pos += 2;
        while !self.starts_with("*/") {
            if self.peek().is_none() {
                self.pos = start;
                return Err(self.error("unterminated comment"));
            }
            self.pos += 1;
        }
        self.pos += 2;
        Ok(self.chars[start..self.pos].iter().collect())
    }

    /// Consume a quoted string, appending it (quotes included) to `out`.
    fn string(&mut self, out: &mut String) -> Result<(), SyntaxError> {
        let start = self.pos;
        let quote = self.chars[self.pos];
        out.push(quote);
        self.pos += 1;
        loop {
            match self.peek() {
                None | Some('\n') => {
                    self.pos = start;
                    return Err(self.error("unterminated string"));
                }
                Some('\\') => {
                    out.push('\\');
                    self.pos += 1;
                    if let Some(c) = self.peek() {
                        out.push(c);
                        self.pos += 1;
                    }
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                    if c == quote {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Read text up to (not including) the first unquoted, unparenthesized
    /// character in `stops`. Comments are dropped.
    fn until(&mut self, stops: &[char]) -> Result<(String, Option<char>), SyntaxError> {
        let mut out = String::new();
        let mut parens = 0usize;
        loop {
            let Some(c) = self.peek() else {
                return Ok((out, None));
            };
            if self.starts_with("/*") {
                self.comment()?;
                out.push(' ');
                continue;
            }
            match c {
                '"' | '\'' => self.string(&mut out)?,
                '(' => {
                    parens += 1;
                    out.push(c);
                    self.pos += 1;
                }
                ')' => {
                    parens = parens.saturating_sub(1);
                    out.push(c);
                    self.pos += 1;
                }
                _ if parens == 0 && stops.contains(&c) => return Ok((out, Some(c))),
                _ => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn nodes(&mut self, nested: bool) -> Result<Vec<Node>, SyntaxError> {
        let mut nodes = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None if nested => return Err(self.error("unclosed block")),
                None => return Ok(nodes),
                Some('}') if nested => {
                    self.pos += 1;
                    return Ok(nodes);
                }
                Some('}') => return Err(self.error("unexpected '}'")),
                _ if self.starts_with("/*") => {
                    let comment = self.comment()?;
                    if !nested {
                        nodes.push(Node::Comment(comment));
                    }
                }
                _ => nodes.push(self.rule()?),
            }
        }
    }

    fn rule(&mut self) -> Result<Node, SyntaxError> {
        let (prelude, stop) = self.until(&['{', ';', '}'])?;
        let prelude = collapse_whitespace(&prelude);
        match stop {
            Some(';') if prelude.starts_with('@') => {
                self.pos += 1;
                Ok(Node::Statement(prelude))
            }
            Some('{') => {
                self.pos += 1;
                let block = if is_group_rule(&prelude) {
                    Block::Rules(self.nodes(true)?)
                } else {
                    Block::Declarations(self.declarations()?)
                };
                Ok(Node::Rule { prelude, block })
            }
            Some(c) => Err(self.error(format!("unexpected '{c}' after '{prelude}'"))),
            None => Err(self.error(format!("unexpected end of input after '{prelude}'"))),
        }
    }

    fn declarations(&mut self) -> Result<Vec<Declaration>, SyntaxError> {
        let mut declarations = Vec::new();
        loop {
            let (text, stop) = self.until(&[';', '}', '{'])?;
            let text = text.trim_matches(|c: char| c.is_ascii_whitespace());
            if !text.is_empty() {
                let Some((property, value)) = text.split_once(':') else {
                    return Err(self.error(format!("malformed declaration '{text}'")));
                };
                declarations.push(Declaration {
                    property: property
                        .trim_matches(|c: char| c.is_ascii_whitespace())
                        .to_string(),
                    value: collapse_whitespace(value),
                });
            }
            match stop {
                Some(';') => self.pos += 1,
                Some('}') => {
                    self.pos += 1;
                    return Ok(declarations);
                }
                Some(_) => return Err(self.error("unexpected '{' inside declarations")),
                None => return Err(self.error("unclosed block")),
            }
        }
    }
}

fn is_group_rule(prelude: &str) -> bool {
    prelude
        .strip_prefix('@')
        .map(|rest| {
            let name = rest
                .split(|c: char| c.is_ascii_whitespace() || c == '(')
                .next()
                .unwrap_or("");
            GROUP_AT_RULES.contains(&name.to_ascii_lowercase().as_str())
        })
        .unwrap_or(false)
}

/// Collapse runs of whitespace outside strings into single spaces and trim.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;
    for c in text.chars() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        if c.is_ascii_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        if c == '"' || c == '\'' {
            quote = Some(c);
        }
        out.push(c);
    }
    out
}

/// Remove spaces next to any of `tight` (outside strings).
fn tighten(text: &str, tight: &[char]) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;
    for (i, &c) in chars.iter().enumerate() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        if c == '"' || c == '\'' {
            quote = Some(c);
        }
        if c == ' ' {
            let prev = out.chars().next_back();
            let next = chars.get(i + 1).copied();
            if prev.is_some_and(|p| tight.contains(&p)) || next.is_some_and(|n| tight.contains(&n))
            {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Parse a stylesheet.
pub fn parse(input: &str) -> Result<Vec<Node>, SyntaxError> {
    Reader::new(input).nodes(false)
}

/// Readable serialization: one declaration per line, two-space indent.
pub fn to_pretty(nodes: &[Node]) -> String {
    let mut out = String::new();
    write_pretty(nodes, 0, &mut out);
    out
}

fn write_pretty(nodes: &[Node], depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    for (i, node) in nodes.iter().enumerate() {
        if i > 0 && depth == 0 {
            out.push('\n');
        }
        match node {
            Node::Comment(text) => {
                out.push_str(&indent);
                out.push_str(text);
                out.push('\n');
            }
            Node::Statement(text) => {
                out.push_str(&format!("{indent}{text};\n"));
            }
            Node::Rule { prelude, block } => {
                out.push_str(&format!("{indent}{prelude} {{\n"));
                match block {
                    Block::Declarations(decls) => {
                        for d in decls {
                            out.push_str(&format!("{indent}  {}: {};\n", d.property, d.value));
                        }
                    }
                    Block::Rules(children) => write_pretty(children, depth + 1, out),
                }
                out.push_str(&format!("{indent}}}\n"));
            }
        }
    }
}

/// Compact serialization: no comments, no empty rules, minimal whitespace.
pub fn to_minified(nodes: &[Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        match node {
            Node::Comment(_) => {}
            Node::Statement(text) => {
                out.push_str(&tighten(text, &[',']));
                out.push(';');
            }
            Node::Rule { prelude, block } => {
                let body = match block {
                    Block::Declarations(decls) => decls
                        .iter()
                        .map(|d| format!("{}:{}", d.property, minify_value(&d.value)))
                        .collect::<Vec<_>>()
                        .join(";"),
                    Block::Rules(children) => to_minified(children),
                };
                if body.is_empty() {
                    continue;
                }
                let prelude = if prelude.starts_with('@') {
                    tighten(prelude, &[','])
                } else {
                    tighten(prelude, &[',', '>', '+', '~'])
                };
                out.push_str(&prelude);
                out.push('{');
                out.push_str(&body);
                out.push('}');
            }
        }
    }
    out
}

fn minify_value(value: &str) -> String {
    let tight = tighten(value, &[',']);
    match tight.rfind(" !") {
        Some(idx) => format!("{}{}", &tight[..idx], &tight[idx + 1..]),
        None => tight,
    }
}

/// Minify stylesheet text. Used for inline `<style>` blocks as well.
pub fn minify(input: &str) -> Result<String, SyntaxError> {
    Ok(to_minified(&parse(input)?))
}

/// Add missing vendor-prefixed copies of declarations, in place.
///
/// A prefixed copy is inserted just before the standard declaration unless
/// the block already declares it, so prefixing twice changes nothing.
pub fn add_prefixes(nodes: &mut [Node]) {
    for node in nodes {
        let Node::Rule { block, .. } = node else {
            continue;
        };
        match block {
            Block::Rules(children) => add_prefixes(children),
            Block::Declarations(decls) => {
                let mut result: Vec<Declaration> = Vec::with_capacity(decls.len());
                for decl in decls.iter() {
                    let property = decl.property.to_ascii_lowercase();
                    if let Some((_, prefixes)) =
                        PREFIXED_PROPERTIES.iter().find(|(p, _)| *p == property)
                    {
                        for prefix in *prefixes {
                            let prefixed = format!("{prefix}{property}");
                            let present = decls
                                .iter()
                                .any(|d| d.property.eq_ignore_ascii_case(&prefixed));
                            if !present {
                                result.push(Declaration {
                                    property: prefixed,
                                    value: decl.value.clone(),
                                });
                            }
                        }
                    }
                    result.push(decl.clone());
                }
                *decls = result;
            }
        }
    }
}

fn parse_file(path: &Path, text: &str) -> Result<Vec<Node>, TransformError> {
    parse(text).map_err(|e| e.in_file(path))
}

/// `concat-css`: join the selected fragments, in order, into one file.
///
/// Every fragment is parsed first; a broken one fails the stage before the
/// previous output is touched.
pub fn concat(invocation: &Invocation) -> Result<Outcome, TransformError> {
    let TransformOptions::Concat { output } = &invocation.options else {
        return Err(expect_options("concat-css", &invocation.options));
    };
    let mut bundle = String::new();
    let mut bytes_in = 0u64;
    for file in invocation.files(0)? {
        let text = read_text(&file)?;
        parse_file(&file, &text)?;
        bytes_in += text.len() as u64;
        bundle.push_str(text.trim_end());
        bundle.push('\n');
    }
    let written = write_output(&invocation.output, Path::new(output), bundle.as_bytes())?;
    Ok(Outcome {
        bytes_in,
        bytes_out: bundle.len() as u64,
        written: vec![written],
        note: None,
    })
}

/// Rewrite every selected stylesheet through `render`, in place under the
/// output directory.
fn rewrite_each(
    invocation: &Invocation,
    render: impl Fn(Vec<Node>) -> String,
) -> Result<Outcome, TransformError> {
    let mut outcome = Outcome::default();
    for file in invocation.files(0)? {
        let text = read_text(&file)?;
        let nodes = parse_file(&file, &text)?;
        let rendered = render(nodes);
        let relative = invocation.relative(0, &file).to_path_buf();
        outcome.bytes_in += text.len() as u64;
        outcome.bytes_out += rendered.len() as u64;
        outcome
            .written
            .push(write_output(&invocation.output, &relative, rendered.as_bytes())?);
    }
    Ok(outcome)
}

/// `prefix-css`: add vendor-prefixed declarations.
pub fn prefix(invocation: &Invocation) -> Result<Outcome, TransformError> {
    if invocation.options != TransformOptions::Prefix {
        return Err(expect_options("prefix-css", &invocation.options));
    }
    rewrite_each(invocation, |mut nodes| {
        add_prefixes(&mut nodes);
        to_pretty(&nodes)
    })
}

/// `minify-css`: strip comments and whitespace.
pub fn minify_stage(invocation: &Invocation) -> Result<Outcome, TransformError> {
    if invocation.options != TransformOptions::MinifyCss {
        return Err(expect_options("minify-css", &invocation.options));
    }
    rewrite_each(invocation, |nodes| to_minified(&nodes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Input;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn parses_rules_statements_and_groups() {
        let nodes = parse(
            r#"@import url("a.css");
/* header */
body { color: red; margin: 0 }
@media (min-width: 40em) {
  .sidebar { width: 18rem; }
}"#,
        )
        .unwrap();
        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[0], Node::Statement(r#"@import url("a.css")"#.into()));
        assert!(matches!(&nodes[1], Node::Comment(c) if c == "/* header */"));
        match &nodes[2] {
            Node::Rule {
                prelude,
                block: Block::Declarations(d),
            } => {
                assert_eq!(prelude, "body");
                assert_eq!(d.len(), 2);
                assert_eq!(d[1].property, "margin");
                assert_eq!(d[1].value, "0");
            }
            other => panic!("unexpected node {other:?}"),
        }
        assert!(matches!(&nodes[3], Node::Rule { block: Block::Rules(r), .. } if r.len() == 1));
    }

    #[test]
    fn semicolons_inside_strings_and_urls_are_kept() {
        let nodes = parse(r#"a { content: "x;y"; background: url(data:image/png;base64,AA) }"#)
            .unwrap();
        let Node::Rule {
            block: Block::Declarations(d),
            ..
        } = &nodes[0]
        else {
            panic!("expected rule");
        };
        assert_eq!(d[0].value, r#""x;y""#);
        assert_eq!(d[1].value, "url(data:image/png;base64,AA)");
    }

    #[test]
    fn unbalanced_input_is_a_syntax_error() {
        assert!(parse("a { color: red;").is_err());
        assert!(parse("a { color: red; }}").is_err());
        assert!(parse("/* never closed").is_err());
        assert!(parse("a { content: \"open }").is_err());
        let err = parse("a {}\n\nb { color }").unwrap_err();
        assert_eq!(err.line, 3);
    }

    #[test]
    fn minify_strips_comments_and_space() {
        let css = "/*! keep? no */\nh1 ,  h2 > a {\n  color : red ;\n  margin: 0 auto !important;\n}\n.empty {}\n";
        assert_eq!(
            minify(css).unwrap(),
            "h1,h2>a{color:red;margin:0 auto!important}"
        );
    }

    #[test]
    fn minify_keeps_descendant_and_pseudo_spacing() {
        assert_eq!(
            minify("ul li a:hover { top: calc(1px + 2px) }").unwrap(),
            "ul li a:hover{top:calc(1px + 2px)}"
        );
        assert_eq!(
            minify("@media screen and (min-width: 40em) { a { b: c } }").unwrap(),
            "@media screen and (min-width: 40em){a{b:c}}"
        );
    }

    #[test]
    fn minify_leaves_non_breaking_spaces_alone() {
        assert_eq!(
            minify("p {\n  margin: 0\u{a0}auto;\n}\n").unwrap(),
            "p{margin:0\u{a0}auto}"
        );
    }

    #[test]
    fn prefixes_added_once() {
        let mut nodes = parse(".x { user-select: none; color: red }").unwrap();
        add_prefixes(&mut nodes);
        let once = to_minified(&nodes);
        assert_eq!(
            once,
            ".x{-webkit-user-select:none;-moz-user-select:none;-ms-user-select:none;user-select:none;color:red}"
        );
        add_prefixes(&mut nodes);
        assert_eq!(to_minified(&nodes), once);
    }

    #[test]
    fn prefixes_reach_nested_rules() {
        let mut nodes = parse("@media print { .a { appearance: none } }").unwrap();
        add_prefixes(&mut nodes);
        assert_eq!(
            to_minified(&nodes),
            "@media print{.a{-webkit-appearance:none;-moz-appearance:none;appearance:none}}"
        );
    }

    #[test]
    fn pretty_output_reparses_to_same_tree() {
        let nodes = parse("/* c */ a{b:c;d:e} @media x{f{g:h}}").unwrap();
        assert_eq!(parse(&to_pretty(&nodes)).unwrap(), nodes);
    }

    #[test]
    fn concat_keeps_fragment_order() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("css");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("b.css"), "b { x: 1 }").unwrap();
        fs::write(src.join("a.css"), "a { x: 2 }\n\n").unwrap();
        let out = tmp.path().join("out");

        let invocation = Invocation {
            stage: "concat-styles".into(),
            inputs: vec![Input::new(&src, &["b.css", "a.css"])],
            output: out.clone(),
            options: TransformOptions::Concat {
                output: "blog.css".into(),
            },
        };
        let outcome = concat(&invocation).unwrap();
        assert_eq!(outcome.written, vec![Path::new("blog.css").to_path_buf()]);
        assert_eq!(
            fs::read_to_string(out.join("blog.css")).unwrap(),
            "b { x: 1 }\na { x: 2 }\n"
        );
    }

    #[test]
    fn concat_broken_fragment_leaves_output_untouched() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("css");
        let out = tmp.path().join("out");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("blog.css"), "previous").unwrap();
        fs::write(src.join("a.css"), "a { x: 1 ").unwrap();

        let invocation = Invocation {
            stage: "concat-styles".into(),
            inputs: vec![Input::new(&src, &["a.css"])],
            output: out.clone(),
            options: TransformOptions::Concat {
                output: "blog.css".into(),
            },
        };
        assert!(matches!(
            concat(&invocation),
            Err(TransformError::Syntax { .. })
        ));
        assert_eq!(fs::read_to_string(out.join("blog.css")).unwrap(), "previous");
    }

    #[test]
    fn wrong_options_rejected() {
        let invocation = Invocation {
            stage: "x".into(),
            inputs: vec![],
            output: "/tmp".into(),
            options: TransformOptions::Vector,
        };
        assert!(matches!(
            prefix(&invocation),
            Err(TransformError::Options { .. })
        ));
    }
}
