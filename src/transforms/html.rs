//! HTML tokenizer and minifier.
//!
//! The tokenizer is shared with the SVG optimizer and the critical-CSS
//! extractor. It splits markup into declarations, comments, tags and text,
//! and treats the bodies of `<script>` and `<style>` as raw text. Tag and
//! attribute names keep their case so SVG round-trips unchanged.

use super::{SyntaxError, expect_options, read_text, write_output};
use crate::config::HtmlConfig;
use crate::registry::{Invocation, Outcome, TransformError, TransformOptions};

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

const PRESERVE_WHITESPACE: &[&str] = &["pre", "textarea"];

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Elements around which whitespace never renders.
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "base", "blockquote", "body", "dd", "details", "div", "dl",
    "dt", "fieldset", "figcaption", "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6",
    "head", "header", "hr", "html", "li", "link", "main", "meta", "nav", "noscript", "ol", "option",
    "p", "pre", "script", "section", "select", "style", "summary", "table", "tbody", "td", "tfoot",
    "th", "thead", "title", "tr", "ul",
];

const BOOLEAN_ATTRIBUTES: &[&str] = &[
    "allowfullscreen", "async", "autofocus", "autoplay", "checked", "controls", "default", "defer",
    "disabled", "hidden", "ismap", "itemscope", "loop", "multiple", "muted", "nomodule",
    "novalidate", "open", "readonly", "required", "reversed", "selected",
];

/// Attributes dropped when their value is blank (plus every `on*` handler).
const EMPTY_REMOVABLE: &[&str] = &["class", "dir", "id", "lang", "style", "title"];

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Attr {
    pub name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    /// `<!DOCTYPE ...>`, `<?xml ...?>` or `<![CDATA[...]]>`, verbatim.
    Declaration(String),
    /// Comment body without the `<!--` `-->` delimiters.
    Comment(String),
    StartTag {
        name: String,
        attrs: Vec<Attr>,
        self_closing: bool,
    },
    EndTag(String),
    Text(String),
}

impl Token {
    pub(crate) fn tag_name(&self) -> Option<&str> {
        match self {
            Token::StartTag { name, .. } | Token::EndTag(name) => Some(name.as_str()),
            _ => None,
        }
    }
}

impl Attr {
    pub(crate) fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

fn one_of(list: &[&str], name: &str) -> bool {
    list.iter().any(|n| n.eq_ignore_ascii_case(name))
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
}

impl Lexer {
    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn starts_with_ignore_case(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i).is_some_and(|p| p.eq_ignore_ascii_case(&c)))
    }

    fn error(&self, at: usize, message: impl Into<String>) -> SyntaxError {
        SyntaxError::at(&self.chars, at, message)
    }

    fn skip_whitespace(&mut self) {
        while self.peek_at(0).is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    /// Consume through `end`, returning everything from the current position
    /// up to (not including) `end`.
    fn through(&mut self, end: &str, what: &str) -> Result<String, SyntaxError> {
        let start = self.pos;
        let mut body = String::new();
        while !self.starts_with(end) {
            let Some(c) = self.peek_at(0) else {
                return Err(self.error(start, format!("unterminated {what}")));
            };
            body.push(c);
            self.pos += 1;
        }
        self.pos += end.chars().count();
        Ok(body)
    }

    fn name(&mut self) -> String {
        let mut name = String::new();
        while let Some(c) = self
            .peek_at(0)
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | ':' | '_' | '.'))
        {
            name.push(c);
            self.pos += 1;
        }
        name
    }

    fn start_tag(&mut self) -> Result<Token, SyntaxError> {
        let start = self.pos;
        self.pos += 1;
        let name = self.name();
        let mut attrs = Vec::new();
        let mut self_closing = false;
        loop {
            self.skip_whitespace();
            match self.peek_at(0) {
                None => return Err(self.error(start, format!("unterminated tag <{name}>"))),
                Some('>') => {
                    self.pos += 1;
                    break;
                }
                Some('/') if self.peek_at(1) == Some('>') => {
                    self.pos += 2;
                    self_closing = true;
                    break;
                }
                Some('/') => self.pos += 1,
                Some(_) => attrs.push(self.attr(start)?),
            }
        }
        Ok(Token::StartTag {
            name,
            attrs,
            self_closing,
        })
    }

    fn attr(&mut self, tag_start: usize) -> Result<Attr, SyntaxError> {
        let mut name = String::new();
        while let Some(c) = self
            .peek_at(0)
            .filter(|c| !c.is_ascii_whitespace() && !matches!(c, '=' | '>' | '/'))
        {
            name.push(c);
            self.pos += 1;
        }
        self.skip_whitespace();
        if self.peek_at(0) != Some('=') {
            return Ok(Attr { name, value: None });
        }
        self.pos += 1;
        self.skip_whitespace();
        let value = match self.peek_at(0) {
            Some(quote @ ('"' | '\'')) => {
                self.pos += 1;
                let mut value = String::new();
                loop {
                    match self.peek_at(0) {
                        None => {
                            return Err(self.error(tag_start, "unterminated attribute value"));
                        }
                        Some(c) if c == quote => break,
                        Some(c) => value.push(c),
                    }
                    self.pos += 1;
                }
                self.pos += 1;
                value
            }
            _ => {
                let mut value = String::new();
                while let Some(c) = self.peek_at(0).filter(|c| !c.is_ascii_whitespace() && *c != '>') {
                    value.push(c);
                    self.pos += 1;
                }
                value
            }
        };
        Ok(Attr {
            name,
            value: Some(value),
        })
    }

    /// Body of a raw text element, up to its closing tag.
    fn raw_text(&mut self, tag: &str) -> Result<String, SyntaxError> {
        let start = self.pos;
        let close = format!("</{tag}");
        let mut body = String::new();
        while !self.starts_with_ignore_case(&close) {
            let Some(c) = self.peek_at(0) else {
                return Err(self.error(start, format!("unclosed <{tag}>")));
            };
            body.push(c);
            self.pos += 1;
        }
        Ok(body)
    }
}

/// Split markup into tokens.
pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut lexer = Lexer {
        chars: input.chars().collect(),
        pos: 0,
    };
    let mut tokens = Vec::new();
    let mut text = String::new();

    while let Some(c) = lexer.peek_at(0) {
        let next = lexer.peek_at(1);
        let markup = c == '<'
            && match next {
                Some('!' | '?') => true,
                Some('/') => lexer.peek_at(2).is_some_and(|c| c.is_ascii_alphabetic()),
                Some(n) => n.is_ascii_alphabetic(),
                None => false,
            };
        if !markup {
            text.push(c);
            lexer.pos += 1;
            continue;
        }
        if !text.is_empty() {
            tokens.push(Token::Text(std::mem::take(&mut text)));
        }

        if lexer.starts_with("<!--") {
            lexer.pos += 4;
            tokens.push(Token::Comment(lexer.through("-->", "comment")?));
        } else if lexer.starts_with("<![CDATA[") {
            let body = lexer.through("]]>", "CDATA section")?;
            tokens.push(Token::Declaration(format!("{body}]]>")));
        } else if matches!(next, Some('!' | '?')) {
            let body = lexer.through(">", "declaration")?;
            tokens.push(Token::Declaration(format!("{body}>")));
        } else if next == Some('/') {
            let start = lexer.pos;
            lexer.pos += 2;
            let name = lexer.name();
            lexer
                .through(">", "end tag")
                .map_err(|_| lexer.error(start, format!("unterminated tag </{name}>")))?;
            tokens.push(Token::EndTag(name));
        } else {
            let tag = lexer.start_tag()?;
            let raw = match &tag {
                Token::StartTag {
                    name,
                    self_closing: false,
                    ..
                } if one_of(RAW_TEXT_ELEMENTS, name) => Some(name.clone()),
                _ => None,
            };
            tokens.push(tag);
            if let Some(name) = raw {
                let body = lexer.raw_text(&name)?;
                if !body.is_empty() {
                    tokens.push(Token::Text(body));
                }
            }
        }
    }
    if !text.is_empty() {
        tokens.push(Token::Text(text));
    }
    Ok(tokens)
}

fn can_unquote(value: &str) -> bool {
    !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '=' | '<' | '>' | '`'))
}

fn write_attr(out: &mut String, attr: &Attr, unquote: bool) {
    out.push_str(&attr.name);
    let Some(value) = &attr.value else {
        return;
    };
    out.push('=');
    if unquote && can_unquote(value) {
        out.push_str(value);
    } else if value.contains('"') && !value.contains('\'') {
        out.push('\'');
        out.push_str(value);
        out.push('\'');
    } else {
        out.push('"');
        out.push_str(&value.replace('"', "&quot;"));
        out.push('"');
    }
}

fn write_start_tag(out: &mut String, name: &str, attrs: &[Attr], slash: bool, unquote: bool) {
    out.push('<');
    out.push_str(name);
    for (i, attr) in attrs.iter().enumerate() {
        out.push(' ');
        // An unquoted last value would swallow the slash.
        write_attr(out, attr, unquote && !(slash && i + 1 == attrs.len()));
    }
    if slash {
        out.push('/');
    }
    out.push('>');
}

/// Serialize tokens back to markup without changing anything else.
pub(crate) fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    for token in tokens {
        match token {
            Token::Declaration(raw) | Token::Text(raw) => out.push_str(raw),
            Token::Comment(body) => {
                out.push_str("<!--");
                out.push_str(body);
                out.push_str("-->");
            }
            Token::StartTag {
                name,
                attrs,
                self_closing,
            } => write_start_tag(&mut out, name, attrs, *self_closing, false),
            Token::EndTag(name) => {
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
        }
    }
    out
}

fn is_conditional_comment(body: &str) -> bool {
    let body = body.trim_start();
    body.starts_with("[if") || body.starts_with("<![endif")
}

fn is_block_boundary(token: Option<&Token>) -> bool {
    match token {
        None | Some(Token::Declaration(_)) => true,
        Some(token) => token.tag_name().is_some_and(|n| one_of(BLOCK_ELEMENTS, n)),
    }
}

fn is_redundant(tag: &str, name: &str, value: Option<&str>) -> bool {
    let value = value.map(|v| v.trim().to_ascii_lowercase());
    match (tag, name) {
        ("script", "language") => true,
        ("script", "type") => value.as_deref() == Some("text/javascript"),
        ("form", "method") => value.as_deref() == Some("get"),
        ("input", "type") => value.as_deref() == Some("text"),
        _ => false,
    }
}

fn minify_attrs(tag: &str, attrs: &[Attr], options: &HtmlConfig) -> Vec<Attr> {
    attrs
        .iter()
        .filter_map(|attr| {
            let name = attr.name.to_ascii_lowercase();
            let value = attr.value.as_deref();
            if options.remove_redundant_attributes && is_redundant(tag, &name, value) {
                return None;
            }
            let blank = value.is_some_and(|v| v.trim().is_empty());
            if options.remove_empty_attributes
                && blank
                && (one_of(EMPTY_REMOVABLE, &name) || name.starts_with("on"))
            {
                return None;
            }
            if options.collapse_boolean_attributes && one_of(BOOLEAN_ATTRIBUTES, &name) {
                return Some(Attr {
                    name: attr.name.clone(),
                    value: None,
                });
            }
            Some(attr.clone())
        })
        .collect()
}

fn is_javascript(attrs: &[Attr]) -> bool {
    match attrs.iter().find(|a| a.is("type")).and_then(|a| a.value.as_deref()) {
        None => true,
        Some(kind) => matches!(
            kind.trim().to_ascii_lowercase().as_str(),
            "" | "text/javascript" | "application/javascript" | "module"
        ),
    }
}

#[derive(Clone, Copy)]
enum RawBody {
    Script { javascript: bool },
    Style,
}

/// HTML whitespace only: U+00A0 and other Unicode spaces are content.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_ascii_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// Minify a page.
///
/// Bodies the script or stylesheet minifier cannot read are left as they
/// are; only markup the tokenizer cannot balance is an error.
pub fn minify(input: &str, options: &HtmlConfig) -> Result<String, SyntaxError> {
    let tokens = tokenize(input)?;
    let mut out = String::with_capacity(input.len());
    let mut preserve = 0usize;
    let mut raw: Option<RawBody> = None;

    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Declaration(decl) => out.push_str(decl),
            Token::Comment(body) => {
                if !options.remove_comments || is_conditional_comment(body) {
                    out.push_str("<!--");
                    out.push_str(body);
                    out.push_str("-->");
                }
            }
            Token::StartTag {
                name,
                attrs,
                self_closing,
            } => {
                let tag = name.to_ascii_lowercase();
                if one_of(PRESERVE_WHITESPACE, &tag) {
                    preserve += 1;
                }
                raw = match tag.as_str() {
                    "script" => Some(RawBody::Script {
                        javascript: is_javascript(attrs),
                    }),
                    "style" => Some(RawBody::Style),
                    _ => None,
                };
                let attrs = minify_attrs(&tag, attrs, options);
                let slash = *self_closing && !one_of(VOID_ELEMENTS, &tag);
                write_start_tag(&mut out, name, &attrs, slash, options.remove_attribute_quotes);
            }
            Token::EndTag(name) => {
                if one_of(PRESERVE_WHITESPACE, name) {
                    preserve = preserve.saturating_sub(1);
                }
                raw = None;
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
            Token::Text(text) => match raw {
                Some(RawBody::Script { javascript: true }) if options.minify_js => {
                    out.push_str(&super::scripts::minify(text).unwrap_or_else(|_| text.clone()));
                }
                Some(RawBody::Style) if options.minify_css => {
                    out.push_str(&super::css::minify(text).unwrap_or_else(|_| text.clone()));
                }
                Some(_) => out.push_str(text),
                None if preserve > 0 || !options.collapse_whitespace => out.push_str(text),
                None => {
                    let mut collapsed = collapse_whitespace(text);
                    let after_block = i == 0 || is_block_boundary(tokens.get(i - 1));
                    if after_block || out.ends_with(' ') {
                        collapsed = collapsed.trim_start_matches(' ').to_string();
                    }
                    if is_block_boundary(tokens.get(i + 1)) {
                        collapsed = collapsed.trim_end_matches(' ').to_string();
                    }
                    out.push_str(&collapsed);
                }
            },
        }
    }
    Ok(out)
}

/// `minify-html`: minify every selected page in place.
pub fn minify_stage(invocation: &Invocation) -> Result<Outcome, TransformError> {
    let TransformOptions::MinifyHtml(options) = &invocation.options else {
        return Err(expect_options("minify-html", &invocation.options));
    };
    let mut outcome = Outcome::default();
    for file in invocation.files(0)? {
        let text = read_text(&file)?;
        let minified = minify(&text, options).map_err(|e| e.in_file(&file))?;
        let relative = invocation.relative(0, &file).to_path_buf();
        outcome.bytes_in += text.len() as u64;
        outcome.bytes_out += minified.len() as u64;
        outcome
            .written
            .push(write_output(&invocation.output, &relative, minified.as_bytes())?);
    }
    Ok(outcome)
}
