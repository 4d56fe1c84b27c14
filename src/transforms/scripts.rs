//! Script bundling.
//!
//! Dev bundles are a readable concatenation: every file keeps its text and
//! gets a `// path` banner. Production bundles go through [`minify`], a
//! conservative whitespace-and-comment stripper. It never renames or
//! reorders anything, and it keeps line breaks wherever dropping one could
//! change how statements are terminated.

use super::{SyntaxError, expect_options, read_text, write_output};
use crate::registry::{Invocation, Outcome, TransformError, TransformOptions};
use std::path::Path;

/// Keywords after which a `/` starts a regular expression literal.
const REGEX_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "case", "in", "of", "delete", "void", "throw", "new",
    "else", "do", "yield", "await",
];

/// Characters after which a line break can never end a statement.
const NO_BREAK_AFTER: &[char] = &['{', '(', '[', ',', ';', '=', ':', '?', '&', '|', '!', '<', '>'];

/// Characters before which a line break can never end a statement.
const NO_BREAK_BEFORE: &[char] = &['}', ')', ']', ',', ';', ':', '?', '=', '.'];

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || !c.is_ascii()
}

#[derive(Clone, Copy, PartialEq)]
enum Gap {
    None,
    Space,
    Newline,
}

struct Minifier {
    chars: Vec<char>,
    pos: usize,
    out: String,
    gap: Gap,
}

impl Minifier {
    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn error(&self, at: usize, message: &str) -> SyntaxError {
        SyntaxError::at(&self.chars, at, message)
    }

    fn widen_gap(&mut self, gap: Gap) {
        if gap == Gap::Newline || self.gap == Gap::None {
            self.gap = gap;
        }
    }

    /// Emit the pending gap (if it is still needed) before `next`.
    fn flush_gap(&mut self, next: char) {
        let gap = std::mem::replace(&mut self.gap, Gap::None);
        let Some(prev) = self.out.chars().next_back() else {
            return;
        };
        match gap {
            Gap::None => {}
            Gap::Newline if !NO_BREAK_AFTER.contains(&prev) && !NO_BREAK_BEFORE.contains(&next) => {
                self.out.push('\n');
            }
            Gap::Newline | Gap::Space => {
                let words = is_word(prev) && (is_word(next) || next == '.');
                let joins = prev == next && matches!(next, '+' | '-' | '/');
                if words || joins {
                    self.out.push(' ');
                }
            }
        }
    }

    fn last_word(&self) -> &str {
        let start = self
            .out
            .char_indices()
            .rev()
            .take_while(|(_, c)| is_word(*c))
            .last()
            .map_or(self.out.len(), |(i, _)| i);
        &self.out[start..]
    }

    fn regex_allowed(&self) -> bool {
        match self.out.chars().next_back() {
            None => true,
            Some(c) if is_word(c) => REGEX_KEYWORDS.contains(&self.last_word()),
            Some(')' | ']' | '}') => false,
            Some(_) => true,
        }
    }

    /// Copy a quoted string or template literal verbatim.
    fn quoted(&mut self, quote: char) -> Result<(), SyntaxError> {
        let start = self.pos;
        self.out.push(quote);
        self.pos += 1;
        loop {
            let Some(c) = self.peek_at(0) else {
                return Err(self.error(start, "unterminated string"));
            };
            if c == '\n' && quote != '`' {
                return Err(self.error(start, "unterminated string"));
            }
            self.out.push(c);
            self.pos += 1;
            if c == '\\' {
                if let Some(escaped) = self.peek_at(0) {
                    self.out.push(escaped);
                    self.pos += 1;
                }
            } else if c == quote {
                return Ok(());
            }
        }
    }

    fn regex(&mut self) -> Result<(), SyntaxError> {
        let start = self.pos;
        self.out.push('/');
        self.pos += 1;
        let mut in_class = false;
        loop {
            let Some(c) = self.peek_at(0) else {
                return Err(self.error(start, "unterminated regular expression"));
            };
            if c == '\n' {
                return Err(self.error(start, "unterminated regular expression"));
            }
            self.out.push(c);
            self.pos += 1;
            match c {
                '\\' => {
                    if let Some(escaped) = self.peek_at(0) {
                        self.out.push(escaped);
                        self.pos += 1;
                    }
                }
                '[' => in_class = true,
                ']' => in_class = false,
                '/' if !in_class => break,
                _ => {}
            }
        }
        while let Some(flag) = self.peek_at(0).filter(|c| c.is_ascii_alphabetic()) {
            self.out.push(flag);
            self.pos += 1;
        }
        Ok(())
    }

    fn run(mut self) -> Result<String, SyntaxError> {
        while let Some(c) = self.peek_at(0) {
            match c {
                '/' if self.peek_at(1) == Some('/') => {
                    while self.peek_at(0).is_some_and(|c| c != '\n') {
                        self.pos += 1;
                    }
                    self.widen_gap(Gap::Newline);
                }
                '/' if self.peek_at(1) == Some('*') => {
                    let start = self.pos;
                    self.pos += 2;
                    let mut newline = false;
                    loop {
                        match self.peek_at(0) {
                            None => return Err(self.error(start, "unterminated comment")),
                            Some('*') if self.peek_at(1) == Some('/') => break,
                            Some(c) => newline |= c == '\n',
                        }
                        self.pos += 1;
                    }
                    self.pos += 2;
                    self.widen_gap(if newline { Gap::Newline } else { Gap::Space });
                }
                c if c.is_whitespace() => {
                    self.widen_gap(if c == '\n' { Gap::Newline } else { Gap::Space });
                    self.pos += 1;
                }
                '"' | '\'' | '`' => {
                    self.flush_gap(c);
                    self.quoted(c)?;
                }
                '/' if self.regex_allowed() => {
                    self.flush_gap(c);
                    self.regex()?;
                }
                c => {
                    self.flush_gap(c);
                    self.out.push(c);
                    self.pos += 1;
                }
            }
        }
        Ok(self.out)
    }
}

/// Strip comments and redundant whitespace from a script.
///
/// String, template and regular expression literals are copied verbatim.
/// An unterminated literal or comment is a syntax error.
pub fn minify(input: &str) -> Result<String, SyntaxError> {
    Minifier {
        chars: input.chars().collect(),
        pos: 0,
        out: String::with_capacity(input.len()),
        gap: Gap::None,
    }
    .run()
}

/// `scripts`: bundle the selected scripts into one file.
pub fn bundle(invocation: &Invocation) -> Result<Outcome, TransformError> {
    let TransformOptions::Scripts { output, minify: compress } = &invocation.options else {
        return Err(expect_options("scripts", &invocation.options));
    };
    let mut bundle = String::new();
    let mut bytes_in = 0u64;
    for file in invocation.files(0)? {
        let text = read_text(&file)?;
        bytes_in += text.len() as u64;
        if *compress {
            let minified = minify(&text).map_err(|e| e.in_file(&file))?;
            if minified.is_empty() {
                continue;
            }
            if !bundle.is_empty() {
                if !bundle.ends_with([';', '}']) {
                    bundle.push(';');
                }
                bundle.push('\n');
            }
            bundle.push_str(&minified);
        } else {
            if !bundle.is_empty() {
                bundle.push('\n');
            }
            let relative = invocation.relative(0, &file);
            bundle.push_str(&format!("// {}\n", relative.display()));
            bundle.push_str(text.trim_end());
            bundle.push('\n');
        }
    }
    if *compress && !bundle.is_empty() {
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
