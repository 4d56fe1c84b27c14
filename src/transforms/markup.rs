//! Markup compilation: source pages to HTML documents.
//!
//! ## Pages
//!
//! Every `.md`, `.mkd`, `.markdown` and `.html` file below the source root
//! is a page, except paths with a component starting with `_` or `.`
//! (assets, config, drafts folders, dotfiles). A page may open with TOML
//! front matter between `+++` lines:
//!
//! ```text
//! +++
//! title = "Hello"
//! draft = false
//! +++
//! # Hello
//! ```
//!
//! Markdown pages are rendered with pulldown-cmark and wrapped in the site
//! layout. HTML pages with front matter are wrapped too; HTML pages without
//! it are complete documents and are copied as they are.
//!
//! ## Layout
//!
//! The layout links the bundled stylesheet and script under the site's
//! `baseurl`. In dev mode it also subscribes to the live-reload endpoint.
//!
//! ## Convergence
//!
//! After writing, `.html` files in the output directory that this run did
//! not produce (deleted pages, new drafts) are removed, so a rebuild after
//! any edit leaves the same tree as a build from scratch.

use super::{expect_options, read_text, write_output};
use crate::config::{SiteSettings, load_site_settings};
use crate::registry::{Invocation, MarkupOptions, Outcome, TransformError, TransformOptions};
use maud::{DOCTYPE, Markup, PreEscaped, html};
use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd, html as md_html};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

const FRONT_MATTER_FENCE: &str = "+++";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FrontMatter {
    title: Option<String>,
    draft: bool,
}

/// Split `+++` front matter off the top of a page.
fn split_front_matter(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix(FRONT_MATTER_FENCE)?;
    let rest = rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n'))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == FRONT_MATTER_FENCE {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

fn is_hidden(relative: &Path) -> bool {
    relative.components().any(|c| match c {
        Component::Normal(name) => name
            .to_str()
            .is_some_and(|n| n.starts_with('_') || n.starts_with('.')),
        _ => false,
    })
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "md" | "mkd" | "markdown"))
}

/// Text of the first level-one heading.
fn first_heading(markdown: &str) -> Option<String> {
    let mut title: Option<String> = None;
    for event in Parser::new(markdown) {
        match event {
            Event::Start(Tag::Heading {
                level: HeadingLevel::H1,
                ..
            }) if title.is_none() => title = Some(String::new()),
            Event::Text(t) | Event::Code(t) => {
                if let Some(text) = title.as_mut() {
                    text.push_str(&t);
                }
            }
            Event::End(TagEnd::Heading(_)) if title.is_some() => break,
            _ => {}
        }
    }
    title.filter(|t| !t.trim().is_empty())
}

fn render_markdown(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    let mut body = String::new();
    md_html::push_html(&mut body, Parser::new_ext(markdown, options));
    body
}

fn site_href(site: &SiteSettings, path: &str) -> String {
    format!(
        "{}/{}",
        site.baseurl.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// URL path of an output file: `index.html` maps to its directory.
fn page_url(output: &Path) -> String {
    let url = output
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect::<Vec<_>>()
        .join("/");
    match url.strip_suffix("index.html") {
        Some(dir) => dir.to_string(),
        None => url,
    }
}

fn reload_snippet(endpoint: &str) -> String {
    format!("new EventSource(\"{endpoint}\").onmessage=function(){{location.reload()}};")
}

fn layout(
    site: &SiteSettings,
    options: &MarkupOptions,
    title: &str,
    url: &str,
    content: Markup,
) -> Markup {
    let page_title = if title == site.title {
        title.to_string()
    } else {
        format!("{title} · {}", site.title)
    };
    let canonical = (!site.url.is_empty())
        .then(|| format!("{}{}", site.url.trim_end_matches('/'), site_href(site, url)));
    html! {
        (DOCTYPE)
        html lang=(site.lang) {
            head {
                meta charset="UTF-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                title { (page_title) }
                @if !site.description.is_empty() {
                    meta name="description" content=(site.description);
                }
                @if !site.author.is_empty() {
                    meta name="author" content=(site.author);
                }
                @if let Some(href) = canonical {
                    link rel="canonical" href=(href);
                }
                link rel="stylesheet" href=(site_href(site, &options.stylesheet));
            }
            body {
                header.masthead {
                    h3.masthead-title {
                        a href=(site_href(site, "")) { (site.title) }
                    }
                    @if !site.description.is_empty() {
                        p.lead { (site.description) }
                    }
                }
                main.content {
                    (content)
                }
                script src=(site_href(site, &options.script)) {}
                @if let Some(endpoint) = &options.live_reload {
                    script { (PreEscaped(reload_snippet(endpoint))) }
                }
            }
        }
    }
}

/// Compile one page. `None` for drafts.
fn compile_page(
    relative: &Path,
    text: &str,
    site: &SiteSettings,
    options: &MarkupOptions,
) -> Result<Option<(PathBuf, String)>, String> {
    let (front, body) = match split_front_matter(text) {
        Some((raw, body)) => {
            let front: FrontMatter = toml::from_str(raw).map_err(|e| e.to_string())?;
            (Some(front), body)
        }
        None => (None, text),
    };
    if front.as_ref().is_some_and(|f| f.draft) {
        return Ok(None);
    }
    let output = relative.with_extension("html");
    let markdown = is_markdown(relative);
    if !markdown && front.is_none() {
        return Ok(Some((output, text.to_string())));
    }

    let stem = relative
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    let title = front
        .and_then(|f| f.title)
        .or_else(|| markdown.then(|| first_heading(body)).flatten())
        .unwrap_or(stem);
    let content = if markdown {
        render_markdown(body)
    } else {
        body.to_string()
    };
    let url = page_url(&output);
    let page = layout(site, options, &title, &url, html! { (PreEscaped(content)) });
    Ok(Some((output, page.into_string())))
}

/// Delete `.html` files under `dir` that are not in `keep`.
fn remove_stale(dir: &Path, keep: &BTreeSet<PathBuf>) -> Result<Vec<PathBuf>, TransformError> {
    let mut removed = Vec::new();
    if !dir.is_dir() {
        return Ok(removed);
    }
    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
    for entry in walker {
        let entry = entry.map_err(|e| TransformError::io(dir, std::io::Error::other(e)))?;
        let path = entry.path();
        let is_html = path.extension().is_some_and(|e| e == "html");
        if !entry.file_type().is_file() || !is_html {
            continue;
        }
        let relative = path.strip_prefix(dir).unwrap_or(path).to_path_buf();
        if !keep.contains(&relative) {
            fs::remove_file(path).map_err(|e| TransformError::io(path, e))?;
            removed.push(relative);
        }
    }
    Ok(removed)
}

/// `markup`: compile every page of the source tree into the output
/// directory, mirroring its structure.
pub fn compile(invocation: &Invocation) -> Result<Outcome, TransformError> {
    let TransformOptions::Markup(options) = &invocation.options else {
        return Err(expect_options("markup", &invocation.options));
    };
    let Some(input) = invocation.inputs.first() else {
        return Ok(Outcome::default());
    };
    let site = load_site_settings(&input.root, &options.config_files)?;

    let mut outcome = Outcome::default();
    let mut produced = BTreeSet::new();
    let mut drafts = 0usize;
    for file in invocation.files(0)? {
        let relative = invocation.relative(0, &file).to_path_buf();
        if is_hidden(&relative) {
            continue;
        }
        let text = read_text(&file)?;
        outcome.bytes_in += text.len() as u64;
        let compiled = compile_page(&relative, &text, &site, options).map_err(|message| {
            TransformError::Syntax {
                path: file.clone(),
                message: format!("front matter: {message}"),
            }
        })?;
        let Some((output, page)) = compiled else {
            drafts += 1;
            continue;
        };
        outcome.bytes_out += page.len() as u64;
        let written = write_output(&invocation.output, &output, page.as_bytes())?;
        produced.insert(written.clone());
        outcome.written.push(written);
    }

    let removed = remove_stale(&invocation.output, &produced)?;
    let mut notes = Vec::new();
    if drafts > 0 {
        notes.push(format!("{drafts} drafts skipped"));
    }
    if !removed.is_empty() {
        notes.push(format!("{} stale pages removed", removed.len()));
    }
    outcome.note = (!notes.is_empty()).then(|| notes.join(", "));
    Ok(outcome)
}
