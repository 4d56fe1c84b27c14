//! Built-in transforms.
//!
//! Each stands in for one external collaborator of a classic front-end
//! build: markup compiler, CSS concatenator / prefixer / minifier, script
//! bundler, image optimizers, critical-CSS extractor and HTML minifier.
//! They are small and deterministic: identical inputs and options always
//! produce identical bytes.
//!
//! | Name | Function | Writes |
//! |---|---|---|
//! | `markup` | [`markup::compile`] | one `.html` per page |
//! | `concat-css` | [`css::concat`] | one stylesheet |
//! | `prefix-css` | [`css::prefix`] | stylesheets in place |
//! | `minify-css` | [`css::minify_stage`] | stylesheets in place |
//! | `scripts` | [`scripts::bundle`] | one script bundle |
//! | `copy` | [`images::copy`] | copied files |
//! | `optimize-raster` | [`images::optimize_raster`] | images in place |
//! | `optimize-vector` | [`images::optimize_vector`] | SVGs in place |
//! | `critical-css` | [`critical::inline`] | pages in place |
//! | `minify-html` | [`html::minify_stage`] | pages in place |

pub mod critical;
pub mod css;
pub mod html;
pub mod images;
pub mod markup;
pub mod scripts;

use crate::registry::{Registry, TransformError, TransformOptions};
use std::fs;
use std::path::{Path, PathBuf};

/// Register every built-in transform under its canonical name.
pub fn register_builtins(registry: &mut Registry) {
    registry.register("markup", markup::compile);
    registry.register("concat-css", css::concat);
    registry.register("prefix-css", css::prefix);
    registry.register("minify-css", css::minify_stage);
    registry.register("scripts", scripts::bundle);
    registry.register("copy", images::copy);
    registry.register("optimize-raster", images::optimize_raster);
    registry.register("optimize-vector", images::optimize_vector);
    registry.register("critical-css", critical::inline);
    registry.register("minify-html", html::minify_stage);
}

/// A parse failure in one of the text transforms, with a 1-based line.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl SyntaxError {
    pub(crate) fn at(text: &[char], pos: usize, message: impl Into<String>) -> Self {
        let end = pos.min(text.len());
        Self {
            line: 1 + text[..end].iter().filter(|&&c| c == '\n').count(),
            message: message.into(),
        }
    }

    pub(crate) fn in_file(self, path: &Path) -> TransformError {
        TransformError::Syntax {
            path: path.to_path_buf(),
            message: self.to_string(),
        }
    }
}

pub(crate) fn expect_options(transform: &'static str, got: &TransformOptions) -> TransformError {
    TransformError::Options {
        transform,
        got: got.kind(),
    }
}

pub(crate) fn read_text(path: &Path) -> Result<String, TransformError> {
    fs::read_to_string(path).map_err(|e| TransformError::io(path, e))
}

pub(crate) fn read_bytes(path: &Path) -> Result<Vec<u8>, TransformError> {
    fs::read(path).map_err(|e| TransformError::io(path, e))
}

/// Write `bytes` to `output_dir/relative`, creating parent directories.
/// Returns `relative` for the outcome's list of written files.
pub(crate) fn write_output(
    output_dir: &Path,
    relative: &Path,
    bytes: &[u8],
) -> Result<PathBuf, TransformError> {
    let path = output_dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| TransformError::io(parent, e))?;
    }
    fs::write(&path, bytes).map_err(|e| TransformError::io(&path, e))?;
    Ok(relative.to_path_buf())
}
