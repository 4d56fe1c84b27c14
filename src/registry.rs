//! Named transforms and the registry that dispatches to them.
//!
//! A transform is an opaque `(input files, options) -> output files`
//! function. The pipeline never calls one directly: it resolves a stage into
//! an [`Invocation`] and asks the [`Registry`] to run the transform registered
//! under the stage's transform name.
//!
//! Everything a transform needs arrives in the invocation, fully resolved:
//! absolute input roots with their glob patterns, the output directory, and
//! a closed [`TransformOptions`] record. There is no ambient state and no
//! placeholder left to expand.

use crate::config::{ConfigError, HtmlConfig};
use globset::{GlobBuilder, GlobMatcher};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("IO error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("missing input file: {0}")]
    MissingInput(PathBuf),
    #[error("syntax error in {path}: {message}")]
    Syntax { path: PathBuf, message: String },
    #[error("image error in {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("transform '{transform}' cannot use {got} options")]
    Options {
        transform: &'static str,
        got: &'static str,
    },
    #[error("site config error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid glob '{pattern}': {source}")]
    Glob {
        pattern: String,
        source: globset::Error,
    },
}

impl TransformError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransformError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown transform '{0}'")]
    UnknownTransform(String),
    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// Options for the markup compiler.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkupOptions {
    /// Site settings files relative to the source root, later ones winning.
    pub config_files: Vec<String>,
    /// Server-Sent Events endpoint pages subscribe to for reloads (dev only).
    pub live_reload: Option<String>,
    /// Stylesheet href relative to the site root.
    pub stylesheet: String,
    /// Script href relative to the site root.
    pub script: String,
}

/// Options for raster image optimization.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterOptions {
    pub jpeg_quality: u8,
    /// Processing cache directory; `None` disables caching entirely.
    pub cache_dir: Option<PathBuf>,
    /// Consult existing cache entries. When false, results are still stored.
    pub read_cache: bool,
}

/// Closed set of per-transform options.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOptions {
    Markup(MarkupOptions),
    Concat { output: String },
    Prefix,
    MinifyCss,
    Scripts { output: String, minify: bool },
    Copy { flatten: bool },
    Raster(RasterOptions),
    Vector,
    Critical { fold_elements: usize, minify: bool },
    MinifyHtml(HtmlConfig),
}

impl TransformOptions {
    pub fn kind(&self) -> &'static str {
        match self {
            TransformOptions::Markup(_) => "markup",
            TransformOptions::Concat { .. } => "concat",
            TransformOptions::Prefix => "prefix",
            TransformOptions::MinifyCss => "minify-css",
            TransformOptions::Scripts { .. } => "scripts",
            TransformOptions::Copy { .. } => "copy",
            TransformOptions::Raster(_) => "raster",
            TransformOptions::Vector => "vector",
            TransformOptions::Critical { .. } => "critical",
            TransformOptions::MinifyHtml(_) => "minify-html",
        }
    }
}

/// A root directory plus the glob patterns selected below it.
#[derive(Debug, Clone, PartialEq)]
pub struct Input {
    pub root: PathBuf,
    pub patterns: Vec<String>,
}

fn is_literal(pattern: &str) -> bool {
    !pattern.contains(['*', '?', '[', '{'])
}

fn matcher(pattern: &str) -> Result<GlobMatcher, TransformError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|source| TransformError::Glob {
            pattern: pattern.to_string(),
            source,
        })
}

impl Input {
    pub fn new(root: impl Into<PathBuf>, patterns: &[&str]) -> Self {
        Self {
            root: root.into(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Matching files as absolute paths.
    ///
    /// Files are ordered pattern by pattern (so a list of literal names
    /// keeps its order), sorted within each pattern, without duplicates.
    /// A literal pattern naming a file that does not exist is an error;
    /// a glob matching nothing is not.
    pub fn files(&self) -> Result<Vec<PathBuf>, TransformError> {
        let mut candidates = Vec::new();
        if self.root.is_dir() {
            for entry in WalkDir::new(&self.root).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    let path = e.path().unwrap_or(&self.root).to_path_buf();
                    TransformError::io(path, io::Error::other(e))
                })?;
                if entry.file_type().is_file() {
                    candidates.push(entry.into_path());
                }
            }
        }

        let mut files: Vec<PathBuf> = Vec::new();
        for pattern in &self.patterns {
            if is_literal(pattern) {
                let path = self.root.join(pattern);
                if !path.is_file() {
                    return Err(TransformError::MissingInput(path));
                }
                if !files.contains(&path) {
                    files.push(path);
                }
                continue;
            }
            let glob = matcher(pattern)?;
            for path in &candidates {
                let relative = path.strip_prefix(&self.root).unwrap_or(path);
                if glob.is_match(relative) && !files.contains(path) {
                    files.push(path.clone());
                }
            }
        }
        Ok(files)
    }
}

/// A fully resolved call of one transform.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Name of the stage this call belongs to (for messages).
    pub stage: String,
    pub inputs: Vec<Input>,
    pub output: PathBuf,
    pub options: TransformOptions,
}

impl Invocation {
    /// Files of the input at `index`; an absent input selects nothing.
    pub fn files(&self, index: usize) -> Result<Vec<PathBuf>, TransformError> {
        match self.inputs.get(index) {
            Some(input) => input.files(),
            None => Ok(Vec::new()),
        }
    }

    /// Path of `file` relative to the root of the input at `index`.
    pub fn relative<'a>(&self, index: usize, file: &'a Path) -> &'a Path {
        self.inputs
            .get(index)
            .and_then(|input| file.strip_prefix(&input.root).ok())
            .unwrap_or(file)
    }
}

/// What a transform did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// Written files, relative to the output directory.
    pub written: Vec<PathBuf>,
    /// Total size of the files read.
    pub bytes_in: u64,
    /// Total size of the files written.
    pub bytes_out: u64,
    /// Extra one-line detail (cache statistics and the like).
    pub note: Option<String>,
}

/// A named file-set conversion.
pub trait Transform: Send + Sync {
    fn run(&self, invocation: &Invocation) -> Result<Outcome, TransformError>;
}

impl<F> Transform for F
where
    F: Fn(&Invocation) -> Result<Outcome, TransformError> + Send + Sync,
{
    fn run(&self, invocation: &Invocation) -> Result<Outcome, TransformError> {
        self(invocation)
    }
}

/// Name → transform lookup. Stateless apart from the table itself.
#[derive(Clone, Default)]
pub struct Registry {
    transforms: HashMap<String, Arc<dyn Transform>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in transform.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::transforms::register_builtins(&mut registry);
        registry
    }

    /// Add (or replace) the transform registered under `name`.
    pub fn register(&mut self, name: impl Into<String>, transform: impl Transform + 'static) {
        self.transforms.insert(name.into(), Arc::new(transform));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.transforms.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn invoke(&self, name: &str, invocation: &Invocation) -> Result<Outcome, RegistryError> {
        let transform = self
            .transforms
            .get(name)
            .ok_or_else(|| RegistryError::UnknownTransform(name.to_string()))?;
        Ok(transform.run(invocation)?)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("transforms", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn invocation(output: &Path) -> Invocation {
        Invocation {
            stage: "test".into(),
            inputs: Vec::new(),
            output: output.to_path_buf(),
            options: TransformOptions::Prefix,
        }
    }

    #[test]
    fn invoke_dispatches_by_name() {
        let mut registry = Registry::new();
        registry.register("echo", |inv: &Invocation| -> Result<Outcome, TransformError> {
            Ok(Outcome {
                note: Some(inv.stage.clone()),
                ..Outcome::default()
            })
        });
        let outcome = registry
            .invoke("echo", &invocation(Path::new("/tmp")))
            .unwrap();
        assert_eq!(outcome.note.as_deref(), Some("test"));
    }

    #[test]
    fn invoke_unknown_transform() {
        let registry = Registry::new();
        let err = registry
            .invoke("nope", &invocation(Path::new("/tmp")))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownTransform(name) if name == "nope"));
    }

    #[test]
    fn transform_errors_pass_through() {
        let mut registry = Registry::new();
        registry.register("fail", |_: &Invocation| -> Result<Outcome, TransformError> {
            Err(TransformError::MissingInput(PathBuf::from("x.css")))
        });
        let err = registry
            .invoke("fail", &invocation(Path::new("/tmp")))
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Transform(TransformError::MissingInput(_))
        ));
    }

    #[test]
    fn builtins_are_registered() {
        let registry = Registry::with_builtins();
        for name in [
            "markup",
            "concat-css",
            "prefix-css",
            "minify-css",
            "scripts",
            "copy",
            "optimize-raster",
            "optimize-vector",
            "critical-css",
            "minify-html",
        ] {
            assert!(registry.contains(name), "missing builtin {name}");
        }
    }

    #[test]
    fn input_keeps_literal_order() {
        let tmp = TempDir::new().unwrap();
        for name in ["a.css", "b.css", "c.css"] {
            fs::write(tmp.path().join(name), name).unwrap();
        }
        let input = Input::new(tmp.path(), &["c.css", "a.css", "*.css"]);
        let names: Vec<_> = input
            .files()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["c.css", "a.css", "b.css"]);
    }

    #[test]
    fn input_missing_literal_is_error() {
        let tmp = TempDir::new().unwrap();
        let input = Input::new(tmp.path(), &["poole.css"]);
        assert!(matches!(
            input.files(),
            Err(TransformError::MissingInput(_))
        ));
    }

    #[test]
    fn input_glob_respects_separators() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("top.css"), "").unwrap();
        fs::write(tmp.path().join("sub/deep.css"), "").unwrap();
        fs::write(tmp.path().join("sub/.hidden.css"), "").unwrap();

        let shallow = Input::new(tmp.path(), &["*.css"]).files().unwrap();
        assert_eq!(shallow, vec![tmp.path().join("top.css")]);

        let deep = Input::new(tmp.path(), &["**/*.css"]).files().unwrap();
        assert_eq!(deep.len(), 3);
    }

    #[test]
    fn input_missing_root_matches_nothing() {
        let tmp = TempDir::new().unwrap();
        let input = Input::new(tmp.path().join("absent"), &["**/*.js"]);
        assert!(input.files().unwrap().is_empty());
    }
}
