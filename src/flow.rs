//! Working directories shared between pipeline stages.
//!
//! Every run is bound to a [`FileFlow`]: the directory triple
//!
//! ```text
//! source         author-owned, read-only          blog/
//! intermediate   dev scratch, reset per dev run   .tmp/
//! distribution   build output, reset per build    _site/
//! ```
//!
//! Stages never hold absolute paths. They declare [`Location`]s (a root plus
//! a relative path) and the flow resolves them, so the same pipeline
//! definition can be checked statically and run against any project.

use crate::config::PathsConfig;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("failed to reset {path}: {source}")]
    Reset { path: PathBuf, source: io::Error },
    #[error("refusing to reset {0}: it overlaps the read-only source directory")]
    ReadOnlyRoot(PathBuf),
    #[error("invalid preserve pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: globset::Error,
    },
}

/// Which pipeline a flow is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Live preview: writes to the intermediate directory.
    Dev,
    /// Optimized build: writes to the distribution directory.
    Dist,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Dev => write!(f, "dev"),
            Mode::Dist => write!(f, "dist"),
        }
    }
}

/// One of the three working directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Root {
    Source,
    Intermediate,
    Distribution,
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Root::Source => write!(f, "source"),
            Root::Intermediate => write!(f, "intermediate"),
            Root::Distribution => write!(f, "distribution"),
        }
    }
}

/// A directory relative to one of the roots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub root: Root,
    pub path: PathBuf,
}

impl Location {
    pub fn new(root: Root, path: impl Into<PathBuf>) -> Self {
        Self {
            root,
            path: path.into(),
        }
    }

    pub fn source(path: impl Into<PathBuf>) -> Self {
        Self::new(Root::Source, path)
    }

    pub fn intermediate(path: impl Into<PathBuf>) -> Self {
        Self::new(Root::Intermediate, path)
    }

    pub fn distribution(path: impl Into<PathBuf>) -> Self {
        Self::new(Root::Distribution, path)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.as_os_str().is_empty() {
            write!(f, "{}:/", self.root)
        } else {
            write!(f, "{}:/{}", self.root, self.path.display())
        }
    }
}

/// The directory triple bound to one mode.
#[derive(Debug, Clone)]
pub struct FileFlow {
    pub mode: Mode,
    pub source: PathBuf,
    pub assets: PathBuf,
    pub intermediate: PathBuf,
    pub distribution: PathBuf,
    pub preserve: Vec<String>,
}

impl FileFlow {
    /// Bind the configured directories (relative to `base`) to `mode`.
    pub fn for_mode(mode: Mode, paths: &PathsConfig, base: &Path) -> Self {
        let source = base.join(&paths.source);
        Self {
            mode,
            assets: source.join(&paths.assets),
            source,
            intermediate: base.join(&paths.intermediate),
            distribution: base.join(&paths.distribution),
            preserve: paths.preserve.clone(),
        }
    }

    pub fn root(&self, root: Root) -> &Path {
        match root {
            Root::Source => &self.source,
            Root::Intermediate => &self.intermediate,
            Root::Distribution => &self.distribution,
        }
    }

    pub fn resolve(&self, location: &Location) -> PathBuf {
        self.root(location.root).join(&location.path)
    }

    /// The root a run in this mode writes into and resets.
    pub fn scope(&self) -> Root {
        match self.mode {
            Mode::Dev => Root::Intermediate,
            Mode::Dist => Root::Distribution,
        }
    }

    /// Directories the HTTP server resolves requests against, first hit wins.
    ///
    /// Dev serves freshly built pages and bundles from the intermediate
    /// directory and falls back to the raw assets and source tree, so images
    /// need no copy step while previewing.
    pub fn serve_roots(&self) -> Vec<PathBuf> {
        match self.mode {
            Mode::Dev => vec![
                self.intermediate.clone(),
                self.assets.clone(),
                self.source.clone(),
            ],
            Mode::Dist => vec![self.distribution.clone()],
        }
    }

    /// Empty the directory for `scope`, leaving it existing.
    ///
    /// The distribution directory keeps top-level entries matching the
    /// preserve patterns (`.git*` by default); the intermediate directory is
    /// cleared completely.
    ///
    /// A scoped directory that is, contains or sits inside the source tree
    /// is refused, whatever the spelling of the configured path.
    pub fn reset(&self, scope: Root) -> Result<(), FlowError> {
        let dir = self.root(scope);
        if scope == Root::Source || self.aliases_source(dir) {
            return Err(FlowError::ReadOnlyRoot(dir.to_path_buf()));
        }
        match scope {
            Root::Distribution => reset_dir(dir, &self.preserve),
            _ => reset_dir(dir, &[]),
        }
    }

    fn aliases_source(&self, dir: &Path) -> bool {
        let absolute = |p: &Path| std::path::absolute(p).unwrap_or_else(|_| p.to_path_buf());
        if dirs_overlap(&absolute(dir), &absolute(&self.source)) {
            return true;
        }
        // Symlinks only show up once both ends exist.
        match (dir.canonicalize(), self.source.canonicalize()) {
            (Ok(dir), Ok(source)) => dirs_overlap(&dir, &source),
            _ => false,
        }
    }
}

/// Fold `.` and `..` components without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True when one directory is, or lies inside, the other.
pub fn dirs_overlap(a: &Path, b: &Path) -> bool {
    let (a, b) = (normalize(a), normalize(b));
    a.starts_with(&b) || b.starts_with(&a)
}

fn preserve_set(patterns: &[String]) -> Result<GlobSet, FlowError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| FlowError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| FlowError::Pattern {
        pattern: patterns.join(","),
        source,
    })
}

/// Recursively delete everything inside `dir` except top-level entries
/// whose names match `preserve`, then make sure `dir` exists.
pub fn reset_dir(dir: &Path, preserve: &[String]) -> Result<(), FlowError> {
    let keep = preserve_set(preserve)?;
    let fail = |path: &Path, source: io::Error| FlowError::Reset {
        path: path.to_path_buf(),
        source,
    };

    match fs::symlink_metadata(dir) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(dir).map_err(|e| fail(dir, e))?,
        Ok(_) => {
            for entry in fs::read_dir(dir).map_err(|e| fail(dir, e))? {
                let entry = entry.map_err(|e| fail(dir, e))?;
                if keep.is_match(entry.file_name()) {
                    continue;
                }
                let path = entry.path();
                let file_type = entry.file_type().map_err(|e| fail(&path, e))?;
                if file_type.is_dir() {
                    fs::remove_dir_all(&path).map_err(|e| fail(&path, e))?;
                } else {
                    fs::remove_file(&path).map_err(|e| fail(&path, e))?;
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(fail(dir, e)),
    }
    fs::create_dir_all(dir).map_err(|e| fail(dir, e))
}

/// SHA-256 over every file below `dir`: sorted relative paths and contents.
///
/// Two runs that produce byte-identical trees produce the same digest.
pub fn tree_digest(dir: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(fs::read(entry.path())?);
        hasher.update(b"\0");
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn flow(tmp: &TempDir, mode: Mode) -> FileFlow {
        FileFlow::for_mode(mode, &PathsConfig::default(), tmp.path())
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn for_mode_resolves_against_base() {
        let tmp = TempDir::new().unwrap();
        let flow = flow(&tmp, Mode::Dist);
        assert_eq!(flow.source, tmp.path().join("blog"));
        assert_eq!(flow.assets, tmp.path().join("blog/_assets"));
        assert_eq!(flow.distribution, tmp.path().join("_site"));
        assert_eq!(
            flow.resolve(&Location::distribution("css")),
            tmp.path().join("_site/css")
        );
        assert_eq!(flow.scope(), Root::Distribution);
    }

    #[test]
    fn reset_distribution_clears_everything_but_git() {
        let tmp = TempDir::new().unwrap();
        let flow = flow(&tmp, Mode::Dist);
        let dist = &flow.distribution;
        fs::create_dir_all(dist.join("css/nested")).unwrap();
        fs::write(dist.join("css/nested/a.css"), "a").unwrap();
        fs::write(dist.join("index.html"), "x").unwrap();
        fs::write(dist.join(".hidden"), "x").unwrap();
        fs::create_dir_all(dist.join(".git")).unwrap();
        fs::write(dist.join(".git/HEAD"), "ref").unwrap();
        fs::write(dist.join(".gitignore"), "*").unwrap();

        flow.reset(Root::Distribution).unwrap();

        assert_eq!(entries(dist), vec![".git", ".gitignore"]);
        assert!(dist.join(".git/HEAD").exists());
    }

    #[test]
    fn reset_intermediate_clears_dotfiles_too() {
        let tmp = TempDir::new().unwrap();
        let flow = flow(&tmp, Mode::Dev);
        fs::create_dir_all(flow.intermediate.join(".git")).unwrap();
        fs::write(flow.intermediate.join(".x"), "x").unwrap();

        flow.reset(Root::Intermediate).unwrap();

        assert!(flow.intermediate.is_dir());
        assert!(entries(&flow.intermediate).is_empty());
    }

    #[test]
    fn reset_creates_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let flow = flow(&tmp, Mode::Dist);
        assert!(!flow.distribution.exists());
        flow.reset(Root::Distribution).unwrap();
        assert!(flow.distribution.is_dir());
    }

    #[test]
    fn reset_replaces_file_with_directory() {
        let tmp = TempDir::new().unwrap();
        let flow = flow(&tmp, Mode::Dist);
        fs::write(&flow.distribution, "not a dir").unwrap();
        flow.reset(Root::Distribution).unwrap();
        assert!(flow.distribution.is_dir());
    }

    #[test]
    fn reset_source_is_refused() {
        let tmp = TempDir::new().unwrap();
        let flow = flow(&tmp, Mode::Dev);
        assert!(matches!(
            flow.reset(Root::Source),
            Err(FlowError::ReadOnlyRoot(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn reset_reports_blocked_deletion() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let flow = flow(&tmp, Mode::Dist);
        let locked = flow.distribution.join("locked");
        fs::create_dir_all(&locked).unwrap();
        fs::write(locked.join("f"), "x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o500)).unwrap();

        // Root ignores directory permissions.
        if fs::write(locked.join("probe"), "x").is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o700)).unwrap();
            return;
        }

        let result = flow.reset(Root::Distribution);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o700)).unwrap();
        assert!(matches!(result, Err(FlowError::Reset { .. })));
    }

    #[test]
    fn serve_roots_per_mode() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(
            flow(&tmp, Mode::Dev).serve_roots(),
            vec![
                tmp.path().join(".tmp"),
                tmp.path().join("blog/_assets"),
                tmp.path().join("blog"),
            ]
        );
        assert_eq!(
            flow(&tmp, Mode::Dist).serve_roots(),
            vec![tmp.path().join("_site")]
        );
    }

    #[test]
    fn normalize_folds_dots() {
        assert_eq!(normalize(Path::new("./blog/")), PathBuf::from("blog"));
        assert_eq!(normalize(Path::new("blog/../blog")), PathBuf::from("blog"));
        assert_eq!(normalize(Path::new("a/./b/../../c")), PathBuf::from("c"));
        assert_eq!(normalize(Path::new("../x/..")), PathBuf::from(".."));
        assert_eq!(normalize(Path::new("/..")), PathBuf::from("/"));
        assert_eq!(normalize(Path::new(".")), PathBuf::new());
    }

    #[test]
    fn nested_directories_overlap() {
        assert!(dirs_overlap(Path::new("blog"), Path::new("./blog/")));
        assert!(dirs_overlap(Path::new("blog"), Path::new("blog/_site")));
        assert!(dirs_overlap(Path::new("blog"), Path::new(".")));
        assert!(!dirs_overlap(Path::new("blog"), Path::new("_site")));
        assert!(!dirs_overlap(Path::new("blog"), Path::new("blog-old")));
    }

    #[test]
    fn reset_refuses_a_root_aliasing_the_source() {
        for distribution in ["blog/", "./blog", "blog/../blog", "blog/_site", "."] {
            let tmp = TempDir::new().unwrap();
            fs::create_dir_all(tmp.path().join("blog")).unwrap();
            fs::write(tmp.path().join("blog/index.md"), "# hi").unwrap();
            let paths = PathsConfig {
                distribution: distribution.to_string(),
                ..PathsConfig::default()
            };
            let flow = FileFlow::for_mode(Mode::Dist, &paths, tmp.path());

            assert!(
                matches!(flow.reset(Root::Distribution), Err(FlowError::ReadOnlyRoot(_))),
                "{distribution}"
            );
            assert!(tmp.path().join("blog/index.md").exists(), "{distribution}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn reset_refuses_a_symlink_into_the_source() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("blog")).unwrap();
        fs::write(tmp.path().join("blog/index.md"), "# hi").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("blog"), tmp.path().join(".tmp")).unwrap();
        let flow = flow(&tmp, Mode::Dev);

        assert!(matches!(
            flow.reset(Root::Intermediate),
            Err(FlowError::ReadOnlyRoot(_))
        ));
        assert!(tmp.path().join("blog/index.md").exists());
    }

    #[test]
    fn tree_digest_tracks_paths_and_contents() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("a")).unwrap();
        fs::write(tmp.path().join("a/x"), "1").unwrap();
        let first = tree_digest(tmp.path()).unwrap();
        assert_eq!(first, tree_digest(tmp.path()).unwrap());

        fs::write(tmp.path().join("a/x"), "2").unwrap();
        let changed = tree_digest(tmp.path()).unwrap();
        assert_ne!(first, changed);

        fs::rename(tmp.path().join("a/x"), tmp.path().join("a/y")).unwrap();
        assert_ne!(changed, tree_digest(tmp.path()).unwrap());
    }
}
