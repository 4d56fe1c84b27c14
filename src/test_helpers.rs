//! Shared test utilities.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tmp = setup_fixtures();
//! let project = fixture_project(&tmp);
//! let report = project.run(Mode::Dist, None).unwrap();
//!
//! let page = read(&tmp, "_site/index.html");
//! assert!(page.contains("<title>Field Notes"));
//! ```

use crate::config::PipelineConfig;
use crate::mode::Project;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

// =========================================================================
// Fixture setup
// =========================================================================

/// Copy `fixtures/blog/` to `<tmp>/blog` and return the temp directory.
///
/// Tests get an isolated project they can mutate without affecting other
/// tests or the source fixtures.
pub fn setup_fixtures() -> TempDir {
    let tmp = TempDir::new().unwrap();
    let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/blog");
    let blog = tmp.path().join("blog");
    fs::create_dir_all(&blog).unwrap();
    copy_dir_recursive(&fixtures, &blog).unwrap();
    tmp
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if src_path.is_dir() {
            fs::create_dir_all(&dst_path)?;
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// A project over the fixture copy with stock config.
pub fn fixture_project(tmp: &TempDir) -> Project {
    Project::new(tmp.path(), PipelineConfig::default())
}

// =========================================================================
// File access: panics with a clear message on miss
// =========================================================================

/// Read a file relative to the temp root.
pub fn read(tmp: &TempDir, relative: &str) -> String {
    let path = tmp.path().join(relative);
    fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("cannot read {}: {e}", path.display()))
}

/// Overwrite (or create) a file relative to the temp root.
pub fn write(tmp: &TempDir, relative: &str, contents: &str) {
    let path = tmp.path().join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, contents).unwrap();
}

/// Write a small RGB PNG whose pixels depend on `seed`.
pub fn write_png(path: &Path, seed: u8) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let img = image::RgbImage::from_fn(16, 16, |x, y| {
        image::Rgb([(x * 16) as u8, (y * 16) as u8, seed])
    });
    img.save(path).unwrap();
}
