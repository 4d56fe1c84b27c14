//! Fixture setup shared by the integration tests.

#![allow(dead_code)]

use sitepipe::config::PipelineConfig;
use sitepipe::mode::Project;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Copy `fixtures/blog/` to `<tmp>/blog`.
pub fn setup_fixtures() -> TempDir {
    let tmp = TempDir::new().unwrap();
    let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/blog");
    copy_dir(&fixtures, &tmp.path().join("blog"));
    tmp
}

fn copy_dir(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).unwrap();
    for entry in fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), &target).unwrap();
        }
    }
}

pub fn project(tmp: &TempDir) -> Project {
    Project::new(tmp.path(), PipelineConfig::default())
}

pub fn read(tmp: &TempDir, relative: &str) -> String {
    let path = tmp.path().join(relative);
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("cannot read {}: {e}", path.display()))
}

pub fn write(tmp: &TempDir, relative: &str, contents: &str) {
    let path = tmp.path().join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}
