//! Processing cache for raster image optimization.
//!
//! Re-encoding every PNG at maximum compression is the slowest part of a
//! build, and the distribution directory is wiped at the start of each one.
//! This module keeps optimized images in a separate cache directory so an
//! unchanged image is copied instead of re-encoded.
//!
//! # Design
//!
//! The cache is **content-addressed**: lookups are by the combination of
//! `source_hash` and `params_hash`, never by filename. Renaming or moving an
//! image does not invalidate it; changing its bytes or the encoder settings
//! does.
//!
//! - **`source_hash`**: SHA-256 of the source file contents. Content-based
//!   rather than mtime-based so it survives `git checkout`.
//! - **`params_hash`**: SHA-256 of the format and encoder settings.
//!
//! A cache hit requires:
//! 1. An entry with matching `source_hash` and `params_hash` exists
//! 2. The stored file still exists in the cache directory
//!
//! ## Storage
//!
//! ```text
//! .sitepipe-cache/
//! ├── .cache-manifest.json
//! └── objects/
//!     └── <source_hash>-<params_hash>.png
//! ```
//!
//! ## Bypassing the cache
//!
//! Pass `--no-cache` to force every image through the encoder. Results are
//! still written back so the next cached build benefits.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the cache manifest file within the cache directory.
const MANIFEST_FILENAME: &str = ".cache-manifest.json";

/// Directory for stored objects within the cache directory.
const OBJECTS_DIR: &str = "objects";

/// Version of the cache manifest format. Bump this to invalidate all
/// existing caches when the format or key computation changes.
const MANIFEST_VERSION: u32 = 1;

/// A single cached object.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub source_hash: String,
    pub params_hash: String,
}

/// On-disk cache manifest mapping stored object paths to their cache entries.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheManifest {
    pub version: u32,
    pub entries: HashMap<String, CacheEntry>,
    /// Runtime reverse index: `"{source_hash}:{params_hash}"` → object path.
    #[serde(skip)]
    content_index: HashMap<String, String>,
}

impl CacheManifest {
    /// Create an empty manifest (first build or corrupt cache).
    pub fn empty() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: HashMap::new(),
            content_index: HashMap::new(),
        }
    }

    /// Load from the cache directory. Returns an empty manifest if the
    /// file doesn't exist or can't be parsed (version mismatch, corruption).
    pub fn load(cache_dir: &Path) -> Self {
        let content = match std::fs::read_to_string(manifest_path(cache_dir)) {
            Ok(c) => c,
            Err(_) => return Self::empty(),
        };
        let mut manifest: Self = match serde_json::from_str(&content) {
            Ok(m) => m,
            Err(_) => return Self::empty(),
        };
        if manifest.version != MANIFEST_VERSION {
            return Self::empty();
        }
        manifest.content_index = manifest
            .entries
            .iter()
            .map(|(path, entry)| (content_key(&entry.source_hash, &entry.params_hash), path.clone()))
            .collect();
        manifest
    }

    /// Save to the cache directory, creating it if needed.
    pub fn save(&self, cache_dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(cache_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(manifest_path(cache_dir), json)
    }

    /// Absolute path of a stored object, if it is indexed and still on disk.
    pub fn find_cached(
        &self,
        source_hash: &str,
        params_hash: &str,
        cache_dir: &Path,
    ) -> Option<PathBuf> {
        let stored = self
            .content_index
            .get(&content_key(source_hash, params_hash))?;
        let path = cache_dir.join(stored);
        path.exists().then_some(path)
    }

    /// Store `bytes` as the optimized result for the given hashes and
    /// index it. `extension` keeps stored objects recognizable on disk.
    pub fn store(
        &mut self,
        cache_dir: &Path,
        source_hash: &str,
        params_hash: &str,
        extension: &str,
        bytes: &[u8],
    ) -> io::Result<()> {
        let relative = format!("{OBJECTS_DIR}/{source_hash}-{params_hash}.{extension}");
        let path = cache_dir.join(&relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        self.insert(relative, source_hash.to_string(), params_hash.to_string());
        Ok(())
    }

    /// Record a cache entry for a stored object.
    ///
    /// An older entry for the same content under a different path is
    /// dropped so the manifest does not accumulate dead keys.
    pub fn insert(&mut self, stored_path: String, source_hash: String, params_hash: String) {
        let key = content_key(&source_hash, &params_hash);
        if let Some(old_path) = self.content_index.get(&key)
            && *old_path != stored_path
        {
            self.entries.remove(old_path.as_str());
        }
        self.content_index.insert(key, stored_path.clone());
        self.entries.insert(
            stored_path,
            CacheEntry {
                source_hash,
                params_hash,
            },
        );
    }
}

fn content_key(source_hash: &str, params_hash: &str) -> String {
    format!("{}:{}", source_hash, params_hash)
}

/// SHA-256 hash of a byte buffer, returned as a hex string.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// SHA-256 hash of the raster encoder settings for one format.
pub fn hash_raster_params(format: &str, jpeg_quality: u8) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"raster\0");
    hasher.update(format.as_bytes());
    hasher.update(b"\0");
    hasher.update([jpeg_quality]);
    format!("{:x}", hasher.finalize())
}

/// Resolve the cache manifest path for a cache directory.
pub fn manifest_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(MANIFEST_FILENAME)
}

/// Summary of cache performance for one optimization stage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u32,
    pub misses: u32,
}

impl CacheStats {
    pub fn hit(&mut self) {
        self.hits += 1;
    }

    pub fn miss(&mut self) {
        self.misses += 1;
    }

    pub fn total(&self) -> u32 {
        self.hits + self.misses
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hits > 0 {
            write!(
                f,
                "{} cached, {} optimized ({} total)",
                self.hits,
                self.misses,
                self.total()
            )
        } else {
            write!(f, "{} optimized", self.misses)
        }
    }
}
