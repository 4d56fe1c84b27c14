//! Project and site configuration.
//!
//! Two kinds of config file feed a run:
//!
//! - **Project config** (`sitepipe.toml`, next to the source tree): where the
//!   directories live, how the dev server binds, and the options each
//!   transform receives. Optional; every key has a stock default.
//! - **Site settings** (`<source>/_config.toml`, plus `_config.build.toml`
//!   layered on top for production builds): title, description, base URL.
//!   Consumed by the markup compiler only.
//!
//! ## Layering
//!
//! Both kinds are loaded the same way: the stock defaults are serialized to a
//! TOML table, each user file is merged on top key-by-key, and the result is
//! deserialized and validated once.
//!
//! ```text
//! stock defaults  ←  _config.toml  ←  _config.build.toml (dist only)
//! ```
//!
//! Config files are sparse. Set only the values that differ from the defaults:
//!
//! ```toml
//! [server]
//! port = 4000
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::flow::dirs_overlap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Default project config filename, looked up in the working directory.
pub const PROJECT_CONFIG_FILE: &str = "sitepipe.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Project configuration loaded from `sitepipe.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Directory layout shared by both modes.
    pub paths: PathsConfig,
    /// Dev / preview HTTP server.
    pub server: ServerConfig,
    /// File watching and rebuild coalescing.
    pub watch: WatchConfig,
    /// Markup compilation (site config layering per mode).
    pub markup: MarkupConfig,
    /// Stylesheet concatenation.
    pub styles: StylesConfig,
    /// Script bundling.
    pub scripts: ScriptsConfig,
    /// Raster image optimization.
    pub images: ImagesConfig,
    /// Critical CSS extraction.
    pub critical: CriticalConfig,
    /// HTML minification.
    pub html: HtmlConfig,
}

impl PipelineConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let paths = [
            ("paths.source", &self.paths.source),
            ("paths.intermediate", &self.paths.intermediate),
            ("paths.distribution", &self.paths.distribution),
        ];
        for (key, value) in paths {
            if value.trim().is_empty() {
                return Err(ConfigError::Validation(format!("{key} must not be empty")));
            }
        }
        let source = Path::new(&self.paths.source);
        for (key, value) in &paths[1..] {
            if dirs_overlap(source, Path::new(value.as_str())) {
                return Err(ConfigError::Validation(format!(
                    "{key} '{value}' overlaps paths.source '{}'; it would be reset on every run",
                    self.paths.source
                )));
            }
        }
        if self.styles.fragments.is_empty() {
            return Err(ConfigError::Validation(
                "styles.fragments must not be empty".into(),
            ));
        }
        if self.images.jpeg_quality == 0 || self.images.jpeg_quality > 100 {
            return Err(ConfigError::Validation(
                "images.jpeg_quality must be 1-100".into(),
            ));
        }
        if self.critical.fold_elements == 0 {
            return Err(ConfigError::Validation(
                "critical.fold_elements must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Directory layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Author-owned source tree. Never written to.
    pub source: String,
    /// Assets directory inside the source tree (`css/`, `js/`, `img/`).
    pub assets: String,
    /// Scratch output for the dev pipeline.
    pub intermediate: String,
    /// Final artifact root for builds.
    pub distribution: String,
    /// Processing cache for optimized images. Survives `build` resets.
    pub cache: String,
    /// Top-level distribution entries kept across resets (glob patterns).
    pub preserve: Vec<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            source: "blog".to_string(),
            assets: "_assets".to_string(),
            intermediate: ".tmp".to_string(),
            distribution: "_site".to_string(),
            cache: ".sitepipe-cache".to_string(),
            preserve: vec![".git*".to_string()],
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
        }
    }
}

/// Watch loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// Coalescing window in milliseconds. Events for the same rule inside
    /// the window push the rebuild back instead of queueing another one.
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 200 }
    }
}

/// Site settings files per mode, relative to the source root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarkupConfig {
    pub dev_config: Vec<String>,
    pub dist_config: Vec<String>,
}

impl Default for MarkupConfig {
    fn default() -> Self {
        Self {
            dev_config: vec!["_config.toml".to_string()],
            dist_config: vec![
                "_config.toml".to_string(),
                "_config.build.toml".to_string(),
            ],
        }
    }
}

/// Stylesheet settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StylesConfig {
    /// Fragments under `<assets>/css`, concatenated in this order.
    pub fragments: Vec<String>,
    /// Name of the concatenated stylesheet under `css/`.
    pub output: String,
}

impl Default for StylesConfig {
    fn default() -> Self {
        Self {
            fragments: ["poole.css", "syntax.css", "hyde.css", "jamie.css"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            output: "blog.css".to_string(),
        }
    }
}

/// Script bundle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptsConfig {
    /// Name of the bundle under `js/`.
    pub output: String,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            output: "scripts.js".to_string(),
        }
    }
}

/// Raster image optimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImagesConfig {
    /// JPEG re-encoding quality (1-100). A re-encode is only kept when it
    /// is smaller than the original.
    pub jpeg_quality: u8,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self { jpeg_quality: 85 }
    }
}

/// Critical CSS extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CriticalConfig {
    /// How many elements from the top of `<body>` count as above the fold.
    pub fold_elements: usize,
    /// Minify the inlined `<style>` block.
    pub minify: bool,
}

impl Default for CriticalConfig {
    fn default() -> Self {
        Self {
            fold_elements: 30,
            minify: true,
        }
    }
}

/// HTML minifier switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HtmlConfig {
    pub remove_comments: bool,
    pub collapse_whitespace: bool,
    pub collapse_boolean_attributes: bool,
    pub remove_attribute_quotes: bool,
    pub remove_redundant_attributes: bool,
    pub remove_empty_attributes: bool,
    pub minify_js: bool,
    pub minify_css: bool,
}

impl Default for HtmlConfig {
    fn default() -> Self {
        Self {
            remove_comments: true,
            collapse_whitespace: true,
            collapse_boolean_attributes: true,
            remove_attribute_quotes: true,
            remove_redundant_attributes: true,
            remove_empty_attributes: true,
            minify_js: true,
            minify_css: true,
        }
    }
}

/// Site-wide settings handed to the markup compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteSettings {
    pub title: String,
    pub description: String,
    pub author: String,
    /// Path prefix for every asset link (`""` or e.g. `"/blog"`).
    pub baseurl: String,
    /// Absolute site URL, used for the canonical link when non-empty.
    pub url: String,
    pub lang: String,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            title: "Blog".to_string(),
            description: String::new(),
            author: String::new(),
            baseurl: String::new(),
            url: String::new(),
            lang: "en".to_string(),
        }
    }
}

// =============================================================================
// Loading and merging
// =============================================================================

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Read a TOML file as a raw value. `Ok(None)` when the file does not exist.
pub fn load_raw(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

fn defaults_value<T: Serialize>(defaults: &T) -> toml::Value {
    // Plain structs of strings, numbers and lists always serialize.
    toml::Value::try_from(defaults).unwrap_or_else(|_| toml::Value::Table(Default::default()))
}

/// Merge every existing file in `layers` over the stock defaults of `T`.
fn resolve_layers<T>(layers: &[&Path]) -> Result<T, ConfigError>
where
    T: Default + Serialize + for<'de> Deserialize<'de>,
{
    let mut merged = defaults_value(&T::default());
    for layer in layers {
        if let Some(overlay) = load_raw(layer)? {
            merged = merge_toml(merged, overlay);
        }
    }
    let resolved: T = merged.try_into()?;
    Ok(resolved)
}

/// Load the project config. A missing file yields the stock defaults.
pub fn load_pipeline_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let config: PipelineConfig = resolve_layers(&[path])?;
    config.validate()?;
    Ok(config)
}

/// Load layered site settings from `files` (relative to `source`), later
/// files overriding earlier ones. Missing files are skipped.
pub fn load_site_settings(source: &Path, files: &[String]) -> Result<SiteSettings, ConfigError> {
    let paths: Vec<_> = files.iter().map(|f| source.join(f)).collect();
    let refs: Vec<&Path> = paths.iter().map(|p| p.as_path()).collect();
    resolve_layers(&refs)
}

/// Returns a fully-commented stock `sitepipe.toml`.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# sitepipe configuration
# ======================
#
# Every key is optional; the values below are the defaults.
# Unknown keys are rejected.

[paths]
# Author-owned source tree (pages, _config.toml, _assets/). Never written.
source = "blog"
# Assets directory inside the source tree: css/, js/, img/.
assets = "_assets"
# Scratch output of `serve`. Wiped at the start of every dev run.
intermediate = ".tmp"
# Output of `build`. Wiped at the start of every build.
distribution = "_site"
# Optimized-image cache. Never wiped; pass --no-cache to bypass it.
cache = ".sitepipe-cache"
# Top-level distribution entries that survive a build reset.
preserve = [".git*"]

[server]
host = "0.0.0.0"
port = 9000

[watch]
# File changes for the same rule within this window trigger one rebuild.
debounce_ms = 200

[markup]
# Site settings files, relative to the source root. Later files win.
dev_config = ["_config.toml"]
dist_config = ["_config.toml", "_config.build.toml"]

[styles]
# Fragments under <assets>/css, concatenated in this order.
fragments = ["poole.css", "syntax.css", "hyde.css", "jamie.css"]
output = "blog.css"

[scripts]
output = "scripts.js"

[images]
# JPEG re-encoding quality. Re-encodes are kept only when smaller.
jpeg_quality = 85

[critical]
# Elements from the top of <body> treated as above the fold.
fold_elements = 30
minify = true

[html]
remove_comments = true
collapse_whitespace = true
collapse_boolean_attributes = true
remove_attribute_quotes = true
remove_redundant_attributes = true
remove_empty_attributes = true
minify_js = true
minify_css = true
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_blog_layout() {
        let config = PipelineConfig::default();
        assert_eq!(config.paths.source, "blog");
        assert_eq!(config.paths.distribution, "_site");
        assert_eq!(config.paths.intermediate, ".tmp");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.styles.output, "blog.css");
        assert_eq!(
            config.styles.fragments,
            vec!["poole.css", "syntax.css", "hyde.css", "jamie.css"]
        );
    }

    #[test]
    fn stock_config_parses_to_defaults() {
        let config: PipelineConfig = toml::from_str(stock_config_toml()).unwrap();
        let defaults = PipelineConfig::default();
        assert_eq!(config.paths.cache, defaults.paths.cache);
        assert_eq!(config.watch.debounce_ms, defaults.watch.debounce_ms);
        assert_eq!(config.markup.dist_config, defaults.markup.dist_config);
        assert_eq!(config.critical.fold_elements, defaults.critical.fold_elements);
        config.validate().unwrap();
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(PROJECT_CONFIG_FILE);
        fs::write(&path, "[server]\nport = 4000\n").unwrap();
        let config = load_pipeline_config(&path).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.paths.source, "blog");
    }

    #[test]
    fn missing_config_file_is_stock_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_pipeline_config(&tmp.path().join("nope.toml")).unwrap();
        assert_eq!(config.paths.distribution, "_site");
    }

    #[test]
    fn unknown_key_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(PROJECT_CONFIG_FILE);
        fs::write(&path, "[server]\nprot = 4000\n").unwrap();
        assert!(matches!(
            load_pipeline_config(&path),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn source_equal_to_distribution_rejected() {
        let mut config = PipelineConfig::default();
        config.paths.distribution = config.paths.source.clone();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn output_dirs_aliasing_the_source_rejected() {
        for alias in ["blog/", "./blog", "blog/../blog", "blog/_site", "."] {
            let mut config = PipelineConfig::default();
            config.paths.distribution = alias.to_string();
            assert!(
                matches!(config.validate(), Err(ConfigError::Validation(m)) if m.starts_with("paths.distribution")),
                "{alias}"
            );

            let mut config = PipelineConfig::default();
            config.paths.intermediate = alias.to_string();
            assert!(
                matches!(config.validate(), Err(ConfigError::Validation(m)) if m.starts_with("paths.intermediate")),
                "{alias}"
            );
        }

        let mut config = PipelineConfig::default();
        config.paths.distribution = "./blog-site".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn jpeg_quality_out_of_range_rejected() {
        let mut config = PipelineConfig::default();
        config.images.jpeg_quality = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn site_settings_layer_in_order() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("_config.toml"),
            "title = \"Jamie\"\nbaseurl = \"/dev\"\n",
        )
        .unwrap();
        fs::write(tmp.path().join("_config.build.toml"), "baseurl = \"\"\n").unwrap();

        let dev = load_site_settings(tmp.path(), &["_config.toml".to_string()]).unwrap();
        assert_eq!(dev.title, "Jamie");
        assert_eq!(dev.baseurl, "/dev");

        let dist = load_site_settings(
            tmp.path(),
            &["_config.toml".to_string(), "_config.build.toml".to_string()],
        )
        .unwrap();
        assert_eq!(dist.title, "Jamie");
        assert_eq!(dist.baseurl, "");
        assert_eq!(dist.lang, "en");
    }

    #[test]
    fn site_settings_missing_files_are_defaults() {
        let tmp = TempDir::new().unwrap();
        let settings = load_site_settings(tmp.path(), &["_config.toml".to_string()]).unwrap();
        assert_eq!(settings, SiteSettings::default());
    }

    #[test]
    fn merge_toml_overlays_nested_tables() {
        let base: toml::Value = toml::from_str("[a]\nx = 1\ny = 2\n").unwrap();
        let overlay: toml::Value = toml::from_str("[a]\ny = 3\n[b]\nz = 4\n").unwrap();
        let merged = merge_toml(base, overlay);
        assert_eq!(merged["a"]["x"].as_integer(), Some(1));
        assert_eq!(merged["a"]["y"].as_integer(), Some(3));
        assert_eq!(merged["b"]["z"].as_integer(), Some(4));
    }
}
