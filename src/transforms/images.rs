//! Image transforms: copy, raster optimization, SVG optimization.
//!
//! Raster optimization re-encodes PNG at maximum compression and JPEG at
//! the configured quality, and keeps the re-encode only when it is smaller
//! than the original. Files are processed in parallel with rayon; results
//! go through the content-addressed [`cache`](crate::cache) so an unchanged
//! image is only encoded once across builds. GIFs pass through untouched.

use super::html::{Token, render, tokenize};
use super::{expect_options, read_bytes, read_text, write_output};
use crate::cache::{CacheManifest, CacheStats, hash_bytes, hash_raster_params};
use crate::registry::{Invocation, Outcome, RasterOptions, TransformError, TransformOptions};
use image::ImageEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// `copy`: copy the selected files, optionally dropping their directories.
///
/// When flattening maps two files to the same name, the later one (in
/// sorted order) wins.
pub fn copy(invocation: &Invocation) -> Result<Outcome, TransformError> {
    let TransformOptions::Copy { flatten } = &invocation.options else {
        return Err(expect_options("copy", &invocation.options));
    };
    let mut outcome = Outcome::default();
    for file in invocation.files(0)? {
        let relative = match (flatten, file.file_name()) {
            (true, Some(name)) => PathBuf::from(name),
            _ => invocation.relative(0, &file).to_path_buf(),
        };
        let bytes = read_bytes(&file)?;
        outcome.bytes_in += bytes.len() as u64;
        outcome.bytes_out += bytes.len() as u64;
        let written = write_output(&invocation.output, &relative, &bytes)?;
        if !outcome.written.contains(&written) {
            outcome.written.push(written);
        }
    }
    Ok(outcome)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RasterFormat {
    Png,
    Jpeg,
}

impl RasterFormat {
    fn of(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "png" => Some(RasterFormat::Png),
            "jpg" | "jpeg" => Some(RasterFormat::Jpeg),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            RasterFormat::Png => "png",
            RasterFormat::Jpeg => "jpeg",
        }
    }
}

struct Optimized {
    relative: PathBuf,
    bytes_in: u64,
    bytes_out: u64,
    cached: bool,
}

fn lock(manifest: &Mutex<CacheManifest>) -> MutexGuard<'_, CacheManifest> {
    manifest.lock().unwrap_or_else(PoisonError::into_inner)
}

fn encode(
    path: &Path,
    original: &[u8],
    format: RasterFormat,
    jpeg_quality: u8,
) -> Result<Vec<u8>, TransformError> {
    let image_error = |source| TransformError::Image {
        path: path.to_path_buf(),
        source,
    };
    let img = image::load_from_memory(original).map_err(image_error)?;
    let mut out = Vec::new();
    match format {
        RasterFormat::Png => {
            let encoder =
                PngEncoder::new_with_quality(&mut out, CompressionType::Best, FilterType::Adaptive);
            img.write_with_encoder(encoder).map_err(image_error)?;
        }
        RasterFormat::Jpeg => {
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut out, jpeg_quality)
                .write_image(
                    rgb.as_raw(),
                    rgb.width(),
                    rgb.height(),
                    image::ExtendedColorType::Rgb8,
                )
                .map_err(image_error)?;
        }
    }
    Ok(out)
}

fn optimize_one(
    invocation: &Invocation,
    options: &RasterOptions,
    manifest: &Mutex<CacheManifest>,
    file: &Path,
    format: RasterFormat,
) -> Result<Optimized, TransformError> {
    let original = read_bytes(file)?;
    let relative = invocation.relative(0, file).to_path_buf();
    let source_hash = hash_bytes(&original);
    let params_hash = hash_raster_params(format.name(), options.jpeg_quality);

    let cached = match &options.cache_dir {
        Some(dir) if options.read_cache => lock(manifest).find_cached(&source_hash, &params_hash, dir),
        _ => None,
    };
    if let Some(hit) = cached {
        let bytes = read_bytes(&hit)?;
        write_output(&invocation.output, &relative, &bytes)?;
        return Ok(Optimized {
            relative,
            bytes_in: original.len() as u64,
            bytes_out: bytes.len() as u64,
            cached: true,
        });
    }

    let encoded = encode(file, &original, format, options.jpeg_quality)?;
    let best = if encoded.len() < original.len() {
        &encoded
    } else {
        &original
    };
    write_output(&invocation.output, &relative, best)?;
    if let Some(dir) = &options.cache_dir {
        lock(manifest)
            .store(dir, &source_hash, &params_hash, format.name(), best)
            .map_err(|e| TransformError::io(dir, e))?;
    }
    Ok(Optimized {
        relative,
        bytes_in: original.len() as u64,
        bytes_out: best.len() as u64,
        cached: false,
    })
}

/// `optimize-raster`: losslessly recompress PNGs and re-encode JPEGs in
/// place, consulting and updating the processing cache.
pub fn optimize_raster(invocation: &Invocation) -> Result<Outcome, TransformError> {
    let TransformOptions::Raster(options) = &invocation.options else {
        return Err(expect_options("optimize-raster", &invocation.options));
    };
    let files: Vec<(PathBuf, RasterFormat)> = invocation
        .files(0)?
        .into_iter()
        .filter_map(|file| RasterFormat::of(&file).map(|format| (file, format)))
        .collect();

    let manifest = Mutex::new(match &options.cache_dir {
        Some(dir) => CacheManifest::load(dir),
        None => CacheManifest::empty(),
    });
    let results: Vec<Result<Optimized, TransformError>> = files
        .par_iter()
        .map(|(file, format)| optimize_one(invocation, options, &manifest, file, *format))
        .collect();

    let mut outcome = Outcome::default();
    let mut stats = CacheStats::default();
    for result in results {
        let optimized = result?;
        if optimized.cached {
            stats.hit();
        } else {
            stats.miss();
        }
        outcome.bytes_in += optimized.bytes_in;
        outcome.bytes_out += optimized.bytes_out;
        outcome.written.push(optimized.relative);
    }

    if let Some(dir) = &options.cache_dir {
        let manifest = manifest.into_inner().unwrap_or_else(PoisonError::into_inner);
        manifest.save(dir).map_err(|e| TransformError::io(dir, e))?;
    }
    outcome.note = Some(stats.to_string());
    Ok(outcome)
}

/// Elements whose whitespace-only text is content.
const SVG_TEXT_ELEMENTS: &[&str] = &["text", "tspan", "textPath", "style"];

/// Drop the XML prolog, doctype, comments, `<metadata>` and whitespace
/// between tags.
fn strip_svg(tokens: Vec<Token>) -> Vec<Token> {
    let mut kept = Vec::with_capacity(tokens.len());
    let mut metadata = 0usize;
    let mut text = 0usize;
    for token in tokens {
        match &token {
            Token::StartTag {
                name, self_closing, ..
            } if name == "metadata" => {
                if !self_closing {
                    metadata += 1;
                }
                continue;
            }
            Token::EndTag(name) if name == "metadata" => {
                metadata = metadata.saturating_sub(1);
                continue;
            }
            _ if metadata > 0 => continue,
            Token::Declaration(decl) => {
                let lower = decl.to_ascii_lowercase();
                if lower.starts_with("<?xml") || lower.starts_with("<!doctype") {
                    continue;
                }
            }
            Token::Comment(_) => continue,
            Token::Text(body) if text == 0 && body.trim().is_empty() => continue,
            Token::StartTag {
                name,
                self_closing: false,
                ..
            } if SVG_TEXT_ELEMENTS.contains(&name.as_str()) => text += 1,
            Token::EndTag(name) if SVG_TEXT_ELEMENTS.contains(&name.as_str()) => {
                text = text.saturating_sub(1);
            }
            _ => {}
        }
        kept.push(token);
    }
    kept
}

/// Optimize one SVG document.
pub fn minify_svg(svg: &str) -> Result<String, super::SyntaxError> {
    Ok(render(&strip_svg(tokenize(svg)?)).trim().to_string())
}

/// `optimize-vector`: strip SVGs of editor cruft, in place.
pub fn optimize_vector(invocation: &Invocation) -> Result<Outcome, TransformError> {
    if invocation.options != TransformOptions::Vector {
        return Err(expect_options("optimize-vector", &invocation.options));
    }
    let mut outcome = Outcome::default();
    for file in invocation.files(0)? {
        let text = read_text(&file)?;
        let minified = minify_svg(&text).map_err(|e| e.in_file(&file))?;
        let relative = invocation.relative(0, &file).to_path_buf();
        outcome.bytes_in += text.len() as u64;
        outcome.bytes_out += minified.len() as u64;
        outcome
            .written
            .push(write_output(&invocation.output, &relative, minified.as_bytes())?);
    }
    Ok(outcome)
}
