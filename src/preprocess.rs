//! Payload preprocessing: bring a document under the service size ceiling.
//!
//! [`Preprocessor::prepare`] applies, in order: a size check, page
//! truncation for paginated formats over the page ceiling, a second size
//! check, lossy compression, and a final size check. Truncation always
//! runs before compression. A document already within the limit is
//! returned untouched, which makes `prepare` idempotent on its own output.
//!
//! Codecs sit behind [`PageCodec`] and [`RasterCodec`] so the ordering can
//! be tested without external tools. The stock implementations are
//! [`GhostscriptCodec`] (shells out to `gs`) and [`ImageCodec`].
//!
//! All operations are blocking; async callers should run `prepare` on the
//! blocking pool.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, ImageOutputFormat};
use tracing::{debug, info, warn};

use crate::document::{Document, DocumentKind};
use crate::error::{PipelineError, Result};

/// Ceilings applied by [`Preprocessor::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreprocessLimits {
    /// Maximum payload size in bytes.
    pub max_bytes: usize,
    /// Maximum page count for paginated formats.
    pub max_pages: u32,
}

impl Default for PreprocessLimits {
    fn default() -> Self {
        Self {
            max_bytes: 4_718_592,
            max_pages: 50,
        }
    }
}

/// Operations on paginated documents.
pub trait PageCodec: Send + Sync {
    /// Number of pages.
    fn page_count(&self, bytes: &[u8]) -> Result<u32>;

    /// Keep the first `max_pages` pages.
    fn truncate(&self, bytes: &[u8], max_pages: u32) -> Result<Vec<u8>>;

    /// Lossy downsampling at a fixed quality preset.
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>>;
}

/// Lossy re-encoding for raster images. Output is always JPEG.
pub trait RasterCodec: Send + Sync {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>>;
}

/// Shrinks documents to fit [`PreprocessLimits`].
#[derive(Clone)]
pub struct Preprocessor {
    limits: PreprocessLimits,
    pages: Arc<dyn PageCodec>,
    raster: Arc<dyn RasterCodec>,
}

impl std::fmt::Debug for Preprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preprocessor")
            .field("limits", &self.limits)
            .finish()
    }
}

impl Preprocessor {
    /// Preprocessor using Ghostscript for PDFs and the `image` crate for rasters.
    pub fn new(limits: PreprocessLimits) -> Self {
        Self::with_codecs(limits, Arc::new(GhostscriptCodec::default()), Arc::new(ImageCodec::default()))
    }

    pub fn with_codecs(
        limits: PreprocessLimits,
        pages: Arc<dyn PageCodec>,
        raster: Arc<dyn RasterCodec>,
    ) -> Self {
        Self {
            limits,
            pages,
            raster,
        }
    }

    pub fn limits(&self) -> PreprocessLimits {
        self.limits
    }

    /// Return a document within the size limit, or [`PipelineError::Oversize`].
    ///
    /// Codec failures are logged and treated as "no reduction", so a broken
    /// tool ends in `Oversize` for that document only.
    pub fn prepare(&self, doc: &Document) -> Result<Document> {
        let limit = self.limits.max_bytes;
        if doc.size() <= limit {
            return Ok(doc.clone());
        }
        info!(document = doc.name(), size = doc.size(), limit, "document over size limit");

        let mut current = doc.clone();

        if doc.kind().is_paginated() {
            match self.pages.page_count(current.bytes()) {
                Ok(count) if count > self.limits.max_pages => {
                    match self.pages.truncate(current.bytes(), self.limits.max_pages) {
                        Ok(trimmed) => {
                            debug!(document = doc.name(), from = count, to = self.limits.max_pages, "truncated pages");
                            current = current.with_bytes(trimmed, current.kind());
                        }
                        Err(e) => warn!(document = doc.name(), error = %e, "page truncation failed"),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(document = doc.name(), error = %e, "page count failed"),
            }
            if current.size() <= limit {
                return Ok(current);
            }
        }

        let compressed = if current.kind().is_image() {
            self.raster
                .compress(current.bytes())
                .map(|bytes| current.with_bytes(bytes, DocumentKind::Jpeg))
        } else if current.kind().is_paginated() {
            self.pages
                .compress(current.bytes())
                .map(|bytes| current.with_bytes(bytes, current.kind()))
        } else {
            Err(PipelineError::Codec(format!(
                "no compressor for format '{}'",
                current.kind().format_tag()
            )))
        };

        match compressed {
            Ok(smaller) if smaller.size() < current.size() => {
                debug!(document = doc.name(), before = current.size(), after = smaller.size(), "compressed");
                current = smaller;
            }
            Ok(_) => debug!(document = doc.name(), "compression did not reduce size"),
            Err(e) => warn!(document = doc.name(), error = %e, "compression failed, keeping payload"),
        }

        if current.size() <= limit {
            Ok(current)
        } else {
            Err(PipelineError::Oversize {
                name: doc.name().to_string(),
                size: current.size(),
                limit,
            })
        }
    }
}

/// PDF operations via the Ghostscript command-line tool.
#[derive(Debug, Clone)]
pub struct GhostscriptCodec {
    /// Binary name or path. Default: `gs`.
    pub binary: PathBuf,
    /// `-dPDFSETTINGS` preset used for compression. Default: `/screen`.
    pub preset: String,
}

impl Default for GhostscriptCodec {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("gs"),
            preset: "/screen".into(),
        }
    }
}

impl GhostscriptCodec {
    fn run(&self, args: &[String]) -> Result<Vec<u8>> {
        let output = Command::new(&self.binary).args(args).output()?;
        if !output.status.success() {
            return Err(PipelineError::Codec(format!(
                "ghostscript exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Write `bytes` to a temp dir, run `gs` producing `out.pdf`, read it back.
    fn rewrite(&self, bytes: &[u8], extra: &[String]) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let input = write_input(dir.path(), bytes)?;
        let output = dir.path().join("out.pdf");

        let mut args = vec![
            "-sDEVICE=pdfwrite".to_string(),
            "-dCompatibilityLevel=1.4".to_string(),
            "-dNOPAUSE".to_string(),
            "-dQUIET".to_string(),
            "-dBATCH".to_string(),
        ];
        args.extend_from_slice(extra);
        args.push(format!("-sOutputFile={}", output.display()));
        args.push(input.display().to_string());

        self.run(&args)?;
        Ok(std::fs::read(output)?)
    }
}

fn write_input(dir: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let path = dir.join("in.pdf");
    std::fs::write(&path, bytes)?;
    Ok(path)
}

impl PageCodec for GhostscriptCodec {
    fn page_count(&self, bytes: &[u8]) -> Result<u32> {
        let dir = tempfile::tempdir()?;
        let input = write_input(dir.path(), bytes)?;
        let script = format!(
            "({}) (r) file runpdfbegin pdfpagecount = quit",
            input.display()
        );
        let stdout = self.run(&[
            "-q".into(),
            "-dNODISPLAY".into(),
            "-dNOSAFER".into(),
            "-c".into(),
            script,
        ])?;
        let text = String::from_utf8_lossy(&stdout);
        text.trim()
            .parse()
            .map_err(|_| PipelineError::Codec(format!("unexpected page count output: {:?}", text.trim())))
    }

    fn truncate(&self, bytes: &[u8], max_pages: u32) -> Result<Vec<u8>> {
        self.rewrite(
            bytes,
            &["-dFirstPage=1".into(), format!("-dLastPage={max_pages}")],
        )
    }

    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.rewrite(bytes, &[format!("-dPDFSETTINGS={}", self.preset)])
    }
}

/// Raster re-encoding via the `image` crate: RGB, scaled, JPEG.
#[derive(Debug, Clone, Copy)]
pub struct ImageCodec {
    /// JPEG quality (1-100). Default: 85.
    pub quality: u8,
    /// Scale applied to both dimensions. Default: 0.5.
    pub resize_factor: f32,
}

impl Default for ImageCodec {
    fn default() -> Self {
        Self {
            quality: 85,
            resize_factor: 0.5,
        }
    }
}

impl RasterCodec for ImageCodec {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| PipelineError::Codec(format!("image decode failed: {e}")))?;
        let rgb = img.to_rgb8();
        let width = ((rgb.width() as f32 * self.resize_factor) as u32).max(1);
        let height = ((rgb.height() as f32 * self.resize_factor) as u32).max(1);
        let resized = image::imageops::resize(&rgb, width, height, FilterType::Lanczos3);

        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(resized)
            .write_to(&mut out, ImageOutputFormat::Jpeg(self.quality))
            .map_err(|e| PipelineError::Codec(format!("jpeg encode failed: {e}")))?;
        Ok(out.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const PAGE: usize = 1000;

    /// Treats every 1000 bytes as a page; compression halves the payload.
    #[derive(Default)]
    struct FakePages {
        calls: Mutex<Vec<&'static str>>,
        shrink: bool,
        fail_compress: bool,
    }

    impl FakePages {
        fn shrinking() -> Self {
            Self {
                shrink: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PageCodec for FakePages {
        fn page_count(&self, bytes: &[u8]) -> Result<u32> {
            self.calls.lock().unwrap().push("page_count");
            Ok((bytes.len() / PAGE) as u32)
        }

        fn truncate(&self, bytes: &[u8], max_pages: u32) -> Result<Vec<u8>> {
            self.calls.lock().unwrap().push("truncate");
            Ok(bytes[..(max_pages as usize * PAGE).min(bytes.len())].to_vec())
        }

        fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
            self.calls.lock().unwrap().push("compress");
            if self.fail_compress {
                return Err(PipelineError::Codec("gs not installed".into()));
            }
            if self.shrink {
                Ok(bytes[..bytes.len() / 2].to_vec())
            } else {
                Ok(bytes.to_vec())
            }
        }
    }

    fn pdf(pages: usize) -> Document {
        Document::new("contract.pdf", vec![7u8; pages * PAGE])
    }

    fn preprocessor(codec: Arc<FakePages>, max_bytes: usize) -> Preprocessor {
        Preprocessor::with_codecs(
            PreprocessLimits {
                max_bytes,
                max_pages: 50,
            },
            codec,
            Arc::new(ImageCodec::default()),
        )
    }

    #[test]
    fn test_within_limit_is_byte_identical() {
        let codec = Arc::new(FakePages::shrinking());
        let doc = pdf(80);
        let out = preprocessor(codec.clone(), 100_000).prepare(&doc).unwrap();
        assert_eq!(out, doc);
        assert!(codec.calls().is_empty());
    }

    #[test]
    fn test_truncate_before_compress() {
        let codec = Arc::new(FakePages::shrinking());
        let out = preprocessor(codec.clone(), 30_000).prepare(&pdf(80)).unwrap();
        assert_eq!(codec.calls(), vec!["page_count", "truncate", "compress"]);
        assert_eq!(out.size(), 25_000);
        assert!(out.size() / PAGE <= 50);
        assert_eq!(out.name(), "contract.pdf");
    }

    #[test]
    fn test_truncation_alone_can_suffice() {
        let codec = Arc::new(FakePages::shrinking());
        let out = preprocessor(codec.clone(), 55_000).prepare(&pdf(60)).unwrap();
        assert_eq!(codec.calls(), vec!["page_count", "truncate"]);
        assert_eq!(out.size(), 50 * PAGE);
    }

    #[test]
    fn test_idempotent() {
        let pre = preprocessor(Arc::new(FakePages::shrinking()), 30_000);
        let once = pre.prepare(&pdf(80)).unwrap();
        let twice = pre.prepare(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_oversize_when_compression_does_not_help() {
        let codec = Arc::new(FakePages::default());
        let err = preprocessor(codec, 10_000).prepare(&pdf(40)).unwrap_err();
        match err {
            PipelineError::Oversize { name, size, limit } => {
                assert_eq!(name, "contract.pdf");
                assert_eq!(size, 40_000);
                assert_eq!(limit, 10_000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_codec_failure_becomes_oversize() {
        let codec = Arc::new(FakePages {
            fail_compress: true,
            ..FakePages::default()
        });
        let err = preprocessor(codec, 10_000).prepare(&pdf(20)).unwrap_err();
        assert_eq!(err.kind(), "oversize");
    }

    #[test]
    fn test_unsupported_format_oversize() {
        let doc = Document::new("notes.docx", vec![0u8; 5000]);
        let err = preprocessor(Arc::new(FakePages::shrinking()), 1000)
            .prepare(&doc)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Oversize { .. }));
    }

    #[test]
    fn test_image_is_downscaled_to_jpeg() {
        let mut rng = fastrand::Rng::with_seed(7);
        let noise = image::RgbImage::from_fn(256, 256, |_, _| {
            image::Rgb([rng.u8(..), rng.u8(..), rng.u8(..)])
        });
        let mut png = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(noise)
            .write_to(&mut png, ImageOutputFormat::Png)
            .unwrap();
        let png = png.into_inner();
        let doc = Document::new("scan.png", png.clone());

        let pre = Preprocessor::with_codecs(
            PreprocessLimits {
                max_bytes: png.len() / 2,
                max_pages: 50,
            },
            Arc::new(FakePages::shrinking()),
            Arc::new(ImageCodec::default()),
        );
        let out = pre.prepare(&doc).unwrap();

        assert_eq!(out.kind(), DocumentKind::Jpeg);
        assert_eq!(out.name(), "scan.png");
        let decoded = image::load_from_memory(out.bytes()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (128, 128));
    }
}
