//! Document parsing: uploaded bytes → ordered, addressable spans.
//!
//! Format-specific work is delegated to existing crates (`zip` +
//! `quick-xml` for DOCX, `pdf-extract` for PDF, `calamine` for XLSX); this
//! module only decides which one to run and turns their output into
//! [`Span`]s with dense ids.
//!
//! Parsing is CPU-bound and some of the underlying libraries panic on
//! malformed input, so [`parse_document`] runs inside
//! [`tokio::task::spawn_blocking`] and reports a panic as
//! [`ReviewError::Parse`] instead of tearing down the caller.

pub mod docx;
pub mod pdf;
pub mod xlsx;

use crate::error::ReviewError;
use crate::model::{DocumentFormat, ImageAsset, Span, SpanKind, SpanPosition};
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, info};

/// Raw bytes of one extracted image, destined for the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedImage {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Parser output before it becomes a [`crate::model::Document`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedDocument {
    pub spans: Vec<Span>,
    pub images: Vec<ExtractedImage>,
}

impl ParsedDocument {
    pub fn image_bytes(&self, file_name: &str) -> Option<&[u8]> {
        self.images
            .iter()
            .find(|i| i.file_name == file_name)
            .map(|i| i.bytes.as_slice())
    }
}

/// Assigns dense span ids in push order.
#[derive(Debug, Default)]
pub(crate) struct SpanSink {
    out: ParsedDocument,
}

impl SpanSink {
    fn next_id(&self) -> u32 {
        self.out.spans.len() as u32
    }

    /// Push a text or table-cell span; blank content is dropped.
    pub fn push_text(&mut self, kind: SpanKind, raw: &str, mut position: SpanPosition) -> Option<u32> {
        let trimmed_start = raw.trim_start();
        let content = trimmed_start.trim_end();
        if content.is_empty() {
            return None;
        }
        position.leading_ws = raw.len() - trimmed_start.len();
        let id = self.next_id();
        self.out.spans.push(Span {
            id,
            kind,
            content: content.to_string(),
            position,
            image: None,
        });
        Some(id)
    }

    /// Push an image span and keep its bytes.
    pub fn push_image(&mut self, bytes: Vec<u8>, extension: &str, position: SpanPosition) -> u32 {
        let id = self.next_id();
        let (width, height) = image_dimensions(&bytes).unzip();
        let file_name = format!("span-{id}.{extension}");
        self.out.spans.push(Span {
            id,
            kind: SpanKind::Image,
            content: String::new(),
            position,
            image: Some(ImageAsset {
                file_name: file_name.clone(),
                mime: mime_for_extension(extension).to_string(),
                width,
                height,
            }),
        });
        self.out.images.push(ExtractedImage { file_name, bytes });
        id
    }

    pub fn finish(self) -> ParsedDocument {
        self.out
    }
}

/// Identify the upload format from its name, confirmed by its content.
pub fn detect_format(filename: &str, bytes: &[u8]) -> Result<DocumentFormat, ReviewError> {
    let unsupported = |reason: &str| ReviewError::UnsupportedFormat {
        filename: filename.to_string(),
        reason: reason.to_string(),
    };

    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| unsupported("file has no extension"))?;
    let format = DocumentFormat::from_extension(ext)
        .ok_or_else(|| unsupported(&format!("'.{ext}' files are not supported")))?;

    match format {
        DocumentFormat::Pdf => {
            if !bytes.starts_with(b"%PDF") {
                return Err(unsupported("content is not a PDF (missing %PDF header)"));
            }
        }
        DocumentFormat::Docx | DocumentFormat::Xlsx => {
            if !bytes.starts_with(b"PK") {
                return Err(unsupported("content is not an Office Open XML package"));
            }
            let archive = zip::ZipArchive::new(Cursor::new(bytes))
                .map_err(|e| ReviewError::parse(filename, format!("corrupt ZIP container: {e}")))?;
            let main_part = match format {
                DocumentFormat::Docx => "word/document.xml",
                _ => "xl/workbook.xml",
            };
            if archive.index_for_name(main_part).is_none() {
                return Err(unsupported(&format!("package has no {main_part}")));
            }
        }
    }
    Ok(format)
}

/// Parse synchronously. Prefer [`parse_document`] from async code.
pub fn parse_bytes(
    filename: &str,
    bytes: &[u8],
) -> Result<(DocumentFormat, ParsedDocument), ReviewError> {
    let format = detect_format(filename, bytes)?;
    let parsed = match format {
        DocumentFormat::Docx => docx::parse(filename, bytes)?,
        DocumentFormat::Pdf => pdf::parse(filename, bytes)?,
        DocumentFormat::Xlsx => xlsx::parse(filename, bytes)?,
    };
    info!(
        "Parsed '{}' as {}: {} spans, {} images",
        filename,
        format,
        parsed.spans.len(),
        parsed.images.len()
    );
    Ok((format, parsed))
}

/// Parse on the blocking pool.
pub async fn parse_document(
    filename: &str,
    bytes: Vec<u8>,
) -> Result<(DocumentFormat, ParsedDocument), ReviewError> {
    let name = filename.to_string();
    debug!("Parsing '{}' ({} bytes)", name, bytes.len());
    tokio::task::spawn_blocking(move || parse_bytes(&name, &bytes))
        .await
        .map_err(|e| {
            if e.is_panic() {
                ReviewError::parse(filename, "document parser panicked on this input")
            } else {
                ReviewError::Internal(format!("parse task failed: {e}"))
            }
        })?
}

pub(crate) fn mime_for_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "emf" => "image/x-emf",
        "wmf" => "image/x-wmf",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_extension_is_unsupported() {
        let err = detect_format("report.txt", b"hello").unwrap_err();
        assert!(matches!(err, ReviewError::UnsupportedFormat { .. }));
    }

    #[test]
    fn missing_extension_is_unsupported() {
        let err = detect_format("report", b"%PDF-1.4").unwrap_err();
        assert!(matches!(err, ReviewError::UnsupportedFormat { .. }));
    }

    #[test]
    fn pdf_extension_with_wrong_magic_is_unsupported() {
        let err = detect_format("report.pdf", b"PK\x03\x04").unwrap_err();
        assert!(matches!(err, ReviewError::UnsupportedFormat { .. }));
    }

    #[test]
    fn truncated_zip_is_parse_error() {
        let err = detect_format("report.docx", b"PK\x03\x04garbage").unwrap_err();
        assert!(matches!(err, ReviewError::Parse { .. }), "got {err:?}");
    }

    #[test]
    fn sink_trims_and_records_leading_whitespace() {
        let mut sink = SpanSink::default();
        assert_eq!(sink.push_text(SpanKind::Text, "   ", SpanPosition::default()), None);
        let id = sink.push_text(SpanKind::Text, "  RSD = 2.3% \n", SpanPosition::default());
        assert_eq!(id, Some(0));
        let doc = sink.finish();
        assert_eq!(doc.spans[0].content, "RSD = 2.3%");
        assert_eq!(doc.spans[0].position.leading_ws, 2);
    }

    #[test]
    fn mime_lookup() {
        assert_eq!(mime_for_extension("JPG"), "image/jpeg");
        assert_eq!(mime_for_extension("emf"), "image/x-emf");
    }
}
