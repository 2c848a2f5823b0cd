//! DOCX → spans.
//!
//! Walks `word/document.xml` with the shared [`BodyCursor`] so the exporter
//! later sees the same paragraphs with the same text. For each block-level
//! paragraph the embedded pictures become image spans first, then the text
//! (if any) becomes one text span. A block-level table becomes one
//! `table_cell` span per non-empty cell, its paragraphs joined with `\n`.

use super::{ParsedDocument, SpanSink};
use crate::error::ReviewError;
use crate::model::{SpanKind, SpanPosition};
use crate::ooxml::{parse_relationships, resolve_part, BodyCursor, CellLoc, ParaLoc, Relationship, Step};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek};
use tracing::{debug, warn};
use zip::ZipArchive;

pub(crate) fn read_part<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Option<Result<String, std::io::Error>> {
    let mut file = archive.by_name(name).ok()?;
    let mut content = String::new();
    Some(file.read_to_string(&mut content).map(|_| content))
}

/// Accumulates one paragraph or table cell.
#[derive(Debug, Default)]
struct Pending {
    text: String,
    images: Vec<String>,
    style: Option<String>,
}

struct DocxWalk<'a, R: Read + Seek> {
    filename: &'a str,
    archive: &'a mut ZipArchive<R>,
    rels: HashMap<String, Relationship>,
    sink: SpanSink,
    para: Pending,
    cell: Option<(CellLoc, Vec<String>, Vec<String>)>,
}

impl<R: Read + Seek> DocxWalk<'_, R> {
    fn on_paragraph_end(&mut self, loc: ParaLoc) {
        let para = std::mem::take(&mut self.para);
        if let Some((_, texts, images)) = self.cell.as_mut() {
            texts.push(para.text);
            images.extend(para.images);
            return;
        }
        let position = SpanPosition {
            block: loc.block,
            style: para.style,
            ..Default::default()
        };
        for rid in &para.images {
            self.push_image(rid, position.clone());
        }
        self.sink.push_text(SpanKind::Text, &para.text, position);
    }

    fn on_cell_end(&mut self, block: usize) {
        let Some((cell, texts, images)) = self.cell.take() else {
            return;
        };
        let position = SpanPosition {
            block,
            table: Some(cell.table),
            row: Some(cell.row),
            col: Some(cell.col),
            ..Default::default()
        };
        for rid in &images {
            self.push_image(rid, position.clone());
        }
        self.sink
            .push_text(SpanKind::TableCell, &texts.join("\n"), position);
    }

    fn push_image(&mut self, rid: &str, position: SpanPosition) {
        let Some(rel) = self.rels.get(rid) else {
            warn!("{}: image relationship {} not found", self.filename, rid);
            return;
        };
        if rel.external {
            debug!("{}: skipping linked image {}", self.filename, rel.target);
            return;
        }
        let part = resolve_part(&rel.target);
        let mut bytes = Vec::new();
        match self.archive.by_name(&part) {
            Ok(mut f) => {
                if let Err(e) = f.read_to_end(&mut bytes) {
                    warn!("{}: failed to read {}: {}", self.filename, part, e);
                    return;
                }
            }
            Err(_) => {
                warn!("{}: image part {} missing from package", self.filename, part);
                return;
            }
        }
        self.sink.push_image(bytes, &image_extension(&part), position);
    }
}

/// Lower-cased extension of the part's file name; `bin` when it has none
/// or it is not plain ASCII alphanumerics.
fn image_extension(part: &str) -> String {
    let name = part.rsplit('/').next().unwrap_or(part);
    match name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.bytes().all(|b| b.is_ascii_alphanumeric()) => {
            ext.to_ascii_lowercase()
        }
        _ => "bin".to_string(),
    }
}

/// Parse a DOCX package held in memory.
pub fn parse(filename: &str, bytes: &[u8]) -> Result<ParsedDocument, ReviewError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ReviewError::parse(filename, format!("corrupt ZIP container: {e}")))?;

    let xml = read_part(&mut archive, "word/document.xml")
        .ok_or_else(|| ReviewError::parse(filename, "missing word/document.xml"))?
        .map_err(|e| ReviewError::parse(filename, format!("unreadable word/document.xml: {e}")))?;

    let rels = match read_part(&mut archive, "word/_rels/document.xml.rels") {
        Some(Ok(rels_xml)) => parse_relationships(&rels_xml)
            .map_err(|e| ReviewError::parse(filename, format!("bad relationships part: {e}")))?,
        _ => HashMap::new(),
    };

    let mut walk = DocxWalk {
        filename,
        archive: &mut archive,
        rels,
        sink: SpanSink::default(),
        para: Pending::default(),
        cell: None,
    };
    let mut table_block = 0;

    let mut reader = Reader::from_str(&xml);
    let mut cursor = BodyCursor::new();
    loop {
        let event = reader.read_event().map_err(|e| {
            ReviewError::parse(
                filename,
                format!("XML error at byte {}: {e}", reader.buffer_position()),
            )
        })?;
        if matches!(event, Event::Eof) {
            break;
        }
        let step = cursor
            .advance(&event)
            .map_err(|e| ReviewError::parse(filename, format!("XML error: {e}")))?;
        match step {
            Step::ParagraphStart(_) => walk.para = Pending::default(),
            Step::Text(t) => walk.para.text.push_str(&t),
            Step::Symbol(c) => walk.para.text.push(c),
            Step::Image(rid) => walk.para.images.push(rid),
            Step::Style(s) => walk.para.style = Some(s),
            Step::ParagraphEnd(loc) => walk.on_paragraph_end(loc),
            Step::EmptyParagraph(loc) => {
                walk.para = Pending::default();
                walk.on_paragraph_end(loc);
            }
            Step::TableStart { block, .. } => table_block = block,
            Step::CellStart(cell) => walk.cell = Some((cell, Vec::new(), Vec::new())),
            Step::CellEnd(_) => walk.on_cell_end(table_block),
            Step::TableEnd | Step::None => {}
        }
    }

    Ok(walk.sink.finish())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    /// Build a minimal DOCX package around `body` and optional extra parts.
    pub(crate) fn docx_with(body: &str, extra: &[(&str, &[u8])], rels: &str) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let opts = SimpleFileOptions::default();
        zip.start_file("[Content_Types].xml", opts).unwrap();
        zip.write_all(br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/></Types>"#).unwrap();
        zip.start_file("word/document.xml", opts).unwrap();
        write!(
            zip,
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships" xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main"><w:body>{body}</w:body></w:document>"#
        )
        .unwrap();
        zip.start_file("word/_rels/document.xml.rels", opts).unwrap();
        write!(
            zip,
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{rels}</Relationships>"#
        )
        .unwrap();
        for (name, data) in extra {
            zip.start_file(*name, opts).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn para(text: &str) -> String {
        format!(r#"<w:p><w:r><w:t xml:space="preserve">{text}</w:t></w:r></w:p>"#)
    }

    fn tiny_png() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(3, 2, image::Rgba([0, 0, 0, 255]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn paragraphs_become_text_spans_with_dense_ids() {
        let body = format!("{}{}<w:p/>{}", para("  Title "), para("RSD = 2.3%"), para("Recovery = 98%"));
        let doc = parse("r.docx", &docx_with(&body, &[], "")).unwrap();
        let texts: Vec<_> = doc.spans.iter().map(|s| (s.id, s.content.as_str())).collect();
        assert_eq!(texts, vec![(0, "Title"), (1, "RSD = 2.3%"), (2, "Recovery = 98%")]);
        assert_eq!(doc.spans[0].position.leading_ws, 2);
        // The empty paragraph still consumed block 2.
        assert_eq!(doc.spans[2].position.block, 3);
    }

    #[test]
    fn tables_become_cell_spans() {
        let body = format!(
            "{}<w:tbl><w:tr><w:tc>{}</w:tc><w:tc>{}{}</w:tc></w:tr><w:tr><w:tc>{}</w:tc><w:tc><w:p/></w:tc></w:tr></w:tbl>",
            para("Intro"),
            para("Sample"),
            para("RSD"),
            para("2.3%"),
            para("A1"),
        );
        let doc = parse("r.docx", &docx_with(&body, &[], "")).unwrap();
        assert_eq!(doc.spans.len(), 4);
        let cell = &doc.spans[2];
        assert_eq!(cell.kind, SpanKind::TableCell);
        assert_eq!(cell.content, "RSD\n2.3%");
        assert_eq!(cell.position.block, 1);
        assert_eq!((cell.position.row, cell.position.col), (Some(0), Some(1)));
        assert_eq!(doc.spans[3].position.row, Some(1));
    }

    #[test]
    fn images_precede_paragraph_text() {
        let body = r#"<w:p><w:r><w:t>Figure 1</w:t></w:r><w:r><w:drawing><a:blip r:embed="rId7"/></w:drawing></w:r></w:p>"#;
        let rels = r#"<Relationship Id="rId7" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/image" Target="media/image1.png"/>"#;
        let png = tiny_png();
        let bytes = docx_with(body, &[("word/media/image1.png", &png)], rels);
        let doc = parse("r.docx", &bytes).unwrap();
        assert_eq!(doc.spans[0].kind, SpanKind::Image);
        assert_eq!(doc.spans[1].content, "Figure 1");
        let asset = doc.spans[0].image.as_ref().unwrap();
        assert_eq!(asset.mime, "image/png");
        assert_eq!((asset.width, asset.height), (Some(3), Some(2)));
        assert_eq!(doc.image_bytes(&asset.file_name), Some(png.as_slice()));
    }

    #[test]
    fn image_extension_comes_from_file_name_only() {
        assert_eq!(image_extension("word/media/image1.PNG"), "png");
        assert_eq!(image_extension("word/media.v2/image1"), "bin");
        assert_eq!(image_extension("word/media/img.e-m-f"), "bin");
        assert_eq!(image_extension("word/media/image1."), "bin");
    }

    #[test]
    fn dotted_media_folder_keeps_flat_asset_name() {
        let body = r#"<w:p><w:r><w:drawing><a:blip r:embed="rId3"/></w:drawing></w:r></w:p>"#;
        let rels = r#"<Relationship Id="rId3" Type="image" Target="media.v2/image1"/>"#;
        let png = tiny_png();
        let bytes = docx_with(body, &[("word/media.v2/image1", &png)], rels);
        let doc = parse("r.docx", &bytes).unwrap();
        let asset = doc.spans[0].image.as_ref().unwrap();
        assert_eq!(asset.file_name, "span-0.bin");
        assert!(!asset.file_name.contains('/'));
    }

    #[test]
    fn missing_image_part_is_skipped() {
        let body = r#"<w:p><w:r><w:drawing><a:blip r:embed="rId9"/></w:drawing><w:t>x</w:t></w:r></w:p>"#;
        let rels = r#"<Relationship Id="rId9" Type="image" Target="media/gone.png"/>"#;
        let doc = parse("r.docx", &docx_with(body, &[], rels)).unwrap();
        assert_eq!(doc.spans.len(), 1);
        assert_eq!(doc.spans[0].kind, SpanKind::Text);
    }

    #[test]
    fn malformed_xml_is_parse_error() {
        let bytes = docx_with("<w:p><w:r></w:p>", &[], "");
        let err = parse("bad.docx", &bytes).unwrap_err();
        assert!(matches!(err, ReviewError::Parse { .. }), "got {err:?}");
    }
}
