//! WordprocessingML body walker shared by the DOCX parser and exporter.
//!
//! ## Why one walker for both directions?
//!
//! A finding is anchored at byte offsets into a span's text. The exporter can
//! only put a Word comment at the right place if it reconstructs *exactly*
//! the same paragraph text, in exactly the same paragraph order, as the
//! parser did when it produced the span. Running both through the same
//! [`BodyCursor`] makes that a structural guarantee rather than two copies of
//! the same rules that drift apart.
//!
//! ## What counts
//!
//! - A **block** is a `w:p` or `w:tbl` whose ancestors below `w:body` are
//!   only transparent wrappers (`w:sdt`, `w:sdtContent`, `w:customXml`).
//! - Paragraph text is the concatenation of `w:t` text plus `\t` for
//!   `w:tab` and `\n` for `w:br`/`w:cr`, counted only when the element is a
//!   direct child of `w:r` (tab stops in `w:pPr` are not text).
//! - Rows and cells are counted for the block-level table only; paragraphs
//!   of nested tables belong to the enclosing cell.
//! - `mc:Fallback` (a duplicate of `mc:AlternateContent`'s choice) and
//!   `w:txbxContent` (floating text boxes) are skipped wholesale.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

/// Wrappers that do not stop a `w:p`/`w:tbl` from being a block.
const TRANSPARENT: &[&str] = &["w:sdt", "w:sdtContent", "w:customXml", "w:smartTag"];

/// Subtrees whose content never becomes span text.
const SKIPPED: &[&str] = &["mc:Fallback", "w:txbxContent"];

pub(crate) const WORD_NS: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";
pub(crate) const COMMENTS_REL_TYPE: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/comments";
pub(crate) const COMMENTS_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.comments+xml";

/// Coordinates of a cell in a block-level table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CellLoc {
    /// Ordinal of the table among the document's block-level tables.
    pub table: usize,
    pub row: usize,
    pub col: usize,
}

/// Where a counted paragraph sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ParaLoc {
    pub block: usize,
    pub cell: Option<CellLoc>,
    /// Paragraph ordinal inside its cell; 0 outside tables.
    pub index_in_cell: usize,
}

/// What one XML event means for the body structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    None,
    ParagraphStart(ParaLoc),
    ParagraphEnd(ParaLoc),
    /// A self-closing `<w:p/>`.
    EmptyParagraph(ParaLoc),
    TableStart { block: usize, table: usize },
    TableEnd,
    CellStart(CellLoc),
    CellEnd(CellLoc),
    /// Text of one `w:t` element, unescaped.
    Text(String),
    /// `\t` or `\n` contributed by `w:tab`, `w:br` or `w:cr`.
    Symbol(char),
    /// Relationship id of an embedded picture.
    Image(String),
    /// `w:pStyle` of the current counted paragraph.
    Style(String),
}

#[derive(Debug, Default)]
pub(crate) struct BodyCursor {
    stack: Vec<String>,
    skip_at: Option<usize>,
    next_block: usize,
    next_table: usize,

    /// Depth (stack length) of the current block element.
    block_depth: Option<usize>,
    block: usize,
    in_table_block: bool,
    table: usize,
    row: Option<usize>,
    col: Option<usize>,
    cell: Option<CellLoc>,
    cell_depth: Option<usize>,
    cell_paragraphs: usize,

    para_depth: Option<usize>,
    para: Option<ParaLoc>,
    in_text: bool,
}

impl BodyCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counted paragraph, if any.
    pub fn paragraph(&self) -> Option<ParaLoc> {
        self.para
    }

    /// Element directly enclosing the next event.
    pub fn parent(&self) -> Option<&str> {
        self.stack.last().map(String::as_str)
    }

    /// True while inside a skipped subtree.
    pub fn skipping(&self) -> bool {
        self.skip_at.is_some()
    }

    /// Stack depth of the current counted paragraph element.
    pub fn paragraph_depth(&self) -> Option<usize> {
        self.para_depth
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn at_body_level(&self) -> bool {
        if self.block_depth.is_some() {
            return false;
        }
        match self.stack.iter().rposition(|n| n == "w:body") {
            Some(i) => self.stack[i + 1..]
                .iter()
                .all(|n| TRANSPARENT.contains(&n.as_str())),
            None => false,
        }
    }

    fn table_depth(&self) -> usize {
        self.stack.iter().filter(|n| *n == "w:tbl").count()
    }

    /// Feed one event; returns its structural meaning.
    pub fn advance(&mut self, event: &Event<'_>) -> Result<Step, quick_xml::Error> {
        match event {
            Event::Start(e) => Ok(self.on_start(e)),
            Event::Empty(e) => Ok(self.on_empty(e)),
            Event::End(e) => Ok(self.on_end(&String::from_utf8_lossy(e.name().as_ref()))),
            Event::Text(t) if self.in_text && !self.skipping() => {
                Ok(Step::Text(t.unescape()?.into_owned()))
            }
            Event::CData(t) if self.in_text && !self.skipping() => {
                Ok(Step::Text(String::from_utf8_lossy(t).into_owned()))
            }
            _ => Ok(Step::None),
        }
    }

    fn on_start(&mut self, e: &BytesStart<'_>) -> Step {
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        if self.skipping() {
            self.stack.push(name);
            return Step::None;
        }
        if SKIPPED.contains(&name.as_str()) {
            self.stack.push(name);
            self.skip_at = Some(self.stack.len());
            return Step::None;
        }

        let step = match name.as_str() {
            "w:p" => match self.open_paragraph() {
                Some(loc) => {
                    self.stack.push(name);
                    self.para_depth = Some(self.stack.len());
                    if loc.cell.is_none() {
                        self.block_depth = Some(self.stack.len());
                    }
                    return Step::ParagraphStart(loc);
                }
                None => Step::None,
            },
            "w:tbl" if self.at_body_level() => {
                self.block = self.next_block;
                self.next_block += 1;
                self.table = self.next_table;
                self.next_table += 1;
                self.in_table_block = true;
                self.row = None;
                self.stack.push(name);
                self.block_depth = Some(self.stack.len());
                return Step::TableStart {
                    block: self.block,
                    table: self.table,
                };
            }
            "w:tr" if self.in_table_block && self.table_depth() == 1 => {
                self.row = Some(self.row.map_or(0, |r| r + 1));
                self.col = None;
                Step::None
            }
            "w:tc" if self.in_table_block && self.table_depth() == 1 => {
                let col = self.col.map_or(0, |c| c + 1);
                self.col = Some(col);
                let cell = CellLoc {
                    table: self.table,
                    row: self.row.unwrap_or(0),
                    col,
                };
                self.cell = Some(cell);
                self.cell_paragraphs = 0;
                self.stack.push(name);
                self.cell_depth = Some(self.stack.len());
                return Step::CellStart(cell);
            }
            "w:t" => {
                self.in_text = self.para_depth.is_some() && self.parent() == Some("w:r");
                Step::None
            }
            "a:blip" | "v:imagedata" => self.image_step(e),
            _ => Step::None,
        };
        self.stack.push(name);
        step
    }

    fn on_empty(&mut self, e: &BytesStart<'_>) -> Step {
        if self.skipping() {
            return Step::None;
        }
        let name = e.name();
        match name.as_ref() {
            b"w:p" => match self.open_paragraph() {
                Some(loc) => {
                    self.para = None;
                    Step::EmptyParagraph(loc)
                }
                None => Step::None,
            },
            b"w:tab" if self.in_run() => Step::Symbol('\t'),
            b"w:br" | b"w:cr" if self.in_run() => Step::Symbol('\n'),
            b"a:blip" | b"v:imagedata" => self.image_step(e),
            b"w:pStyle"
                if self.parent() == Some("w:pPr")
                    && self.para_depth == Some(self.stack.len() - 1) =>
            {
                attr(e, b"w:val").map_or(Step::None, Step::Style)
            }
            _ => Step::None,
        }
    }

    fn on_end(&mut self, name: &str) -> Step {
        let depth = self.stack.len();
        self.stack.pop();
        if let Some(skip) = self.skip_at {
            if skip == depth {
                self.skip_at = None;
            }
            return Step::None;
        }

        match name {
            "w:t" => {
                self.in_text = false;
                Step::None
            }
            "w:p" if self.para_depth == Some(depth) => {
                self.para_depth = None;
                if self.block_depth == Some(depth) {
                    self.block_depth = None;
                }
                match self.para.take() {
                    Some(loc) => Step::ParagraphEnd(loc),
                    None => Step::None,
                }
            }
            "w:tc" if self.cell_depth == Some(depth) => {
                self.cell_depth = None;
                match self.cell.take() {
                    Some(cell) => Step::CellEnd(cell),
                    None => Step::None,
                }
            }
            "w:tbl" if self.in_table_block && self.block_depth == Some(depth) => {
                self.in_table_block = false;
                self.block_depth = None;
                Step::TableEnd
            }
            _ => Step::None,
        }
    }

    /// Allocate the location of a paragraph that is about to open, if it is
    /// one we count.
    fn open_paragraph(&mut self) -> Option<ParaLoc> {
        if self.para_depth.is_some() {
            return None;
        }
        let loc = if self.at_body_level() {
            self.block = self.next_block;
            self.next_block += 1;
            ParaLoc {
                block: self.block,
                cell: None,
                index_in_cell: 0,
            }
        } else if let Some(cell) = self.cell {
            let index_in_cell = self.cell_paragraphs;
            self.cell_paragraphs += 1;
            ParaLoc {
                block: self.block,
                cell: Some(cell),
                index_in_cell,
            }
        } else {
            return None;
        };
        self.para = Some(loc);
        Some(loc)
    }

    fn in_run(&self) -> bool {
        self.para_depth.is_some() && self.parent() == Some("w:r")
    }

    fn image_step(&self, e: &BytesStart<'_>) -> Step {
        if self.para_depth.is_none() {
            return Step::None;
        }
        let key: &[u8] = if e.name().as_ref() == b"a:blip" {
            b"r:embed"
        } else {
            b"r:id"
        };
        attr(e, key).map_or(Step::None, Step::Image)
    }
}

/// Read an attribute value by qualified name.
pub(crate) fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .with_checks(false)
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .map(|a| {
            a.unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(&a.value).into_owned())
        })
}

/// A `Relationship` entry from a `.rels` part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Relationship {
    pub id: String,
    pub rel_type: String,
    pub target: String,
    pub external: bool,
}

/// Parse a `.rels` part into an id-keyed map.
pub(crate) fn parse_relationships(
    xml: &str,
) -> Result<HashMap<String, Relationship>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut rels = HashMap::new();
    loop {
        match reader.read_event()? {
            Event::Empty(e) | Event::Start(e) if e.name().as_ref() == b"Relationship" => {
                let (Some(id), Some(target)) = (attr(&e, b"Id"), attr(&e, b"Target")) else {
                    continue;
                };
                let rel = Relationship {
                    id: id.clone(),
                    rel_type: attr(&e, b"Type").unwrap_or_default(),
                    target,
                    external: attr(&e, b"TargetMode").is_some_and(|m| m == "External"),
                };
                rels.insert(id, rel);
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(rels)
}

/// Resolve a relationship target relative to the `word/` directory into a
/// package path.
pub(crate) fn resolve_part(target: &str) -> String {
    if let Some(abs) = target.strip_prefix('/') {
        return abs.to_string();
    }
    let mut parts: Vec<&str> = vec!["word"];
    for seg in target.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Walk `body` (the inside of `w:body`) and collect non-trivial steps.
    fn walk(body: &str) -> Vec<Step> {
        let xml = format!(
            r#"<?xml version="1.0"?><w:document xmlns:w="{WORD_NS}"><w:body>{body}</w:body></w:document>"#
        );
        let mut reader = Reader::from_str(&xml);
        let mut cursor = BodyCursor::new();
        let mut steps = Vec::new();
        loop {
            let ev = reader.read_event().unwrap();
            if matches!(ev, Event::Eof) {
                break;
            }
            let step = cursor.advance(&ev).unwrap();
            if step != Step::None {
                steps.push(step);
            }
        }
        steps
    }

    fn loc(block: usize) -> ParaLoc {
        ParaLoc {
            block,
            cell: None,
            index_in_cell: 0,
        }
    }

    #[test]
    fn paragraphs_are_numbered_blocks() {
        let steps = walk(r#"<w:p><w:r><w:t>One</w:t></w:r></w:p><w:p/><w:p><w:r><w:t>Two</w:t></w:r></w:p>"#);
        assert_eq!(
            steps,
            vec![
                Step::ParagraphStart(loc(0)),
                Step::Text("One".into()),
                Step::ParagraphEnd(loc(0)),
                Step::EmptyParagraph(loc(1)),
                Step::ParagraphStart(loc(2)),
                Step::Text("Two".into()),
                Step::ParagraphEnd(loc(2)),
            ]
        );
    }

    #[test]
    fn tabs_in_paragraph_properties_are_not_text() {
        let steps = walk(
            r#"<w:p><w:pPr><w:pStyle w:val="Heading1"/><w:tabs><w:tab w:val="left" w:pos="720"/></w:tabs></w:pPr><w:r><w:t>A</w:t><w:tab/><w:t>B</w:t><w:br/></w:r></w:p>"#,
        );
        assert_eq!(
            steps,
            vec![
                Step::ParagraphStart(loc(0)),
                Step::Style("Heading1".into()),
                Step::Text("A".into()),
                Step::Symbol('\t'),
                Step::Text("B".into()),
                Step::Symbol('\n'),
                Step::ParagraphEnd(loc(0)),
            ]
        );
    }

    #[test]
    fn table_cells_get_coordinates() {
        let steps = walk(
            r#"<w:tbl><w:tr><w:tc><w:p><w:r><w:t>a</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>b</w:t></w:r></w:p><w:p><w:r><w:t>c</w:t></w:r></w:p></w:tc></w:tr></w:tbl><w:p><w:r><w:t>after</w:t></w:r></w:p>"#,
        );
        let cell = |col| CellLoc { table: 0, row: 0, col };
        assert!(steps.contains(&Step::TableStart { block: 0, table: 0 }));
        assert!(steps.contains(&Step::ParagraphStart(ParaLoc {
            block: 0,
            cell: Some(cell(1)),
            index_in_cell: 1,
        })));
        assert!(steps.contains(&Step::CellEnd(cell(1))));
        assert!(steps.contains(&Step::ParagraphStart(loc(1))));
    }

    #[test]
    fn content_controls_are_transparent() {
        let steps = walk(
            r#"<w:sdt><w:sdtContent><w:p><w:r><w:t>inside</w:t></w:r></w:p></w:sdtContent></w:sdt>"#,
        );
        assert_eq!(steps[0], Step::ParagraphStart(loc(0)));
        assert_eq!(steps[1], Step::Text("inside".into()));
    }

    #[test]
    fn text_boxes_and_fallbacks_are_skipped() {
        let steps = walk(
            r#"<w:p><w:r><w:t>main</w:t></w:r><w:r><mc:AlternateContent><mc:Choice><w:drawing><w:txbxContent><w:p><w:r><w:t>box</w:t></w:r></w:p></w:txbxContent></w:drawing></mc:Choice><mc:Fallback><w:pict><w:p><w:r><w:t>dup</w:t></w:r></w:p></w:pict></mc:Fallback></mc:AlternateContent></w:r></w:p>"#,
        );
        let texts: Vec<_> = steps
            .iter()
            .filter_map(|s| match s {
                Step::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["main"]);
        assert_eq!(steps.last(), Some(&Step::ParagraphEnd(loc(0))));
    }

    #[test]
    fn images_report_relationship_ids() {
        let steps = walk(
            r#"<w:p><w:r><w:drawing><a:graphic><a:graphicData><pic:pic><pic:blipFill><a:blip r:embed="rId5"/></pic:blipFill></pic:pic></a:graphicData></a:graphic></w:drawing></w:r></w:p>"#,
        );
        assert!(steps.contains(&Step::Image("rId5".into())));
    }

    #[test]
    fn escaped_text_is_unescaped() {
        let steps = walk(r#"<w:p><w:r><w:t>a &amp; b &lt; c</w:t></w:r></w:p>"#);
        assert!(steps.contains(&Step::Text("a & b < c".into())));
    }

    #[test]
    fn relationships_parse_and_resolve() {
        let rels = parse_relationships(
            r#"<Relationships><Relationship Id="rId1" Type="t/image" Target="media/image1.png"/><Relationship Id="rId2" Type="t/hyperlink" Target="http://x" TargetMode="External"/></Relationships>"#,
        )
        .unwrap();
        assert_eq!(rels["rId1"].target, "media/image1.png");
        assert!(rels["rId2"].external);
        assert_eq!(resolve_part("media/image1.png"), "word/media/image1.png");
        assert_eq!(resolve_part("../media/x.png"), "media/x.png");
        assert_eq!(resolve_part("/word/media/y.png"), "word/media/y.png");
    }
}
