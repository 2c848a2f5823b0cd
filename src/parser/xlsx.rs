//! XLSX → one `table_cell` span per non-empty cell, via `calamine`.

use super::{ParsedDocument, SpanSink};
use crate::error::ReviewError;
use crate::model::{SpanKind, SpanPosition};
use calamine::{Reader, Xlsx};
use std::io::Cursor;
use tracing::warn;

/// Parse an XLSX workbook held in memory.
pub fn parse(filename: &str, bytes: &[u8]) -> Result<ParsedDocument, ReviewError> {
    let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(bytes))
        .map_err(|e| ReviewError::parse(filename, format!("cannot open workbook: {e}")))?;

    let mut sink = SpanSink::default();
    for (sheet_idx, sheet) in workbook.sheet_names().to_vec().into_iter().enumerate() {
        let range = match workbook.worksheet_range(&sheet) {
            Ok(r) => r,
            Err(e) => {
                warn!("{}: skipping sheet '{}': {}", filename, sheet, e);
                continue;
            }
        };
        let (row0, col0) = range.start().unwrap_or((0, 0));
        for (r, row) in range.rows().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                let row_abs = row0 as usize + r;
                let col_abs = col0 as usize + c;
                let position = SpanPosition {
                    block: sheet_idx,
                    sheet: Some(sheet.clone()),
                    row: Some(row_abs),
                    col: Some(col_abs),
                    cell: Some(cell_ref(row_abs, col_abs)),
                    ..Default::default()
                };
                sink.push_text(SpanKind::TableCell, &cell.to_string(), position);
            }
        }
    }
    Ok(sink.finish())
}

/// A1-style reference for 0-based coordinates.
pub fn cell_ref(row: usize, col: usize) -> String {
    let mut letters = Vec::new();
    let mut n = col + 1;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    format!("{}{}", String::from_utf8_lossy(&letters), row + 1)
}
