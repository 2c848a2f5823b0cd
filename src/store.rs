//! Flat-file document store.
//!
//! ```text
//! <root>/
//!   <id>.json          record: document, spans, status, latest analysis
//!   <id>/source.docx   original upload
//!   <id>/span-3.png    extracted images, named after their span
//! ```
//!
//! Every write replaces a whole file through a temporary sibling and a
//! rename, so a reader never sees half a record. There is no locking:
//! concurrent writers to the same document race and the last one wins.

use crate::error::ReviewError;
use crate::model::{AnalysisResult, Document, DocumentFormat, DocumentRecord, DocumentStatus};
use crate::parser::ParsedDocument;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handle on a store directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, ReviewError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| ReviewError::store(&root, e))?;
        info!("Document store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn asset_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn source_path(&self, id: Uuid, format: DocumentFormat) -> PathBuf {
        self.asset_dir(id)
            .join(format!("source.{}", format.extension()))
    }

    /// Store a freshly parsed upload and return its record.
    pub async fn create(
        &self,
        filename: &str,
        format: DocumentFormat,
        source: &[u8],
        parsed: ParsedDocument,
    ) -> Result<DocumentRecord, ReviewError> {
        let document = Document::new(filename, format, parsed.spans);
        let id = document.id;
        let dir = self.asset_dir(id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ReviewError::store(&dir, e))?;

        let record = DocumentRecord::new(document);
        let written = async {
            write_atomic(&self.source_path(id, format), source).await?;
            for image in &parsed.images {
                write_atomic(&dir.join(&image.file_name), &image.bytes).await?;
            }
            self.write_record(&record).await
        }
        .await;
        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                warn!("Failed to remove {}: {}", dir.display(), cleanup);
            }
            return Err(e);
        }
        info!(
            "Stored {} as {} ({} spans, {} images)",
            filename,
            id,
            record.document.spans.len(),
            parsed.images.len()
        );
        Ok(record)
    }

    /// Load one record.
    pub async fn get(&self, id: Uuid) -> Result<DocumentRecord, ReviewError> {
        let path = self.record_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReviewError::DocumentNotFound(id))
            }
            Err(e) => return Err(ReviewError::store(&path, e)),
        };
        decode_record(&path, &bytes)
    }

    /// Every readable record, newest upload first.
    ///
    /// Records that fail to decode are skipped with a warning so one bad
    /// file does not take the document list down.
    pub async fn list(&self) -> Result<Vec<DocumentRecord>, ReviewError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| ReviewError::store(&self.root, e))?;
        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ReviewError::store(&self.root, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    warn!("Skipping unreadable record {}: {}", path.display(), e);
                    continue;
                }
            };
            match decode_record(&path, &bytes) {
                Ok(r) => records.push(r),
                Err(e) => warn!("Skipping {}", e),
            }
        }
        records.sort_by(|a, b| b.document.uploaded_at.cmp(&a.document.uploaded_at));
        Ok(records)
    }

    /// Change the status, keeping everything else.
    pub async fn set_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
    ) -> Result<DocumentRecord, ReviewError> {
        let mut record = self.get(id).await?;
        record.status = status;
        record.updated_at = Utc::now();
        self.write_record(&record).await?;
        debug!("Document {} is now {}", id, status);
        Ok(record)
    }

    /// Replace the analysis wholesale and mark the document analyzed.
    pub async fn save_analysis(
        &self,
        id: Uuid,
        analysis: AnalysisResult,
    ) -> Result<DocumentRecord, ReviewError> {
        let mut record = self.get(id).await?;
        record.analysis = Some(analysis);
        record.status = DocumentStatus::Analyzed;
        record.updated_at = Utc::now();
        self.write_record(&record).await?;
        Ok(record)
    }

    /// Remove the record and every asset.
    pub async fn delete(&self, id: Uuid) -> Result<(), ReviewError> {
        let path = self.record_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReviewError::DocumentNotFound(id))
            }
            Err(e) => return Err(ReviewError::store(&path, e)),
        }
        let dir = self.asset_dir(id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove assets of {}: {}", id, e);
            }
        }
        info!("Deleted document {}", id);
        Ok(())
    }

    /// The original upload.
    pub async fn read_source(&self, record: &DocumentRecord) -> Result<Vec<u8>, ReviewError> {
        let path = self.source_path(record.id(), record.document.format);
        tokio::fs::read(&path)
            .await
            .map_err(|e| ReviewError::store(&path, e))
    }

    /// Bytes and MIME type of the image behind `span_id`.
    pub async fn read_image(
        &self,
        record: &DocumentRecord,
        span_id: u32,
    ) -> Result<(Vec<u8>, String), ReviewError> {
        let dir = self.asset_dir(record.id());
        let asset = record
            .document
            .span(span_id)
            .and_then(|s| s.image.as_ref())
            .ok_or_else(|| ReviewError::FileNotFound {
                path: dir.join(format!("span-{span_id}")),
            })?;
        let path = dir.join(&asset.file_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok((bytes, asset.mime.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ReviewError::FileNotFound { path })
            }
            Err(e) => Err(ReviewError::store(&path, e)),
        }
    }

    async fn write_record(&self, record: &DocumentRecord) -> Result<(), ReviewError> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| ReviewError::Internal(format!("cannot serialise record: {e}")))?;
        write_atomic(&self.record_path(record.id()), &json).await
    }
}

fn decode_record(path: &Path, bytes: &[u8]) -> Result<DocumentRecord, ReviewError> {
    serde_json::from_slice(bytes).map_err(|e| ReviewError::CorruptRecord {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// Write to a uniquely named `<path>.<uuid>.tmp`, then rename over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ReviewError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(ReviewError::store(path, e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(ReviewError::store(path, e));
    }
    Ok(())
}
