//! Evidence collection.
//!
//! An [`EvidenceBundle`] is the plain data: files, URLs and a description.
//! [`EvidenceCollector`] owns one bundle for a form and fills in image
//! previews in the background. A preview lands on the file it was started
//! for, matched by [`FileId`], so edits made meanwhile are never disturbed.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::preview::PreviewGenerator;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MimeCategory {
    Image,
    Document,
}

impl MimeCategory {
    pub fn classify(mime_type: &str) -> Self {
        let essence = mime_type.split(';').next().unwrap_or_default().trim();
        match essence.get(..6) {
            Some(prefix) if essence.len() > 6 && prefix.eq_ignore_ascii_case("image/") => {
                MimeCategory::Image
            }
            _ => MimeCategory::Document,
        }
    }
}

/// A file as picked by the user.
#[derive(Clone, PartialEq, Eq)]
pub struct RawFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl RawFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }
}

impl std::fmt::Debug for RawFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFile")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.bytes.len())
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEvidence {
    pub id: FileId,
    pub file: RawFile,
    pub category: MimeCategory,
    pub preview_data_url: Option<String>,
}

/// Borrowed view of one piece of evidence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvidenceItem<'a> {
    File(&'a FileEvidence),
    Url(&'a str),
    Text(&'a str),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvidenceError {
    #[error("provide at least one file, link or description")]
    Empty,

    #[error("{kind} index {index} out of range (len {len})")]
    IndexOutOfRange {
        kind: &'static str,
        index: usize,
        len: usize,
    },
}

// ============================================================================
// Bundle
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvidenceBundle {
    files: Vec<FileEvidence>,
    urls: Vec<String>,
    description: String,
}

impl EvidenceBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> &[FileEvidence] {
        &self.files
    }

    /// URL slots as entered, blanks included.
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn add_file(&mut self, file: RawFile) -> FileId {
        let id = FileId::new();
        self.files.push(FileEvidence {
            id,
            category: MimeCategory::classify(&file.mime_type),
            file,
            preview_data_url: None,
        });
        id
    }

    pub fn remove_file(&mut self, index: usize) -> Result<FileEvidence, EvidenceError> {
        check_index("file", index, self.files.len())?;
        Ok(self.files.remove(index))
    }

    /// Fills the preview of file `id`; `false` when the file is gone.
    pub fn set_preview(&mut self, id: FileId, data_url: String) -> bool {
        match self.files.iter_mut().find(|f| f.id == id) {
            Some(file) => {
                file.preview_data_url = Some(data_url);
                true
            }
            None => false,
        }
    }

    /// Adds an empty URL slot for the form to fill.
    pub fn add_url(&mut self) -> usize {
        self.urls.push(String::new());
        self.urls.len() - 1
    }

    pub fn update_url(&mut self, index: usize, value: impl Into<String>) -> Result<(), EvidenceError> {
        check_index("url", index, self.urls.len())?;
        self.urls[index] = value.into();
        Ok(())
    }

    pub fn remove_url(&mut self, index: usize) -> Result<String, EvidenceError> {
        check_index("url", index, self.urls.len())?;
        Ok(self.urls.remove(index))
    }

    pub fn set_description(&mut self, text: impl Into<String>) {
        self.description = text.into();
    }

    /// URLs with content, trimmed.
    pub fn non_blank_urls(&self) -> Vec<String> {
        self.urls
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn items(&self) -> Vec<EvidenceItem<'_>> {
        let mut items: Vec<EvidenceItem<'_>> = self.files.iter().map(EvidenceItem::File).collect();
        items.extend(
            self.urls
                .iter()
                .filter(|u| !u.trim().is_empty())
                .map(|u| EvidenceItem::Url(u.as_str())),
        );
        if !self.description.trim().is_empty() {
            items.push(EvidenceItem::Text(&self.description));
        }
        items
    }

    pub fn validate(&self) -> bool {
        !self.files.is_empty()
            || self.urls.iter().any(|u| !u.trim().is_empty())
            || !self.description.trim().is_empty()
    }

    pub fn check(&self) -> Result<(), EvidenceError> {
        if self.validate() {
            Ok(())
        } else {
            Err(EvidenceError::Empty)
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Same files, URLs and description; previews are not compared.
    pub fn same_evidence(&self, other: &EvidenceBundle) -> bool {
        self.urls == other.urls
            && self.description == other.description
            && self.files.len() == other.files.len()
            && self
                .files
                .iter()
                .zip(&other.files)
                .all(|(a, b)| a.id == b.id && a.file == b.file)
    }
}

fn check_index(kind: &'static str, index: usize, len: usize) -> Result<(), EvidenceError> {
    if index < len {
        Ok(())
    } else {
        Err(EvidenceError::IndexOutOfRange { kind, index, len })
    }
}

// ============================================================================
// Collector
// ============================================================================

/// Shared, form-owned bundle plus background preview generation.
pub struct EvidenceCollector {
    bundle: Arc<Mutex<EvidenceBundle>>,
    previews: Arc<PreviewGenerator>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl EvidenceCollector {
    pub fn new(previews: Arc<PreviewGenerator>) -> Self {
        Self {
            bundle: Arc::new(Mutex::new(EvidenceBundle::new())),
            previews,
            pending: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EvidenceBundle> {
        self.bundle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends the file immediately; image previews are computed in the
    /// background when a tokio runtime is available.
    pub fn add_file(&self, file: RawFile) -> FileId {
        let category = MimeCategory::classify(&file.mime_type);
        let bytes = file.bytes.clone();
        let mime_type = file.mime_type.clone();
        let id = self.lock().add_file(file);

        if category == MimeCategory::Image {
            self.spawn_preview(id, bytes, mime_type);
        }
        id
    }

    fn spawn_preview(&self, id: FileId, bytes: Bytes, mime_type: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(%id, "no runtime, skipping preview");
            return;
        };

        let bundle: Weak<Mutex<EvidenceBundle>> = Arc::downgrade(&self.bundle);
        let previews = Arc::clone(&self.previews);
        let task = handle.spawn(async move {
            let data_url = match previews.data_url(bytes, &mime_type).await {
                Ok(url) => url,
                Err(e) => {
                    warn!(%id, error = %e, "preview unavailable");
                    return;
                }
            };
            let Some(bundle) = bundle.upgrade() else {
                return;
            };
            let applied = bundle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .set_preview(id, data_url);
            if !applied {
                debug!(%id, "file removed before its preview was ready");
            }
        });

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|t| !t.is_finished());
        pending.push(task);
    }

    /// Waits for every preview started so far.
    pub async fn settle_previews(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "preview task failed");
                }
            }
        }
    }

    pub fn remove_file(&self, index: usize) -> Result<FileEvidence, EvidenceError> {
        self.lock().remove_file(index)
    }

    pub fn add_url(&self) -> usize {
        self.lock().add_url()
    }

    pub fn update_url(&self, index: usize, value: impl Into<String>) -> Result<(), EvidenceError> {
        self.lock().update_url(index, value)
    }

    pub fn remove_url(&self, index: usize) -> Result<String, EvidenceError> {
        self.lock().remove_url(index)
    }

    pub fn set_description(&self, text: impl Into<String>) {
        self.lock().set_description(text)
    }

    pub fn validate(&self) -> bool {
        self.lock().validate()
    }

    pub fn snapshot(&self) -> EvidenceBundle {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Clears the bundle only if it still holds `submitted`, so edits made
    /// while a submission was running survive it.
    pub fn clear_if_unchanged(&self, submitted: &EvidenceBundle) -> bool {
        let mut bundle = self.lock();
        if bundle.same_evidence(submitted) {
            bundle.clear();
            true
        } else {
            false
        }
    }
}

impl Default for EvidenceCollector {
    fn default() -> Self {
        Self::new(Arc::new(PreviewGenerator::with_defaults()))
    }
}

impl Drop for EvidenceCollector {
    fn drop(&mut self) {
        for task in self.pending.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::{create_test_png, CORRUPT_PNG, TINY_GIF};

    #[test]
    fn test_classify() {
        assert_eq!(MimeCategory::classify("image/png"), MimeCategory::Image);
        assert_eq!(MimeCategory::classify("IMAGE/JPEG; q=1"), MimeCategory::Image);
        assert_eq!(MimeCategory::classify("application/pdf"), MimeCategory::Document);
        assert_eq!(MimeCategory::classify("image/"), MimeCategory::Document);
        assert_eq!(MimeCategory::classify(""), MimeCategory::Document);
    }

    #[test]
    fn test_empty_bundle_is_invalid() {
        let mut bundle = EvidenceBundle::new();
        assert!(!bundle.validate());
        assert_eq!(bundle.check(), Err(EvidenceError::Empty));

        bundle.add_url();
        bundle.set_description("   ");
        assert!(!bundle.validate());

        bundle.update_url(0, "https://example.com/e1").unwrap();
        assert!(bundle.validate());
    }

    #[test]
    fn test_description_alone_is_valid() {
        let mut bundle = EvidenceBundle::new();
        bundle.set_description("copied artwork");
        assert!(bundle.check().is_ok());
        assert_eq!(bundle.items(), vec![EvidenceItem::Text("copied artwork")]);
    }

    #[test]
    fn test_url_index_errors() {
        let mut bundle = EvidenceBundle::new();
        assert_eq!(
            bundle.update_url(0, "x"),
            Err(EvidenceError::IndexOutOfRange {
                kind: "url",
                index: 0,
                len: 0
            })
        );
        assert!(bundle.remove_file(3).is_err());
    }

    #[test]
    fn test_non_blank_urls_trims() {
        let mut bundle = EvidenceBundle::new();
        for value in ["", " https://a ", "  "] {
            let i = bundle.add_url();
            bundle.update_url(i, value).unwrap();
        }
        assert_eq!(bundle.non_blank_urls(), vec!["https://a".to_string()]);
        assert_eq!(bundle.urls().len(), 3);
    }

    #[test]
    fn test_set_preview_by_identity() {
        let mut bundle = EvidenceBundle::new();
        let a = bundle.add_file(RawFile::new("a.png", "image/png", vec![1u8]));
        let b = bundle.add_file(RawFile::new("b.pdf", "application/pdf", vec![2u8]));
        bundle.remove_file(0).unwrap();

        assert!(!bundle.set_preview(a, "data:a".into()));
        assert!(bundle.set_preview(b, "data:b".into()));
        assert_eq!(bundle.files()[0].preview_data_url.as_deref(), Some("data:b"));
    }

    #[test]
    fn test_clear_if_unchanged_ignores_previews() {
        let collector = EvidenceCollector::default();
        let id = collector.lock().add_file(RawFile::new("a.png", "image/png", vec![1u8]));
        let submitted = collector.snapshot();

        collector.lock().set_preview(id, "data:image/png;base64,AQ==".into());
        assert!(collector.clear_if_unchanged(&submitted));
        assert!(!collector.validate());
    }

    #[test]
    fn test_clear_if_unchanged_keeps_new_edits() {
        let collector = EvidenceCollector::default();
        collector.set_description("first draft");
        let submitted = collector.snapshot();

        collector.set_description("first draft, plus a late note");
        assert!(!collector.clear_if_unchanged(&submitted));
        assert_eq!(collector.snapshot().description(), "first draft, plus a late note");
    }

    #[tokio::test]
    async fn test_collector_fills_image_preview_in_place() {
        let collector = EvidenceCollector::default();
        let image = collector.add_file(RawFile::new("shot.png", "image/png", create_test_png(8, 8)));
        let doc = collector.add_file(RawFile::new("terms.pdf", "application/pdf", b"%PDF".to_vec()));
        collector.add_url();

        collector.settle_previews().await;
        let bundle = collector.snapshot();

        assert_eq!(bundle.files()[0].id, image);
        assert_eq!(bundle.files()[1].id, doc);
        assert!(bundle.files()[0]
            .preview_data_url
            .as_deref()
            .is_some_and(|u| u.starts_with("data:image/png;base64,")));
        assert!(bundle.files()[1].preview_data_url.is_none());
    }

    #[tokio::test]
    async fn test_broken_image_gets_no_preview() {
        let collector = EvidenceCollector::default();
        collector.add_file(RawFile::new("bad.png", "image/png", CORRUPT_PNG.to_vec()));
        collector.settle_previews().await;
        let bundle = collector.snapshot();
        assert_eq!(bundle.files().len(), 1);
        assert!(bundle.files()[0].preview_data_url.is_none());
    }

    #[tokio::test]
    async fn test_gif_and_svg_get_verbatim_previews() {
        let collector = EvidenceCollector::default();
        collector.add_file(RawFile::new("a.gif", "image/gif", TINY_GIF.to_vec()));
        collector.add_file(RawFile::new(
            "b.svg",
            "image/svg+xml",
            br#"<svg xmlns="http://www.w3.org/2000/svg"/>"#.to_vec(),
        ));

        collector.settle_previews().await;
        let bundle = collector.snapshot();

        for (file, prefix) in bundle.files().iter().zip(["data:image/gif;base64,", "data:image/svg+xml;base64,"]) {
            assert_eq!(file.category, MimeCategory::Image);
            assert!(
                file.preview_data_url.as_deref().is_some_and(|u| u.starts_with(prefix)),
                "{} has no preview",
                file.file.name
            );
        }
    }

    #[test]
    fn test_collector_without_runtime_skips_preview() {
        let collector = EvidenceCollector::default();
        collector.add_file(RawFile::new("shot.png", "image/png", vec![0u8]));
        assert_eq!(collector.snapshot().files().len(), 1);
    }
}
