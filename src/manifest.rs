use serde::{Deserialize, Serialize};

use crate::model::{Cid, SubjectId, UnixTimeMs};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub cid: Cid,
    pub url: String,
}

/// The JSON document whose CID goes on-chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceManifest {
    pub subject_id: SubjectId,
    pub description: String,
    pub urls: Vec<String>,
    /// ISO-8601, UTC.
    pub timestamp: String,
    pub files: Vec<ManifestFileEntry>,
}

impl EvidenceManifest {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Collects file entries as uploads complete; consumed by `build`.
#[derive(Debug)]
pub struct ManifestBuilder {
    subject_id: SubjectId,
    files: Vec<ManifestFileEntry>,
}

impl ManifestBuilder {
    pub fn new(subject_id: SubjectId) -> Self {
        Self {
            subject_id,
            files: Vec::new(),
        }
    }

    pub fn push_file(&mut self, entry: ManifestFileEntry) {
        self.files.push(entry);
    }

    pub fn build(self, description: impl Into<String>, urls: Vec<String>, at: UnixTimeMs) -> EvidenceManifest {
        EvidenceManifest {
            subject_id: self.subject_id,
            description: description.into(),
            urls,
            timestamp: at.to_rfc3339(),
            files: self.files,
        }
    }
}

/// `<purpose>_<epoch-millis>.json`, with the purpose reduced to
/// `[A-Za-z0-9_-]`.
pub fn manifest_file_name(purpose: &str, at: UnixTimeMs) -> String {
    let mut cleaned: String = purpose
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        cleaned.push_str("evidence");
    }
    format!("{}_{}.json", cleaned, at.0)
}
