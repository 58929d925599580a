//! Evidence upload and on-chain submission.
//!
//! Files go to the content store one at a time, in bundle order, followed by
//! the manifest that lists them. Only the manifest CID is handed to the
//! on-chain write. Any upload failure aborts before the write; files already
//! stored stay where they are.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::capabilities::chain::{EvidenceWrite, GENERIC_CHAIN_ERROR};
use crate::capabilities::content_store::{ContentStore, UploadBlob};
use crate::capabilities::HttpError;
use crate::evidence::{EvidenceBundle, EvidenceCollector, EvidenceError};
use crate::in_flight::InFlight;
use crate::manifest::{manifest_file_name, ManifestBuilder, ManifestFileEntry};
use crate::model::{Cid, DisputeId, SubjectId, TxHash, UnixTimeMs};

/// Percentage of uploads completed, in `[0, 100]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadProgress(f32);

impl UploadProgress {
    pub const ZERO: Self = Self(0.0);
    pub const COMPLETE: Self = Self(100.0);

    pub fn from_counts(completed: usize, total: usize) -> Self {
        if total == 0 {
            return Self::ZERO;
        }
        let ratio = completed.min(total) as f32 / total as f32;
        Self(ratio * 100.0)
    }

    pub fn percent(self) -> f32 {
        self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SubmissionResult {
    #[serde(rename_all = "camelCase")]
    Success {
        tx_hash: TxHash,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dispute_id: Option<DisputeId>,
    },
    #[serde(rename_all = "camelCase")]
    Failure { error_message: String },
}

impl SubmissionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SubmissionResult::Success { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadTarget {
    /// 0-based position in the bundle.
    File { index: usize, name: String },
    Manifest,
}

impl std::fmt::Display for UploadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadTarget::File { index, name } => write!(f, "file #{} ({})", index + 1, name),
            UploadTarget::Manifest => f.write_str("evidence manifest"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubmissionError {
    #[error(transparent)]
    Validation(#[from] EvidenceError),

    #[error("a submission is already in progress")]
    AlreadyInFlight,

    #[error("failed to upload {target}: {source}")]
    Upload {
        target: UploadTarget,
        #[source]
        source: HttpError,
    },

    #[error("failed to encode manifest: {0}")]
    Manifest(String),

    #[error("{message}")]
    OnChain { message: String },
}

impl SubmissionError {
    /// Local precondition failures; nothing was sent anywhere.
    pub fn is_validation(&self) -> bool {
        matches!(self, SubmissionError::Validation(_) | SubmissionError::AlreadyInFlight)
    }
}

/// What happens to the bundle after a successful write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Clears the bundle unless it was edited while the submission ran.
    #[default]
    ClearOnSuccess,
    /// The caller clears via [`SubmissionPipeline::reset`] once it has shown
    /// the result.
    KeepForDisplay,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub tx_hash: TxHash,
    pub dispute_id: Option<DisputeId>,
    pub evidence_cid: Cid,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubmissionView {
    pub submitting: bool,
    pub progress: UploadProgress,
    pub last_result: Option<SubmissionResult>,
}

pub struct SubmissionPipeline<S> {
    evidence: Arc<EvidenceCollector>,
    store: S,
    reset_policy: ResetPolicy,
    in_flight: AtomicBool,
    progress: watch::Sender<UploadProgress>,
    last_result: Mutex<Option<SubmissionResult>>,
}

impl<S: ContentStore> SubmissionPipeline<S> {
    pub fn new(evidence: Arc<EvidenceCollector>, store: S, reset_policy: ResetPolicy) -> Self {
        Self {
            evidence,
            store,
            reset_policy,
            in_flight: AtomicBool::new(false),
            progress: watch::Sender::new(UploadProgress::ZERO),
            last_result: Mutex::new(None),
        }
    }

    pub fn evidence(&self) -> &Arc<EvidenceCollector> {
        &self.evidence
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> UploadProgress {
        *self.progress.borrow()
    }

    pub fn is_submitting(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn last_result(&self) -> Option<SubmissionResult> {
        self.last_result.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn view(&self) -> SubmissionView {
        SubmissionView {
            submitting: self.is_submitting(),
            progress: self.progress(),
            last_result: self.last_result(),
        }
    }

    /// Clears the bundle and the last result. Refused while submitting.
    pub fn reset(&self) -> bool {
        let Some(_guard) = InFlight::try_acquire(&self.in_flight) else {
            return false;
        };
        self.evidence.clear();
        self.progress.send_replace(UploadProgress::ZERO);
        *self.last_result.lock().unwrap_or_else(PoisonError::into_inner) = None;
        true
    }

    /// Uploads the bundle and invokes `write` with the manifest CID.
    ///
    /// Dropping the returned future abandons the submission: no further
    /// uploads are issued, no result is recorded, and the pipeline accepts a
    /// new submission.
    #[instrument(skip(self, subject, write), fields(subject = %subject, purpose = write.purpose()))]
    pub async fn submit<W>(&self, subject: &SubjectId, write: &W) -> Result<SubmissionReceipt, SubmissionError>
    where
        W: EvidenceWrite + ?Sized,
    {
        let Some(_guard) = InFlight::try_acquire(&self.in_flight) else {
            debug!("submit called while a submission is in flight");
            return Err(SubmissionError::AlreadyInFlight);
        };

        let bundle = self.evidence.snapshot();
        bundle.check()?;

        self.progress.send_replace(UploadProgress::ZERO);
        *self.last_result.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let outcome = self.run(subject, write, &bundle).await;
        let result = match &outcome {
            Ok(receipt) => {
                info!(tx_hash = %receipt.tx_hash, evidence_cid = %receipt.evidence_cid, "evidence submitted");
                if self.reset_policy == ResetPolicy::ClearOnSuccess
                    && !self.evidence.clear_if_unchanged(&bundle)
                {
                    info!("evidence edited during submission, keeping the form");
                }
                SubmissionResult::Success {
                    tx_hash: receipt.tx_hash.clone(),
                    dispute_id: receipt.dispute_id.clone(),
                }
            }
            Err(e) => {
                error!(error = %e, "evidence submission failed");
                SubmissionResult::Failure {
                    error_message: e.to_string(),
                }
            }
        };
        *self.last_result.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);

        outcome
    }

    async fn run<W>(
        &self,
        subject: &SubjectId,
        write: &W,
        bundle: &EvidenceBundle,
    ) -> Result<SubmissionReceipt, SubmissionError>
    where
        W: EvidenceWrite + ?Sized,
    {
        let total = bundle.files().len() + 1;
        let mut manifest = ManifestBuilder::new(subject.clone());

        for (index, evidence) in bundle.files().iter().enumerate() {
            let file = &evidence.file;
            let blob = UploadBlob::new(file.name.clone(), file.mime_type.clone(), file.bytes.clone());
            let cid = self.store.upload(blob).await.map_err(|source| SubmissionError::Upload {
                target: UploadTarget::File {
                    index,
                    name: file.name.clone(),
                },
                source,
            })?;
            debug!(index, %cid, "file uploaded");

            manifest.push_file(ManifestFileEntry {
                name: file.name.clone(),
                content_type: file.mime_type.clone(),
                url: self.store.content_url(&cid),
                cid,
            });
            self.advance(UploadProgress::from_counts(index + 1, total));
        }

        let now = UnixTimeMs::now();
        let manifest = manifest.build(bundle.description().trim(), bundle.non_blank_urls(), now);
        let bytes = manifest
            .to_json_bytes()
            .map_err(|e| SubmissionError::Manifest(e.to_string()))?;
        let blob = UploadBlob::json(manifest_file_name(write.purpose(), now), bytes);
        let evidence_cid = self.store.upload(blob).await.map_err(|source| SubmissionError::Upload {
            target: UploadTarget::Manifest,
            source,
        })?;
        self.advance(UploadProgress::COMPLETE);
        info!(%evidence_cid, files = manifest.files.len(), "manifest uploaded");

        let receipt = write
            .write(subject, &evidence_cid)
            .await
            .map_err(|e| SubmissionError::OnChain {
                message: e.message().to_string(),
            })?;

        match receipt {
            Some(receipt) => match receipt.tx_hash.filter(|h| !h.as_str().trim().is_empty()) {
                Some(tx_hash) => Ok(SubmissionReceipt {
                    tx_hash,
                    dispute_id: receipt.dispute_id,
                    evidence_cid,
                }),
                None => Err(SubmissionError::OnChain {
                    message: GENERIC_CHAIN_ERROR.to_string(),
                }),
            },
            None => Err(SubmissionError::OnChain {
                message: GENERIC_CHAIN_ERROR.to_string(),
            }),
        }
    }

    fn advance(&self, next: UploadProgress) {
        self.progress.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
    }
}
