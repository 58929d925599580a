//! End-to-end submission scenarios over the in-memory store and a scripted
//! dispute client.

use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use shared::capabilities::chain::{CounterEvidence, RaiseDispute, WriteReceipt};
use shared::capabilities::{ContentStore, HttpError, UploadBlob};
use shared::model::{Cid, DisputeId, SubjectId, TxHash};
use shared::submission::UploadTarget;
use shared::testing::{ChainCall, MemoryContentStore, ScriptedDisputeClient};
use shared::{
    EvidenceCollector, EvidenceError, RawFile, ResetPolicy, SubmissionError, SubmissionPipeline,
    SubmissionResult, UploadProgress,
};

struct Harness {
    pipeline: SubmissionPipeline<Arc<MemoryContentStore>>,
    store: Arc<MemoryContentStore>,
    client: Arc<ScriptedDisputeClient>,
}

fn harness(policy: ResetPolicy) -> Harness {
    let store = Arc::new(MemoryContentStore::new());
    let evidence = Arc::new(EvidenceCollector::default());
    Harness {
        pipeline: SubmissionPipeline::new(evidence, Arc::clone(&store), policy),
        store,
        client: Arc::new(ScriptedDisputeClient::new()),
    }
}

impl Harness {
    fn raise(&self) -> RaiseDispute<Arc<ScriptedDisputeClient>> {
        RaiseDispute::new(Arc::clone(&self.client), "IMPROPER_REGISTRATION")
    }

    fn add_documents(&self, names: &[&str]) {
        for name in names {
            self.pipeline
                .evidence()
                .add_file(RawFile::new(*name, "application/pdf", name.as_bytes().to_vec()));
        }
    }
}

#[tokio::test]
async fn empty_bundle_is_rejected_until_a_url_is_added() {
    let h = harness(ResetPolicy::ClearOnSuccess);
    let subject = SubjectId::new("ip-1");

    let err = h.pipeline.submit(&subject, &h.raise()).await.unwrap_err();
    assert_matches!(err, SubmissionError::Validation(EvidenceError::Empty));
    assert_eq!(h.store.attempts(), 0);
    assert!(h.client.calls().is_empty());

    let slot = h.pipeline.evidence().add_url();
    h.pipeline.evidence().update_url(slot, "   ").unwrap();
    assert!(h.pipeline.submit(&subject, &h.raise()).await.unwrap_err().is_validation());

    h.pipeline
        .evidence()
        .update_url(slot, "https://example.com/e1")
        .unwrap();
    assert!(h.pipeline.submit(&subject, &h.raise()).await.is_ok());
}

#[tokio::test]
async fn second_file_failure_aborts_before_manifest_and_write() {
    let h = harness(ResetPolicy::ClearOnSuccess);
    h.add_documents(&["one.pdf", "two.pdf", "three.pdf"]);
    h.store.fail_on_attempt(1);

    let err = h
        .pipeline
        .submit(&SubjectId::new("ip-1"), &h.raise())
        .await
        .unwrap_err();

    assert_matches!(
        err,
        SubmissionError::Upload {
            target: UploadTarget::File { index: 1, ref name },
            ..
        } if name == "two.pdf"
    );
    assert_eq!(h.store.attempts(), 2);
    assert_eq!(h.store.uploads().len(), 1);
    assert!(h.client.calls().is_empty());
    assert_eq!(h.pipeline.progress().percent(), 25.0);

    let view = h.pipeline.view();
    assert!(!view.submitting);
    assert_matches!(view.last_result, Some(SubmissionResult::Failure { ref error_message }) if error_message.contains("two.pdf"));
    assert_eq!(h.pipeline.evidence().snapshot().files().len(), 3);
}

#[tokio::test]
async fn progress_never_decreases_and_ends_at_100() {
    let h = harness(ResetPolicy::ClearOnSuccess);
    h.add_documents(&["a.pdf", "b.pdf", "c.pdf", "d.pdf"]);

    let mut rx = h.pipeline.subscribe();
    let observer = tokio::spawn(async move {
        let mut seen = vec![*rx.borrow_and_update()];
        while rx.changed().await.is_ok() {
            let value = *rx.borrow_and_update();
            seen.push(value);
            if value == UploadProgress::COMPLETE {
                break;
            }
        }
        seen
    });

    h.pipeline
        .submit(&SubjectId::new("ip-1"), &h.raise())
        .await
        .unwrap();

    let seen = observer.await.unwrap();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert_eq!(seen.last(), Some(&UploadProgress::COMPLETE));
}

#[tokio::test]
async fn url_only_bundle_uploads_just_the_manifest() {
    let h = harness(ResetPolicy::ClearOnSuccess);
    let slot = h.pipeline.evidence().add_url();
    h.pipeline
        .evidence()
        .update_url(slot, "https://example.com/e1")
        .unwrap();
    h.client.push_outcome(Ok(Some(WriteReceipt {
        tx_hash: Some(TxHash::new("0xabc")),
        dispute_id: None,
    })));

    let receipt = h
        .pipeline
        .submit(&SubjectId::new("ip-123"), &h.raise())
        .await
        .unwrap();

    assert_eq!(receipt.tx_hash, TxHash::new("0xabc"));
    assert_eq!(
        h.pipeline.last_result(),
        Some(SubmissionResult::Success {
            tx_hash: TxHash::new("0xabc"),
            dispute_id: None,
        })
    );

    let uploads = h.store.uploads();
    assert_eq!(uploads.len(), 1);
    let manifest: serde_json::Value = serde_json::from_slice(&uploads[0].bytes).unwrap();
    assert_eq!(manifest["subjectId"], "ip-123");
    assert_eq!(manifest["urls"], serde_json::json!(["https://example.com/e1"]));
    assert_eq!(manifest["files"], serde_json::json!([]));

    assert_matches!(&h.client.calls()[..], [ChainCall::Raise(request)] if request.evidence_cid == receipt.evidence_cid);
}

#[tokio::test]
async fn concurrent_submit_is_rejected() {
    let h = harness(ResetPolicy::ClearOnSuccess);
    h.add_documents(&["a.pdf"]);
    let subject = SubjectId::new("ip-1");
    let write = h.raise();

    let (first, second) = tokio::join!(
        h.pipeline.submit(&subject, &write),
        h.pipeline.submit(&subject, &write)
    );

    assert!(first.is_ok());
    assert_eq!(second.unwrap_err(), SubmissionError::AlreadyInFlight);
    assert_eq!(h.client.calls().len(), 1);
    assert_eq!(h.store.uploads().len(), 2);
}

#[tokio::test]
async fn counter_evidence_keeps_bundle_until_reset() {
    let h = harness(ResetPolicy::KeepForDisplay);
    h.pipeline.evidence().set_description("license was granted on 2024-01-02");
    let write = CounterEvidence::new(Arc::clone(&h.client), DisputeId::new("7"));

    let receipt = h
        .pipeline
        .submit(&SubjectId::new("0xip"), &write)
        .await
        .unwrap();

    assert_eq!(receipt.dispute_id, Some(DisputeId::new("7")));
    assert!(h.store.uploads()[0].file_name.starts_with("counter_evidence_"));
    assert!(h.pipeline.evidence().validate());

    assert!(h.pipeline.reset());
    assert!(!h.pipeline.evidence().validate());
    assert!(h.pipeline.last_result().is_none());
}

#[tokio::test]
async fn image_preview_does_not_block_submission() {
    let h = harness(ResetPolicy::ClearOnSuccess);
    let png = {
        use image::{ImageBuffer, Rgba};
        let img: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_pixel(4, 4, Rgba([9, 9, 9, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    };
    h.pipeline
        .evidence()
        .add_file(RawFile::new("shot.png", "image/png", png.clone()));

    // Submit straight away; the preview may or may not have landed yet.
    h.pipeline
        .submit(&SubjectId::new("ip-1"), &h.raise())
        .await
        .unwrap();

    let uploads = h.store.uploads();
    assert_eq!(uploads[0].bytes.as_ref(), png.as_slice());
    assert_eq!(uploads[0].content_type, "image/png");
}

/// Stands in for a user typing into the form while uploads run.
struct EditingStore {
    inner: MemoryContentStore,
    evidence: Arc<EvidenceCollector>,
}

#[async_trait]
impl ContentStore for EditingStore {
    async fn upload(&self, blob: UploadBlob) -> Result<Cid, HttpError> {
        self.evidence.set_description("late note typed during upload");
        self.inner.upload(blob).await
    }

    fn content_url(&self, cid: &Cid) -> String {
        self.inner.content_url(cid)
    }
}

#[tokio::test]
async fn edits_made_during_submission_survive_clear_on_success() {
    let evidence = Arc::new(EvidenceCollector::default());
    evidence.add_file(RawFile::new("a.pdf", "application/pdf", b"%PDF".to_vec()));
    let store = EditingStore {
        inner: MemoryContentStore::new(),
        evidence: Arc::clone(&evidence),
    };
    let pipeline = SubmissionPipeline::new(Arc::clone(&evidence), store, ResetPolicy::ClearOnSuccess);
    let client = Arc::new(ScriptedDisputeClient::new());

    pipeline
        .submit(&SubjectId::new("ip-1"), &RaiseDispute::new(client, "PLAGIARISM"))
        .await
        .unwrap();

    let bundle = evidence.snapshot();
    assert_eq!(bundle.description(), "late note typed during upload");
    assert_eq!(bundle.files().len(), 1);
    assert_matches!(pipeline.last_result(), Some(SubmissionResult::Success { .. }));
}
