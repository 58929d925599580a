//! In-memory collaborators for driving the controllers without a network.
//!
//! Used by this crate's tests and by shells that want canned data while
//! building views.

use async_trait::async_trait;
use base64::Engine as _;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

use crate::capabilities::chain::{
    ChainError, CounterEvidenceRequest, DisputeClient, RaiseDisputeRequest, WriteReceipt,
};
use crate::capabilities::content_store::{ContentStore, UploadBlob};
use crate::capabilities::HttpError;
use crate::model::{Cid, PageCursor};
use crate::pagination::{PageRequest, PageResponse, PageSource};

fn encode_offset(offset: usize) -> PageCursor {
    PageCursor::new(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(offset.to_string()))
}

fn decode_offset(cursor: &str) -> Result<usize, HttpError> {
    let invalid = || HttpError::HttpStatus {
        status: 400,
        message: format!("unknown cursor '{}'", cursor),
        retryable: false,
    };
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| invalid())?;
    std::str::from_utf8(&raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)
}

fn injected_failure() -> HttpError {
    HttpError::ConnectionError {
        message: "injected failure".to_string(),
    }
}

// ============================================================================
// Pages
// ============================================================================

/// Serves slices of a fixed vector. Cursors encode the slice offset.
pub struct VecPageSource<T> {
    items: Mutex<Vec<T>>,
    failures: AtomicU32,
    requests: Mutex<Vec<PageRequest>>,
    open: watch::Sender<bool>,
}

impl<T: Clone> VecPageSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: Mutex::new(items),
            failures: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
            open: watch::Sender::new(true),
        }
    }

    /// Makes the next `count` fetches fail with a connection error.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Replaces the backing data, as if the server changed underneath.
    pub fn replace_items(&self, items: Vec<T>) {
        *self.items.lock().unwrap_or_else(PoisonError::into_inner) = items;
    }

    /// Holds every subsequent fetch until [`VecPageSource::release`].
    pub fn hold(&self) {
        self.open.send_replace(false);
    }

    pub fn release(&self) {
        self.open.send_replace(true);
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl<T> PageSource<T> for VecPageSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn fetch_page(&self, request: PageRequest) -> Result<PageResponse<T>, HttpError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let mut open = self.open.subscribe();
        let opened = open.wait_for(|open| *open).await.is_ok();
        if !opened {
            return Err(injected_failure());
        }

        let should_fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(injected_failure());
        }

        let offset = match &request.after {
            Some(cursor) => decode_offset(cursor.as_str())?,
            None => 0,
        };
        let limit = request.limit as usize;
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let start = offset.min(items.len());
        let end = (start + limit).min(items.len());

        Ok(PageResponse {
            data: items[start..end].to_vec(),
            next: (end < items.len()).then(|| encode_offset(end)),
            previous: (start > 0).then(|| encode_offset(start.saturating_sub(limit))),
            total: Some(items.len() as u64),
        })
    }
}

// ============================================================================
// Content store
// ============================================================================

/// Content store that keeps uploads in memory and derives CIDs from a counter.
#[derive(Default)]
pub struct MemoryContentStore {
    uploads: Mutex<Vec<UploadBlob>>,
    attempts: AtomicUsize,
    fail_on: Mutex<Option<usize>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the upload attempt with the given 0-based index.
    pub fn fail_on_attempt(&self, attempt: usize) {
        *self.fail_on.lock().unwrap_or_else(PoisonError::into_inner) = Some(attempt);
    }

    pub fn uploads(&self) -> Vec<UploadBlob> {
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn upload(&self, blob: UploadBlob) -> Result<Cid, HttpError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if *self.fail_on.lock().unwrap_or_else(PoisonError::into_inner) == Some(attempt) {
            return Err(HttpError::HttpStatus {
                status: 503,
                message: "store unavailable".to_string(),
                retryable: true,
            });
        }
        tokio::task::yield_now().await;

        let mut uploads = self.uploads.lock().unwrap_or_else(PoisonError::into_inner);
        uploads.push(blob);
        Ok(Cid::new(format!("bafy{:04}", uploads.len())))
    }

    fn content_url(&self, cid: &Cid) -> String {
        format!("memory://{}", cid)
    }
}

// ============================================================================
// Chain
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum ChainCall {
    Raise(RaiseDisputeRequest),
    Counter(CounterEvidenceRequest),
}

/// Dispute client that replays queued outcomes and records every call.
///
/// When the queue is empty, calls succeed with a receipt derived from the
/// call count.
#[derive(Default)]
pub struct ScriptedDisputeClient {
    outcomes: Mutex<VecDeque<Result<Option<WriteReceipt>, ChainError>>>,
    calls: Mutex<Vec<ChainCall>>,
}

impl ScriptedDisputeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: Result<Option<WriteReceipt>, ChainError>) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
    }

    pub fn calls(&self) -> Vec<ChainCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn next_outcome(&self, call: ChainCall) -> Result<Option<WriteReceipt>, ChainError> {
        // Only raising a dispute creates one.
        let opens_dispute = matches!(call, ChainCall::Raise(_));
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.push(call);
        let count = calls.len();
        drop(calls);

        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| {
                Ok(Some(WriteReceipt {
                    tx_hash: Some(format!("0xtx{}", count).as_str().into()),
                    dispute_id: opens_dispute.then(|| count.to_string().as_str().into()),
                }))
            })
    }
}

#[async_trait]
impl DisputeClient for ScriptedDisputeClient {
    async fn raise_dispute(
        &self,
        request: RaiseDisputeRequest,
    ) -> Result<Option<WriteReceipt>, ChainError> {
        self.next_outcome(ChainCall::Raise(request))
    }

    async fn dispute_assertion(
        &self,
        request: CounterEvidenceRequest,
    ) -> Result<Option<WriteReceipt>, ChainError> {
        self.next_outcome(ChainCall::Counter(request))
    }
}
