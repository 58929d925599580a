//! Everything that leaves the process: list API, content store, chain.
//!
//! Each collaborator is an async trait injected at construction, so the
//! controllers can be driven by the in-memory doubles in [`crate::testing`].

pub mod chain;
pub mod content_store;
pub mod http;

pub use self::chain::{
    friendly_message, ChainError, CounterEvidence, CounterEvidenceRequest, DisputeClient,
    EvidenceWrite, RaiseDispute, RaiseDisputeRequest, WriteReceipt,
};
pub use self::content_store::{ContentStore, HttpContentStore, UploadBlob};
pub use self::http::{HttpBackend, HttpError, RetryPolicy, ValidatedUrl};
