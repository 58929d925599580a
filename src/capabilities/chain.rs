//! On-chain write collaborator.
//!
//! The protocol SDK is opaque here: it is reached through [`DisputeClient`],
//! and the two dispute call sites wrap it as [`EvidenceWrite`]
//! implementations the submission pipeline can drive without knowing which
//! write it is making.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::model::{Cid, DisputeId, IpId, SubjectId, TxHash};

pub const GENERIC_CHAIN_ERROR: &str = "Transaction failed. Please try again.";

/// Default assertion liveness when the caller does not pick one.
pub const DEFAULT_LIVENESS_SECS: u64 = 30 * 24 * 60 * 60;

/// Rejection from the write operation. The SDK may throw without a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainError {
    pub raw: Option<String>,
}

impl ChainError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            raw: Some(message.into()),
        }
    }

    pub fn without_message() -> Self {
        Self { raw: None }
    }

    /// Raw message, or the generic fallback when the SDK gave none.
    pub fn message(&self) -> &str {
        match self.raw.as_deref().map(str::trim) {
            Some(m) if !m.is_empty() => m,
            _ => GENERIC_CHAIN_ERROR,
        }
    }
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for ChainError {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReceipt {
    #[serde(default)]
    pub tx_hash: Option<TxHash>,
    #[serde(default)]
    pub dispute_id: Option<DisputeId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaiseDisputeRequest {
    pub target_ip_id: IpId,
    pub target_tag: String,
    pub evidence_cid: Cid,
    /// Bond in the smallest currency unit; `None` lets the SDK pick its minimum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bond: Option<u128>,
    pub liveness_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterEvidenceRequest {
    pub ip_id: IpId,
    pub dispute_id: DisputeId,
    pub counter_evidence_cid: Cid,
}

/// Dispute module of the protocol SDK. `Ok(None)` models a call that
/// resolved without producing anything, which callers treat as a failure.
#[async_trait]
pub trait DisputeClient: Send + Sync {
    async fn raise_dispute(
        &self,
        request: RaiseDisputeRequest,
    ) -> Result<Option<WriteReceipt>, ChainError>;

    async fn dispute_assertion(
        &self,
        request: CounterEvidenceRequest,
    ) -> Result<Option<WriteReceipt>, ChainError>;
}

#[async_trait]
impl<C: DisputeClient + ?Sized> DisputeClient for Arc<C> {
    async fn raise_dispute(
        &self,
        request: RaiseDisputeRequest,
    ) -> Result<Option<WriteReceipt>, ChainError> {
        (**self).raise_dispute(request).await
    }

    async fn dispute_assertion(
        &self,
        request: CounterEvidenceRequest,
    ) -> Result<Option<WriteReceipt>, ChainError> {
        (**self).dispute_assertion(request).await
    }
}

/// The write invoked with the evidence CID once the manifest is stored.
#[async_trait]
pub trait EvidenceWrite: Send + Sync {
    /// Prefix of the manifest file name, e.g. `dispute_evidence`.
    fn purpose(&self) -> &str;

    async fn write(
        &self,
        subject: &SubjectId,
        evidence_cid: &Cid,
    ) -> Result<Option<WriteReceipt>, ChainError>;
}

// ============================================================================
// Call-site adapters
// ============================================================================

/// Raises a new dispute against an IP asset.
#[derive(Debug, Clone)]
pub struct RaiseDispute<C> {
    client: C,
    target_tag: String,
    bond: Option<u128>,
    liveness_secs: u64,
}

impl<C: DisputeClient> RaiseDispute<C> {
    pub fn new(client: C, target_tag: impl Into<String>) -> Self {
        Self {
            client,
            target_tag: target_tag.into(),
            bond: None,
            liveness_secs: DEFAULT_LIVENESS_SECS,
        }
    }

    pub fn with_bond(mut self, bond: u128) -> Self {
        self.bond = Some(bond);
        self
    }

    pub fn with_liveness(mut self, liveness_secs: u64) -> Self {
        self.liveness_secs = liveness_secs;
        self
    }
}

#[async_trait]
impl<C: DisputeClient> EvidenceWrite for RaiseDispute<C> {
    fn purpose(&self) -> &str {
        "dispute_evidence"
    }

    async fn write(
        &self,
        subject: &SubjectId,
        evidence_cid: &Cid,
    ) -> Result<Option<WriteReceipt>, ChainError> {
        self.client
            .raise_dispute(RaiseDisputeRequest {
                target_ip_id: IpId::new(subject.as_str()),
                target_tag: self.target_tag.clone(),
                evidence_cid: evidence_cid.clone(),
                bond: self.bond,
                liveness_secs: self.liveness_secs,
            })
            .await
    }
}

/// Submits counter-evidence against an open dispute assertion. The subject
/// is the disputed IP asset.
#[derive(Debug, Clone)]
pub struct CounterEvidence<C> {
    client: C,
    dispute_id: DisputeId,
}

impl<C: DisputeClient> CounterEvidence<C> {
    pub fn new(client: C, dispute_id: DisputeId) -> Self {
        Self { client, dispute_id }
    }
}

#[async_trait]
impl<C: DisputeClient> EvidenceWrite for CounterEvidence<C> {
    fn purpose(&self) -> &str {
        "counter_evidence"
    }

    async fn write(
        &self,
        subject: &SubjectId,
        evidence_cid: &Cid,
    ) -> Result<Option<WriteReceipt>, ChainError> {
        let receipt = self
            .client
            .dispute_assertion(CounterEvidenceRequest {
                ip_id: IpId::new(subject.as_str()),
                dispute_id: self.dispute_id.clone(),
                counter_evidence_cid: evidence_cid.clone(),
            })
            .await?;

        // Counter-evidence joins an existing dispute, it never opens one.
        Ok(receipt.map(|r| WriteReceipt {
            dispute_id: Some(self.dispute_id.clone()),
            ..r
        }))
    }
}

/// Short user-facing text for common SDK failures. Unknown messages pass
/// through unchanged.
pub fn friendly_message(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if lower.contains("insufficient funds") || lower.contains("insufficient balance") {
        "Insufficient funds to cover the bond and gas.".to_string()
    } else if lower.contains("user rejected") || lower.contains("user denied") {
        "Transaction was rejected in the wallet.".to_string()
    } else if lower.contains("revert") {
        "The contract rejected this transaction.".to_string()
    } else if raw.trim().is_empty() {
        GENERIC_CHAIN_ERROR.to_string()
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ChainCall, ScriptedDisputeClient};

    #[test]
    fn test_blank_message_falls_back() {
        assert_eq!(ChainError::without_message().message(), GENERIC_CHAIN_ERROR);
        assert_eq!(ChainError::new("  ").message(), GENERIC_CHAIN_ERROR);
        assert_eq!(ChainError::new("boom").to_string(), "boom");
    }

    #[test]
    fn test_friendly_message() {
        assert!(friendly_message("Error: insufficient funds for gas * price").starts_with("Insufficient"));
        assert!(friendly_message("User rejected the request.").contains("rejected in the wallet"));
        assert!(friendly_message("execution reverted: bad tag").contains("contract rejected"));
        assert_eq!(friendly_message("nonce too low"), "nonce too low");
    }

    #[tokio::test]
    async fn test_raise_dispute_passes_arguments() {
        let client = Arc::new(ScriptedDisputeClient::new());
        let write = RaiseDispute::new(Arc::clone(&client), "PLAGIARISM")
            .with_bond(5)
            .with_liveness(60);
        assert_eq!(write.purpose(), "dispute_evidence");

        write
            .write(&SubjectId::new("0xip"), &Cid::new("bafy1"))
            .await
            .unwrap();

        assert_eq!(
            client.calls(),
            vec![ChainCall::Raise(RaiseDisputeRequest {
                target_ip_id: IpId::new("0xip"),
                target_tag: "PLAGIARISM".to_string(),
                evidence_cid: Cid::new("bafy1"),
                bond: Some(5),
                liveness_secs: 60,
            })]
        );
    }

    #[tokio::test]
    async fn test_counter_evidence_reports_dispute_id() {
        let client = Arc::new(ScriptedDisputeClient::new());
        client.push_outcome(Ok(Some(WriteReceipt {
            tx_hash: Some(TxHash::new("0xabc")),
            dispute_id: None,
        })));
        let write = CounterEvidence::new(Arc::clone(&client), DisputeId::new("42"));

        let receipt = write
            .write(&SubjectId::new("0xip"), &Cid::new("bafy2"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(receipt.dispute_id, Some(DisputeId::new("42")));
        assert_eq!(write.purpose(), "counter_evidence");
    }

    #[tokio::test]
    async fn test_counter_evidence_ignores_dispute_id_from_client() {
        let client = Arc::new(ScriptedDisputeClient::new());
        client.push_outcome(Ok(Some(WriteReceipt {
            tx_hash: Some(TxHash::new("0xdef")),
            dispute_id: Some(DisputeId::new("999")),
        })));
        let write = CounterEvidence::new(Arc::clone(&client), DisputeId::new("7"));

        let receipt = write
            .write(&SubjectId::new("0xip"), &Cid::new("bafy3"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(receipt.dispute_id, Some(DisputeId::new("7")));
        assert_eq!(receipt.tx_hash, Some(TxHash::new("0xdef")));
    }
}
