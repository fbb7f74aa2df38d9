//! Payment-proof validation.
//!
//! The validator is the single decision point between a presented proof and
//! an access grant. It handles both proof shapes exhaustively:
//!
//! - **Signed** proofs are structurally checked (both fields present,
//!   non-empty) and then forwarded to the facilitator; the validator never
//!   claims cryptographic validity itself.
//! - **Settled** proofs name a transaction the client claims already
//!   settled on-chain. Structural validity is a 32-byte hash
//!   (`0x` + 64 hex characters). Beyond the shape this path checks
//!   nothing: not inclusion, recipient, amount, or token. It is the
//!   weakest trust tier and is therefore disabled unless the gate is
//!   explicitly configured in demo mode.
//!
//! Every rejection is a distinct [`ProofRejection`] variant so callers can
//! render the right retry path.

use std::sync::Arc;
use tracing::instrument;

use crate::facilitator::{Facilitator, FacilitatorError};
use crate::gate::ChallengeIssuer;
use crate::proto::{PaymentProof, TxHash, VerifyRequest, VerifyResponse, X402Version1};
use crate::registry::ResourceRegistry;

/// A successfully validated proof.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    /// The charged amount in the asset's minor units.
    pub amount: u128,
    /// The paying address, when the facilitator reported one.
    pub payer: Option<String>,
    /// The settling transaction, for settled-shape proofs.
    pub tx_hash: Option<TxHash>,
}

/// Why a proof was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum ProofRejection {
    /// The proof is structurally invalid. The caller must resubmit a
    /// correctly formed proof.
    #[error("malformed payment proof")]
    MalformedProof,
    /// The resource is not registered. The gate treats such resources as
    /// unprotected; the verification endpoint reports them to the caller.
    #[error("unknown resource {0:?}")]
    UnknownResource(String),
    /// The facilitator could not be reached. Transient; the same proof may
    /// be retried.
    #[error("facilitator unreachable")]
    FacilitatorUnreachable(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The facilitator was reached and did not validate the payment.
    /// Terminal for this proof.
    #[error("facilitator rejected payment: {reason}")]
    FacilitatorRejected { reason: String },
}

/// Validates inbound payment proofs against the registry's terms.
pub struct ProofValidator<F> {
    registry: Arc<ResourceRegistry>,
    issuer: Arc<ChallengeIssuer>,
    facilitator: F,
    demo_mode: bool,
}

impl<F> ProofValidator<F> {
    pub fn new(
        registry: Arc<ResourceRegistry>,
        issuer: Arc<ChallengeIssuer>,
        facilitator: F,
    ) -> Self {
        Self {
            registry,
            issuer,
            facilitator,
            demo_mode: false,
        }
    }

    /// Enables the demo trust tier: settled-transaction proofs are accepted
    /// on shape alone, with no facilitator delegation. Not suitable for
    /// production-grade financial guarantees.
    pub fn with_demo_mode(mut self, demo_mode: bool) -> Self {
        self.demo_mode = demo_mode;
        self
    }
}

impl<F> ProofValidator<F>
where
    F: Facilitator,
{
    /// Validates `proof` as payment for `resource_id`.
    #[instrument(name = "validator.validate", skip(self, proof))]
    pub async fn validate(
        &self,
        proof: &PaymentProof,
        resource_id: &str,
    ) -> Result<Accepted, ProofRejection> {
        let entry = self
            .registry
            .lookup(resource_id)
            .ok_or_else(|| ProofRejection::UnknownResource(resource_id.to_string()))?;

        match proof {
            PaymentProof::Signed(signed) => {
                if !signed.is_well_formed() {
                    return Err(ProofRejection::MalformedProof);
                }
                let request = VerifyRequest {
                    x402_version: X402Version1,
                    payment_payload: signed.clone(),
                    payment_requirements: self.issuer.issue(entry),
                };
                let response = self.facilitator.verify(&request).await.map_err(|e| {
                    if e.is_unreachable() {
                        tracing::warn!(error = %e, "facilitator unreachable");
                        ProofRejection::FacilitatorUnreachable(Box::new(e))
                    } else {
                        ProofRejection::FacilitatorRejected {
                            reason: e.to_string(),
                        }
                    }
                })?;
                match response {
                    VerifyResponse::Valid { payer } => Ok(Accepted {
                        amount: entry.amount,
                        payer,
                        tx_hash: None,
                    }),
                    VerifyResponse::Invalid { reason, .. } => {
                        Err(ProofRejection::FacilitatorRejected { reason })
                    }
                }
            }
            PaymentProof::Settled(settled) => {
                // Shape check comes first: a malformed hash is rejected
                // before any trust-tier decision or facilitator call.
                let tx_hash = parse_tx_hash(&settled.tx_hash)?;
                if !self.demo_mode {
                    return Err(ProofRejection::FacilitatorRejected {
                        reason: "settled-transaction proofs require facilitator delegation"
                            .to_string(),
                    });
                }
                Ok(Accepted {
                    amount: entry.amount,
                    payer: None,
                    tx_hash: Some(tx_hash),
                })
            }
        }
    }
}

/// Structural check for a settled-transaction reference:
/// `0x` followed by exactly 64 hex characters.
fn parse_tx_hash(raw: &str) -> Result<TxHash, ProofRejection> {
    let hex_part = raw
        .strip_prefix("0x")
        .ok_or(ProofRejection::MalformedProof)?;
    if hex_part.len() != 64 {
        return Err(ProofRejection::MalformedProof);
    }
    raw.parse().map_err(|_| ProofRejection::MalformedProof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::PaymentTerms;
    use crate::proto::{SettledProof, SignedProof};
    use crate::util::MoneyAmount;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("mock transport failure")]
    struct MockUnreachable;

    impl FacilitatorError for MockUnreachable {
        fn is_unreachable(&self) -> bool {
            true
        }
    }

    enum Verdict {
        Valid,
        Invalid(&'static str),
        Unreachable,
    }

    struct MockFacilitator {
        verdict: Verdict,
        calls: AtomicUsize,
    }

    impl MockFacilitator {
        fn new(verdict: Verdict) -> Self {
            Self {
                verdict,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Facilitator for &MockFacilitator {
        type Error = MockUnreachable;

        async fn verify(&self, _request: &VerifyRequest) -> Result<VerifyResponse, MockUnreachable> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.verdict {
                Verdict::Valid => Ok(VerifyResponse::Valid {
                    payer: Some("0xabc".to_string()),
                }),
                Verdict::Invalid(reason) => Ok(VerifyResponse::Invalid {
                    reason: reason.to_string(),
                    payer: None,
                }),
                Verdict::Unreachable => Err(MockUnreachable),
            }
        }
    }

    fn registry() -> Arc<ResourceRegistry> {
        Arc::new(
            ResourceRegistry::build(
                vec![(
                    "1".to_string(),
                    MoneyAmount::parse("0.05").unwrap(),
                    "Premium article".to_string(),
                    0,
                )],
                6,
            )
            .unwrap(),
        )
    }

    fn issuer() -> Arc<ChallengeIssuer> {
        Arc::new(ChallengeIssuer::new(PaymentTerms {
            network: "base-sepolia".to_string(),
            asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e"
                .parse()
                .unwrap(),
            asset_name: "USDC".to_string(),
            asset_decimals: 6,
            pay_to: "0xad70845D9AE0B40CB68Cc289414Ea21b1Ce18BC8"
                .parse()
                .unwrap(),
            max_timeout_seconds: 60,
        }))
    }

    fn validator(facilitator: &MockFacilitator, demo_mode: bool) -> ProofValidator<&MockFacilitator> {
        ProofValidator::new(registry(), issuer(), facilitator).with_demo_mode(demo_mode)
    }

    fn signed_proof() -> PaymentProof {
        PaymentProof::Signed(SignedProof {
            payload: json!({"authorization": {"from": "0xabc"}}),
            signature: json!("0xsig"),
        })
    }

    fn settled_proof(tx_hash: &str) -> PaymentProof {
        PaymentProof::Settled(SettledProof {
            tx_hash: tx_hash.to_string(),
            network: "base-sepolia".to_string(),
        })
    }

    #[tokio::test]
    async fn accepts_signed_proof_when_facilitator_validates() {
        let facilitator = MockFacilitator::new(Verdict::Valid);
        let validator = validator(&facilitator, false);
        let accepted = validator.validate(&signed_proof(), "1").await.unwrap();
        assert_eq!(accepted.amount, 50_000);
        assert_eq!(accepted.payer.as_deref(), Some("0xabc"));
        assert_eq!(facilitator.calls(), 1);
    }

    #[tokio::test]
    async fn structurally_invalid_signed_proof_skips_facilitator() {
        let facilitator = MockFacilitator::new(Verdict::Valid);
        let validator = validator(&facilitator, false);
        let proof = PaymentProof::Signed(SignedProof {
            payload: json!({"authorization": {}}),
            signature: serde_json::Value::Null,
        });
        let err = validator.validate(&proof, "1").await.unwrap_err();
        assert!(matches!(err, ProofRejection::MalformedProof));
        assert_eq!(facilitator.calls(), 0);
    }

    #[tokio::test]
    async fn facilitator_rejection_is_terminal_for_the_proof() {
        let facilitator = MockFacilitator::new(Verdict::Invalid("insufficient_funds"));
        let validator = validator(&facilitator, false);
        let err = validator.validate(&signed_proof(), "1").await.unwrap_err();
        match err {
            ProofRejection::FacilitatorRejected { reason } => {
                assert_eq!(reason, "insufficient_funds")
            }
            other => panic!("unexpected rejection: {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_failure_is_distinguished_from_rejection() {
        let facilitator = MockFacilitator::new(Verdict::Unreachable);
        let validator = validator(&facilitator, false);
        let err = validator.validate(&signed_proof(), "1").await.unwrap_err();
        assert!(matches!(err, ProofRejection::FacilitatorUnreachable(_)));
    }

    #[tokio::test]
    async fn unknown_resource_is_rejected_without_facilitator_call() {
        let facilitator = MockFacilitator::new(Verdict::Valid);
        let validator = validator(&facilitator, true);
        let err = validator.validate(&signed_proof(), "404").await.unwrap_err();
        assert!(matches!(err, ProofRejection::UnknownResource(_)));
        assert_eq!(facilitator.calls(), 0);
    }

    #[tokio::test]
    async fn short_hash_is_malformed_before_any_facilitator_call() {
        let facilitator = MockFacilitator::new(Verdict::Valid);
        let validator = validator(&facilitator, true);
        let err = validator
            .validate(&settled_proof("0xdeadbeef"), "1")
            .await
            .unwrap_err();
        assert!(matches!(err, ProofRejection::MalformedProof));
        assert_eq!(facilitator.calls(), 0);
    }

    #[tokio::test]
    async fn missing_prefix_is_malformed_even_at_full_length() {
        let facilitator = MockFacilitator::new(Verdict::Valid);
        let validator = validator(&facilitator, true);
        let err = validator
            .validate(&settled_proof(&"ab".repeat(33)), "1")
            .await
            .unwrap_err();
        assert!(matches!(err, ProofRejection::MalformedProof));
    }

    #[tokio::test]
    async fn demo_mode_accepts_well_formed_settled_proof() {
        let facilitator = MockFacilitator::new(Verdict::Valid);
        let validator = validator(&facilitator, true);
        let tx = format!("0x{}", "ab".repeat(32));
        let accepted = validator.validate(&settled_proof(&tx), "1").await.unwrap();
        assert_eq!(accepted.amount, 50_000);
        assert!(accepted.tx_hash.is_some());
        // Demo tier never consults the facilitator.
        assert_eq!(facilitator.calls(), 0);
    }

    #[tokio::test]
    async fn settled_proofs_are_rejected_outside_demo_mode() {
        let facilitator = MockFacilitator::new(Verdict::Valid);
        let validator = validator(&facilitator, false);
        let tx = format!("0x{}", "ab".repeat(32));
        let err = validator.validate(&settled_proof(&tx), "1").await.unwrap_err();
        assert!(matches!(err, ProofRejection::FacilitatorRejected { .. }));
        assert_eq!(facilitator.calls(), 0);
    }
}
