//! The facilitator capability: external verification of signed payment
//! proofs.
//!
//! The gate never claims cryptographic validity itself; it forwards signed
//! proofs to a facilitator and acts on the answer. From the gate's
//! perspective the facilitator is a black box that can fail independently
//! of payment validity, so implementations distinguish transport failures
//! (facilitator unreachable, retryable) from verification rejections
//! (terminal for the proof).

use std::sync::Arc;

use crate::proto::{VerifyRequest, VerifyResponse};

/// Classification hook for facilitator errors.
///
/// Callers use this to separate "could not reach the facilitator" from
/// every other failure, because the two demand different retry guidance.
pub trait FacilitatorError: std::error::Error {
    /// True when the failure is transport-level: the facilitator never
    /// produced a verdict and the same proof may be retried.
    fn is_unreachable(&self) -> bool;
}

/// Asynchronous interface to a payment-proof facilitator.
pub trait Facilitator {
    /// The error type returned by this facilitator.
    type Error: FacilitatorError + Send + Sync + 'static;

    /// Verifies a signed payment proof against payment terms.
    ///
    /// A clean `Ok(VerifyResponse::Invalid { .. })` means the facilitator
    /// was reached and rejected the proof; `Err` means the exchange itself
    /// failed.
    fn verify(
        &self,
        request: &VerifyRequest,
    ) -> impl Future<Output = Result<VerifyResponse, Self::Error>> + Send;
}

impl<T: Facilitator + Sync> Facilitator for Arc<T> {
    type Error = T::Error;

    fn verify(
        &self,
        request: &VerifyRequest,
    ) -> impl Future<Output = Result<VerifyResponse, Self::Error>> + Send {
        self.as_ref().verify(request)
    }
}
