//! Client-side transaction confirmation state machine.
//!
//! A [`PaymentSession`] owns the lifecycle of one value-transfer attempt,
//! from submission to a terminal grant/no-grant decision:
//!
//! ```text
//! Idle -> Submitting -> PendingConfirmation -> Confirmed -----------> Recorded
//!                               |           -> Reverted
//!                               +-----------> StalledAwaitingManualCheck
//!                                                  |-> Confirmed -> Recorded
//!                                                  +-> Reverted
//! ```
//!
//! Confirmation delivery from a chain is at-least-once and sometimes
//! zero-times: watchers miss events, stall, or fail outright. The machine
//! is therefore idempotent at the recording boundary instead of trusting
//! the confirmation signal to arrive exactly once. The guard is a single
//! atomic test-and-set per transaction reference ([`RecordGuard`]), not a
//! check-then-act pair, so an automatic watcher and a manual check racing
//! to `Confirmed` record exactly one purchase.
//!
//! Submission itself is a strategy ([`TransferStrategy`]): a fetch-wrapper
//! retry loop and a direct token transfer are interchangeable
//! implementations in front of the same machine.
//!
//! Cancellation is a local state reset only. A transfer already broadcast
//! may still confirm later; the session keeps the last transaction
//! reference so a manual check after returning to `Idle` still picks the
//! settlement up.

use chrono::Utc;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::ledger::{Purchase, PurchaseLedger};
use crate::proto::{Address, TxHash};
use crate::util::MoneyAmount;

/// Default bound on the push-style confirmation watch.
pub const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(60);
/// Default bound on a manual chain query.
pub const DEFAULT_MANUAL_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle of one transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationState {
    /// No attempt in flight. The only re-entrant state.
    Idle,
    /// Broadcast in progress, waiting on the signer.
    Submitting,
    /// Broadcast succeeded; finality unknown.
    PendingConfirmation { tx_hash: TxHash },
    /// The chain reported inclusion with success.
    Confirmed { tx_hash: TxHash },
    /// The chain reported inclusion with failure. The user may discard the
    /// attempt and resubmit.
    Reverted { tx_hash: TxHash },
    /// The automatic watcher errored or timed out while finality is
    /// unknown. A manual check can resolve this.
    StalledAwaitingManualCheck { tx_hash: TxHash },
    /// The purchase is written. Terminal; further confirmation signals for
    /// this transaction are ignored.
    Recorded { tx_hash: TxHash },
}

/// Broadcast failure, classified so the caller can choose the next action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// The user declined in the wallet. Back to `Idle`; nothing else to do.
    #[error("signer rejected the transfer")]
    SignerRejected,
    /// Terminal until the user funds the account.
    #[error("insufficient funds for transfer")]
    InsufficientFunds,
    /// Any other broadcast failure.
    #[error("broadcast failed: {0}")]
    Broadcast(String),
}

/// Failure of a confirmation watch or manual chain query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("chain query failed: {0}")]
pub struct WatchError(pub String);

/// Outcome of an included transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Success,
    Reverted,
}

/// A transfer to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// The paying address.
    pub from: Address,
    /// The payment recipient.
    pub to: Address,
    /// Token contract to transfer.
    pub asset: Address,
    /// Amount in the asset's minor units.
    pub amount: u128,
    /// The resource being paid for.
    pub resource_id: String,
}

/// The single "submit transfer" capability.
///
/// Different payment-submission styles (a 402-aware fetch wrapper, a direct
/// token transfer through a wallet) implement this trait; the confirmation
/// machine does not care which one broadcast the transfer.
pub trait TransferStrategy {
    fn submit(
        &self,
        transfer: &TransferRequest,
    ) -> impl Future<Output = Result<TxHash, TransferError>> + Send;
}

/// Chain-side confirmation signals.
pub trait ChainWatcher {
    /// Push-style watch: resolves once the chain reports inclusion. May
    /// stall or fail; callers bound it with a timeout.
    fn watch(&self, tx_hash: TxHash) -> impl Future<Output = Result<TxStatus, WatchError>> + Send;

    /// Pull-style direct query, used by the manual fallback.
    fn check(&self, tx_hash: TxHash) -> impl Future<Output = Result<TxStatus, WatchError>> + Send;
}

/// Atomic once-per-transaction recording guard.
///
/// `try_claim` returns `true` exactly once per transaction reference, no
/// matter how many confirmation signals race in.
#[derive(Debug, Default)]
pub struct RecordGuard {
    seen: DashSet<TxHash>,
}

impl RecordGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the transaction for recording. Single atomic test-and-set.
    pub fn try_claim(&self, tx_hash: TxHash) -> bool {
        self.seen.insert(tx_hash)
    }

    /// Releases a claim after a failed ledger write so a later signal can
    /// retry the record.
    pub fn release(&self, tx_hash: TxHash) {
        self.seen.remove(&tx_hash);
    }
}

/// Errors from [`PaymentSession::pay`].
#[derive(Debug, thiserror::Error)]
pub enum PayError {
    /// No signer connected; the user must connect a wallet first.
    #[error("no signer connected")]
    NotConnected,
    /// An attempt is already in flight; only `Idle` accepts a new one.
    #[error("a payment attempt is already in flight")]
    NotIdle,
    /// Broadcast failed; the machine is back at `Idle`.
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Errors from [`PaymentSession::verify_manually`].
#[derive(Debug, thiserror::Error)]
pub enum ManualCheckError {
    /// No transaction reference in scope to check.
    #[error("no transaction to verify")]
    NothingToCheck,
    /// The chain query failed; finality is still unknown. The user may
    /// retry or consult an external explorer.
    #[error("manual verification failed")]
    Failed(#[source] WatchError),
    /// The bounded wait elapsed without an answer.
    #[error("manual verification timed out")]
    TimedOut,
}

/// Drives one payment attempt for one user and one resource.
///
/// Not safe for concurrent manipulation of the same attempt from two
/// callers; the recording guard exists because two *notification sources*
/// may race, not two drivers.
pub struct PaymentSession<S, W> {
    strategy: S,
    watcher: W,
    ledger: Arc<PurchaseLedger>,
    guard: Arc<RecordGuard>,
    /// Connected signer, if any.
    payer: Option<Address>,
    resource_id: String,
    price: MoneyAmount,
    /// Price in minor units; zero short-circuits the whole machine.
    amount: u128,
    pay_to: Address,
    asset: Address,
    state: ConfirmationState,
    /// Last broadcast transaction, kept across cancellation so a manual
    /// check can still pick up a late settlement.
    last_submitted: Option<TxHash>,
    watch_timeout: Duration,
    manual_check_timeout: Duration,
}

impl<S, W> PaymentSession<S, W> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategy: S,
        watcher: W,
        ledger: Arc<PurchaseLedger>,
        guard: Arc<RecordGuard>,
        resource_id: impl Into<String>,
        price: MoneyAmount,
        amount: u128,
        pay_to: Address,
        asset: Address,
    ) -> Self {
        Self {
            strategy,
            watcher,
            ledger,
            guard,
            payer: None,
            resource_id: resource_id.into(),
            price,
            amount,
            pay_to,
            asset,
            state: ConfirmationState::Idle,
            last_submitted: None,
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
            manual_check_timeout: DEFAULT_MANUAL_CHECK_TIMEOUT,
        }
    }

    /// Connects a signer. Required before [`Self::pay`].
    pub fn connect(&mut self, payer: Address) {
        self.payer = Some(payer);
    }

    pub fn disconnect(&mut self) {
        self.payer = None;
    }

    pub fn with_watch_timeout(mut self, watch_timeout: Duration) -> Self {
        self.watch_timeout = watch_timeout;
        self
    }

    pub fn with_manual_check_timeout(mut self, manual_check_timeout: Duration) -> Self {
        self.manual_check_timeout = manual_check_timeout;
        self
    }

    pub fn state(&self) -> &ConfirmationState {
        &self.state
    }

    /// Discards the current attempt and returns to `Idle`.
    ///
    /// This is a local reset, not an on-chain cancellation: a transfer
    /// already broadcast may still confirm, and [`Self::verify_manually`]
    /// after returning here will still find it. `Recorded` is terminal and
    /// is not reset.
    pub fn cancel(&mut self) -> &ConfirmationState {
        match self.state {
            ConfirmationState::PendingConfirmation { .. }
            | ConfirmationState::StalledAwaitingManualCheck { .. }
            | ConfirmationState::Reverted { .. } => {
                self.state = ConfirmationState::Idle;
            }
            _ => {}
        }
        &self.state
    }
}

impl<S, W> PaymentSession<S, W>
where
    S: TransferStrategy,
    W: ChainWatcher,
{
    /// Submits the transfer and drives it toward a terminal state.
    ///
    /// Requires a connected signer and a non-zero price: a free resource
    /// never enters this machine, so `pay` on one is a no-op that stays
    /// `Idle`. Broadcast failure returns the machine to `Idle` with the
    /// classified [`TransferError`].
    pub async fn pay(&mut self) -> Result<&ConfirmationState, PayError> {
        if self.state != ConfirmationState::Idle {
            return Err(PayError::NotIdle);
        }
        if self.amount == 0 {
            return Ok(&self.state);
        }
        let payer = self.payer.ok_or(PayError::NotConnected)?;

        self.state = ConfirmationState::Submitting;
        let transfer = TransferRequest {
            from: payer,
            to: self.pay_to,
            asset: self.asset,
            amount: self.amount,
            resource_id: self.resource_id.clone(),
        };
        let tx_hash = match self.strategy.submit(&transfer).await {
            Ok(tx_hash) => tx_hash,
            Err(err) => {
                tracing::warn!(resource = %self.resource_id, error = %err, "broadcast failed");
                self.state = ConfirmationState::Idle;
                return Err(PayError::Transfer(err));
            }
        };
        tracing::info!(resource = %self.resource_id, tx = %tx_hash, "transfer broadcast");
        self.last_submitted = Some(tx_hash);
        self.state = ConfirmationState::PendingConfirmation { tx_hash };

        match timeout(self.watch_timeout, self.watcher.watch(tx_hash)).await {
            Ok(Ok(TxStatus::Success)) => self.record_confirmed(payer, tx_hash),
            Ok(Ok(TxStatus::Reverted)) => {
                self.state = ConfirmationState::Reverted { tx_hash };
            }
            Ok(Err(err)) => {
                tracing::warn!(tx = %tx_hash, error = %err, "confirmation watcher failed");
                self.state = ConfirmationState::StalledAwaitingManualCheck { tx_hash };
            }
            Err(_elapsed) => {
                tracing::warn!(tx = %tx_hash, "confirmation watch timed out");
                self.state = ConfirmationState::StalledAwaitingManualCheck { tx_hash };
            }
        }
        Ok(&self.state)
    }

    /// Queries chain state directly, bounded by the manual-check timeout.
    ///
    /// The fallback for unreliable push-based confirmation delivery: it
    /// resolves `PendingConfirmation` and `StalledAwaitingManualCheck`,
    /// and after a cancellation it re-checks the last broadcast transfer
    /// from `Idle`. On `Recorded` it is a no-op. A failed or timed-out
    /// query leaves the state unchanged so the user can retry.
    pub async fn verify_manually(&mut self) -> Result<&ConfirmationState, ManualCheckError> {
        let tx_hash = match &self.state {
            ConfirmationState::PendingConfirmation { tx_hash }
            | ConfirmationState::StalledAwaitingManualCheck { tx_hash }
            | ConfirmationState::Confirmed { tx_hash } => *tx_hash,
            ConfirmationState::Recorded { .. } => return Ok(&self.state),
            ConfirmationState::Idle => self
                .last_submitted
                .ok_or(ManualCheckError::NothingToCheck)?,
            ConfirmationState::Submitting | ConfirmationState::Reverted { .. } => {
                return Err(ManualCheckError::NothingToCheck);
            }
        };
        let payer = self.payer.ok_or(ManualCheckError::NothingToCheck)?;

        match timeout(self.manual_check_timeout, self.watcher.check(tx_hash)).await {
            Ok(Ok(TxStatus::Success)) => {
                self.record_confirmed(payer, tx_hash);
                Ok(&self.state)
            }
            Ok(Ok(TxStatus::Reverted)) => {
                self.state = ConfirmationState::Reverted { tx_hash };
                Ok(&self.state)
            }
            Ok(Err(err)) => Err(ManualCheckError::Failed(err)),
            Err(_elapsed) => Err(ManualCheckError::TimedOut),
        }
    }

    /// Takes the `Confirmed` edge and writes the purchase exactly once.
    ///
    /// The guard claim is the atomic gate; a duplicate signal for the same
    /// transaction loses the claim and skips straight to `Recorded`.
    fn record_confirmed(&mut self, payer: Address, tx_hash: TxHash) {
        self.state = ConfirmationState::Confirmed { tx_hash };
        if self.guard.try_claim(tx_hash) {
            let purchase = Purchase {
                article_id: self.resource_id.clone(),
                user_address: payer,
                tx_hash,
                timestamp: Utc::now(),
                amount: self.price.to_string(),
            };
            if let Err(err) = self.ledger.record(purchase) {
                // The write did not land; release the claim and stay at
                // Confirmed so a later signal can retry the record.
                tracing::error!(tx = %tx_hash, error = %err, "purchase record failed");
                self.guard.release(tx_hash);
                return;
            }
        }
        self.state = ConfirmationState::Recorded { tx_hash };
    }
}
