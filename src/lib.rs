//! Pay-per-resource access gate over HTTP 402.
//!
//! `pressgate` turns an ordinary HTTP resource fetch into a priced
//! transaction: a request without payment gets a `402 Payment Required`
//! response carrying machine-readable terms, the client settles the
//! payment on-chain, attaches a proof, and retries. The gate validates
//! the proof, records the grant idempotently, and serves the resource.
//!
//! # Modules
//!
//! - [`registry`] — Static mapping from resource identifier to price and
//!   description. Only registered, priced resources are gated.
//! - [`gate`] — Challenge issuance and the `tower` paywall layer wrapping
//!   protected routes.
//! - [`proto`] — Wire types: challenges, 402 bodies, payment proofs, and
//!   facilitator verification messages.
//! - [`validator`] — Payment-proof validation over both proof shapes, with
//!   facilitator delegation for signed proofs.
//! - [`facilitator`] / [`facilitator_client`] — The external verification
//!   capability and its HTTP client.
//! - [`confirm`] — Client-side transaction confirmation state machine with
//!   an idempotent recording boundary and a manual-verification fallback.
//! - [`ledger`] — Append-only purchase ledger and the bounded engagement
//!   counter.
//! - [`store`] — Injected persistence with explicit open/flush lifecycle.
//! - [`handlers`] — HTTP endpoints of the server binary.
//! - [`config`] — CLI and JSON file configuration.
//!
//! # Trust tiers
//!
//! Signed proofs are delegated to a facilitator for cryptographic
//! verification; the gate never claims validity itself. Settled
//! transaction-hash proofs are checked for shape only and are disabled
//! unless `demo_mode` is configured; see [`validator`] for the taxonomy.

pub mod config;
pub mod confirm;
pub mod facilitator;
pub mod facilitator_client;
pub mod gate;
pub mod handlers;
pub mod ledger;
pub mod proto;
pub mod registry;
pub mod sig_down;
pub mod store;
pub mod telemetry;
pub mod util;
pub mod validator;
