//! Wire types for the HTTP 402 payment flow.
//!
//! This module defines the JSON shapes exchanged between the gate, paying
//! clients, and the facilitator:
//!
//! - [`X402Version1`] - Version marker that serializes as `1`
//! - [`PaymentChallenge`] - Payment terms attached to a 402 response
//! - [`PaymentRequired`] - HTTP 402 response body
//! - [`PaymentProof`] - Either a signed payload or a settled transaction
//! - [`VerifyRequest`] / [`VerifyResponse`] - Facilitator verification messages
//!
//! Challenges are produced fresh per request and never persisted; proofs are
//! parsed from the `X-PAYMENT` request header (signed form) or from the body
//! of the dedicated verification endpoint (settled form).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;

pub use alloy_primitives::{Address, B256 as TxHash};

/// Request header carrying a JSON-encoded signed payment proof.
pub const X_PAYMENT_HEADER: &str = "X-PAYMENT";
/// Response header mirroring the 402 challenge document for header-only clients.
pub const X_PAYMENT_REQUIRED_HEADER: &str = "X-PAYMENT-REQUIRED";
/// Marker header set on requests forwarded past the gate.
pub const X_PAYMENT_VERIFIED_HEADER: &str = "X-PAYMENT-VERIFIED";
/// Charged amount (minor units) set alongside the verified marker.
pub const X_PAYMENT_AMOUNT_HEADER: &str = "X-PAYMENT-AMOUNT";

/// Version marker for x402 protocol version 1.
///
/// Serializes as the integer `1` and rejects any other value on
/// deserialization.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct X402Version1;

impl X402Version1 {
    pub const VALUE: u8 = 1;
}

impl Serialize for X402Version1 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for X402Version1 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let num = u8::deserialize(deserializer)?;
        if num == Self::VALUE {
            Ok(X402Version1)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected version {}, got {}",
                Self::VALUE,
                num
            )))
        }
    }
}

impl Display for X402Version1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Self::VALUE)
    }
}

/// The payment scheme. Only `exact` (pay the stated amount) is supported.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scheme {
    #[serde(rename = "exact")]
    Exact,
}

impl Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Exact => write!(f, "exact"),
        }
    }
}

/// Asset metadata attached to a challenge so clients can render amounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetExtra {
    /// Token symbol, e.g. `USDC`.
    pub name: String,
    /// Token decimal places.
    pub decimals: u32,
}

/// Payment terms for one protected resource, attached to a 402 response.
///
/// `max_amount_required` is the resource price in the asset's minor units,
/// rendered as a decimal string. It equals the configured price at issuance
/// time; issuing twice for the same resource yields identical amounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentChallenge {
    /// The payment scheme (always `exact`).
    pub scheme: Scheme,
    /// The network name, e.g. `base-sepolia`.
    pub network: String,
    /// Price in minor units as a decimal string.
    pub max_amount_required: String,
    /// The protected resource identifier.
    pub resource: String,
    /// Human-readable description of the resource.
    pub description: String,
    /// MIME type of the protected resource.
    pub mime_type: String,
    /// Recipient address for payment.
    pub pay_to: Address,
    /// Advisory validity window in seconds. Not enforced here; enforcement
    /// belongs to proof validation and the settlement layer.
    pub max_timeout_seconds: u64,
    /// Token contract address.
    pub asset: Address,
    /// Asset metadata for display.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<AssetExtra>,
}

/// HTTP 402 response body.
///
/// The same document is mirrored into the `X-PAYMENT-REQUIRED` header so
/// clients that only inspect headers can read the terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    /// Short error token, e.g. `Payment Required`.
    pub error: String,
    /// Human-readable explanation with the price.
    pub message: String,
    /// Protocol version (always 1).
    pub x402_version: X402Version1,
    /// Accepted payment terms.
    pub schemes: Vec<PaymentChallenge>,
}

/// A signed payment authorization, as carried in the `X-PAYMENT` header.
///
/// Both fields are opaque to the gate: cryptographic verification is the
/// facilitator's job. The gate only checks that both are present and
/// non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedProof {
    /// Scheme-specific signed payload.
    pub payload: serde_json::Value,
    /// Signature over the payload.
    pub signature: serde_json::Value,
}

impl SignedProof {
    /// Structural well-formedness: both fields present and non-empty.
    pub fn is_well_formed(&self) -> bool {
        let payload_present = match &self.payload {
            serde_json::Value::Null => false,
            serde_json::Value::String(s) => !s.is_empty(),
            serde_json::Value::Object(map) => !map.is_empty(),
            _ => true,
        };
        let signature_present = match &self.signature {
            serde_json::Value::Null => false,
            serde_json::Value::String(s) => !s.is_empty(),
            _ => true,
        };
        payload_present && signature_present
    }
}

/// A reference to a transfer the client claims to have settled on-chain.
///
/// The hash is kept as the raw string until validation so malformed values
/// are classified instead of failing at the parsing boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettledProof {
    /// Transaction hash, `0x` + 64 hex characters once validated.
    pub tx_hash: String,
    /// Network the transfer was settled on.
    pub network: String,
}

/// A payment proof as presented by a caller.
///
/// The two shapes arrive over different surfaces (header vs verification
/// endpoint body) and are handled exhaustively by the validator.
#[derive(Debug, Clone)]
pub enum PaymentProof {
    /// Signed payload destined for facilitator verification.
    Signed(SignedProof),
    /// Bare transaction-hash reference to an already settled transfer.
    Settled(SettledProof),
}

/// Request to verify a signed payment proof against payment terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    /// Protocol version (always 1).
    pub x402_version: X402Version1,
    /// The signed payment authorization.
    pub payment_payload: SignedProof,
    /// The payment terms to verify against.
    pub payment_requirements: PaymentChallenge,
}

/// Result of facilitator verification of a [`VerifyRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResponse {
    /// The payload matches the requirements and passes all checks.
    Valid {
        /// The paying address as reported by the facilitator.
        payer: Option<String>,
    },
    /// The payload was well-formed but failed verification.
    Invalid {
        /// The reason verification failed.
        reason: String,
        payer: Option<String>,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponseWire {
    is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    payer: Option<String>,
    #[serde(default)]
    invalid_reason: Option<String>,
}

impl Serialize for VerifyResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let wire = match self {
            VerifyResponse::Valid { payer } => VerifyResponseWire {
                is_valid: true,
                payer: payer.clone(),
                invalid_reason: None,
            },
            VerifyResponse::Invalid { reason, payer } => VerifyResponseWire {
                is_valid: false,
                payer: payer.clone(),
                invalid_reason: Some(reason.clone()),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VerifyResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = VerifyResponseWire::deserialize(deserializer)?;
        match wire.is_valid {
            true => Ok(VerifyResponse::Valid { payer: wire.payer }),
            false => {
                let reason = wire
                    .invalid_reason
                    .ok_or_else(|| serde::de::Error::missing_field("invalidReason"))?;
                Ok(VerifyResponse::Invalid {
                    reason,
                    payer: wire.payer,
                })
            }
        }
    }
}
