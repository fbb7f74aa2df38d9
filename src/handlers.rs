//! HTTP endpoints for the gated resource server.
//!
//! - `GET /api/articles` - registry listing with prices and clap totals
//! - `GET /api/articles/{id}` - one entry's metadata
//! - `GET /api/articles/{id}/content` - the gated endpoint, wrapped by the
//!   paywall layer; reaching the handler means the gate passed
//! - `POST /api/pay` - settled-transaction verification endpoint
//! - `GET`/`POST /api/articles/{id}/claps` - engagement totals and increments
//! - `GET /api/purchases/{address}` - purchase history for an address
//!
//! Validation and registry failures are turned into typed JSON error
//! responses for the caller; they never abort unrelated requests.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

use crate::facilitator::Facilitator;
use crate::gate::{ChallengeIssuer, Paywall, PaywallLayer};
use crate::ledger::{ClapCounter, Purchase, PurchaseLedger};
use crate::proto::{Address, PaymentProof, SettledProof};
use crate::registry::{ResourceEntry, ResourceRegistry};
use crate::validator::{ProofRejection, ProofValidator};

/// Shared application state.
pub struct AppState<F> {
    pub registry: Arc<ResourceRegistry>,
    pub issuer: Arc<ChallengeIssuer>,
    pub validator: Arc<ProofValidator<F>>,
    pub ledger: Arc<PurchaseLedger>,
    pub claps: Arc<ClapCounter>,
}

impl<F> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            issuer: Arc::clone(&self.issuer),
            validator: Arc::clone(&self.validator),
            ledger: Arc::clone(&self.ledger),
            claps: Arc::clone(&self.claps),
        }
    }
}

/// Builds the full route table, wrapping the content endpoint with the
/// paywall gate.
pub fn routes<F>(state: AppState<F>) -> Router
where
    F: Facilitator + Send + Sync + 'static,
{
    let paywall: PaywallLayer<F> = Paywall::new(
        Arc::clone(&state.registry),
        Arc::clone(&state.issuer),
        Arc::clone(&state.validator),
    )
    .into_layer();

    Router::new()
        .route("/api/articles", get(list_articles::<F>))
        .route("/api/articles/{id}", get(get_article::<F>))
        .route(
            "/api/articles/{id}/content",
            get(article_content::<F>).layer(paywall),
        )
        .route("/api/pay", post(post_pay::<F>))
        .route(
            "/api/articles/{id}/claps",
            get(get_claps::<F>).post(post_clap::<F>),
        )
        .route("/api/purchases/{address}", get(get_purchases::<F>))
        .with_state(state)
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn parse_address(raw: &str) -> Result<Address, Response> {
    raw.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "Invalid address"))
}

fn entry_json<F>(state: &AppState<F>, entry: &ResourceEntry) -> serde_json::Value {
    json!({
        "id": entry.id,
        "description": entry.description,
        "price": entry.price.to_string(),
        "gated": !entry.is_free(),
        "claps": state.claps.total(&entry.id),
    })
}

#[instrument(skip_all)]
async fn list_articles<F>(State(state): State<AppState<F>>) -> impl IntoResponse {
    let articles: Vec<serde_json::Value> = state
        .registry
        .entries()
        .map(|entry| entry_json(&state, entry))
        .collect();
    Json(json!({ "articles": articles }))
}

#[instrument(skip(state))]
async fn get_article<F>(State(state): State<AppState<F>>, Path(id): Path<String>) -> Response {
    match state.registry.lookup(&id) {
        Some(entry) => Json(entry_json(&state, entry)).into_response(),
        None => json_error(StatusCode::NOT_FOUND, "Article not found"),
    }
}

/// The gated endpoint. The paywall layer in front of it has already either
/// passed the request through (free or unregistered resource) or verified a
/// payment, so reaching this handler means access is granted.
#[instrument(skip(state))]
async fn article_content<F>(State(state): State<AppState<F>>, Path(id): Path<String>) -> Response {
    match state.registry.lookup(&id) {
        Some(entry) => Json(json!({
            "success": true,
            "article": entry_json(&state, entry),
        }))
        .into_response(),
        None => json_error(StatusCode::NOT_FOUND, "Article not found"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayRequest {
    article_id: Option<String>,
    tx_hash: Option<String>,
    user_address: Option<String>,
}

/// Verifies a settled-transaction proof and records the grant.
///
/// The ledger is consulted first: a user who already purchased gets the
/// grant again without being re-charged, and replaying an already recorded
/// proof is idempotent.
#[instrument(skip_all)]
async fn post_pay<F>(State(state): State<AppState<F>>, Json(body): Json<PayRequest>) -> Response
where
    F: Facilitator,
{
    let (Some(article_id), Some(tx_hash), Some(user_address)) =
        (body.article_id, body.tx_hash, body.user_address)
    else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "Missing required fields: articleId, txHash, userAddress",
        );
    };
    let payer = match parse_address(&user_address) {
        Ok(address) => address,
        Err(response) => return response,
    };
    let Some(entry) = state.registry.lookup(&article_id) else {
        return json_error(StatusCode::NOT_FOUND, "Article not found");
    };

    let granted = |state: &AppState<F>, entry: &ResourceEntry| {
        Json(json!({
            "success": true,
            "message": "Payment verified successfully",
            "article": entry_json(state, entry),
        }))
        .into_response()
    };

    if state.ledger.has_purchased(&payer, &article_id) {
        return granted(&state, entry);
    }

    let proof = PaymentProof::Settled(SettledProof {
        tx_hash,
        network: state.issuer.terms().network.clone(),
    });
    match state.validator.validate(&proof, &article_id).await {
        Ok(accepted) => {
            let Some(tx_hash) = accepted.tx_hash else {
                // Settled validation always yields a hash; treat anything
                // else as a verification failure.
                return json_error(StatusCode::BAD_REQUEST, "Payment verification failed");
            };
            let purchase = Purchase {
                article_id: entry.id.clone(),
                user_address: payer,
                tx_hash,
                timestamp: chrono::Utc::now(),
                amount: entry.price.to_string(),
            };
            match state.ledger.record(purchase) {
                Ok(newly_recorded) => {
                    tracing::info!(
                        article = %entry.id,
                        tx = %tx_hash,
                        newly_recorded,
                        "purchase granted"
                    );
                    granted(&state, entry)
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to persist purchase");
                    json_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to record purchase",
                    )
                }
            }
        }
        Err(rejection) => rejection_response(rejection),
    }
}

fn rejection_response(rejection: ProofRejection) -> Response {
    match rejection {
        ProofRejection::MalformedProof => {
            json_error(StatusCode::BAD_REQUEST, "Payment verification failed")
        }
        ProofRejection::UnknownResource(_) => {
            json_error(StatusCode::NOT_FOUND, "Article not found")
        }
        ProofRejection::FacilitatorUnreachable(_) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "error": "Payment verification temporarily unavailable",
                "retryable": true,
            })),
        )
            .into_response(),
        ProofRejection::FacilitatorRejected { reason } => (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({ "error": "Payment verification failed", "reason": reason })),
        )
            .into_response(),
    }
}

#[instrument(skip(state, params))]
async fn get_claps<F>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let total = state.claps.total(&id);
    let user_claps = match params.get("address") {
        Some(raw) => match parse_address(raw) {
            Ok(address) => Some(state.claps.user_claps(&id, &address)),
            Err(response) => return response,
        },
        None => None,
    };
    Json(json!({ "total": total, "userClaps": user_claps })).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClapRequest {
    user_address: Option<String>,
}

#[instrument(skip(state, body))]
async fn post_clap<F>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
    Json(body): Json<ClapRequest>,
) -> Response {
    let Some(raw) = body.user_address else {
        return json_error(StatusCode::BAD_REQUEST, "Missing required field: userAddress");
    };
    let address = match parse_address(&raw) {
        Ok(address) => address,
        Err(response) => return response,
    };
    match state.claps.clap(&id, &address) {
        Ok(total) => Json(json!({
            "total": total,
            "userClaps": state.claps.user_claps(&id, &address),
        }))
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to persist claps");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to record clap")
        }
    }
}

#[instrument(skip(state))]
async fn get_purchases<F>(
    State(state): State<AppState<F>>,
    Path(address): Path<String>,
) -> Response {
    let address = match parse_address(&address) {
        Ok(address) => address,
        Err(response) => return response,
    };
    let purchases: Vec<Purchase> = state.ledger.purchases_for(&address);
    Json(json!({ "purchases": purchases })).into_response()
}
