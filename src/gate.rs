//! The paywall gate: challenge issuance and request interception.
//!
//! The gate wraps protected routes as a `tower` layer. For each request it
//! decides one of three outcomes:
//!
//! - **Pass through unchanged** - the path is not gated, the resource is
//!   unregistered, or its price is zero. Only registered, priced resources
//!   are gated; this is deliberate policy, not an error path.
//! - **402 Payment Required** - no payment proof attached. The response
//!   carries the payment terms both as a JSON body and mirrored in the
//!   `X-PAYMENT-REQUIRED` header, so body-reading and header-only clients
//!   both work.
//! - **Forward with a verified-payment marker** - the attached proof
//!   validated; the request continues to the inner service with
//!   `X-PAYMENT-VERIFIED` and `X-PAYMENT-AMOUNT` set.
//!
//! There is no fail-open path: a request whose proof does not validate is
//! never forwarded.

use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use http::{HeaderValue, StatusCode, header};
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

use crate::facilitator::Facilitator;
use crate::proto::{
    Address, AssetExtra, PaymentChallenge, PaymentProof, PaymentRequired, Scheme, SignedProof,
    X402Version1, X_PAYMENT_AMOUNT_HEADER, X_PAYMENT_HEADER, X_PAYMENT_REQUIRED_HEADER,
    X_PAYMENT_VERIFIED_HEADER,
};
use crate::registry::{ResourceEntry, ResourceRegistry};
use crate::validator::{ProofRejection, ProofValidator};

/// Payment terms shared by every challenge this gate issues.
#[derive(Debug, Clone)]
pub struct PaymentTerms {
    /// Network name, e.g. `base-sepolia`.
    pub network: String,
    /// Token contract address.
    pub asset: Address,
    /// Token symbol for display, e.g. `USDC`.
    pub asset_name: String,
    /// Token decimal places.
    pub asset_decimals: u32,
    /// Recipient of all payments.
    pub pay_to: Address,
    /// Advisory challenge validity window in seconds.
    pub max_timeout_seconds: u64,
}

/// Builds 402 challenges for registered resources.
pub struct ChallengeIssuer {
    terms: PaymentTerms,
}

impl ChallengeIssuer {
    pub fn new(terms: PaymentTerms) -> Self {
        Self { terms }
    }

    pub fn terms(&self) -> &PaymentTerms {
        &self.terms
    }

    /// Builds a fresh challenge for a resource. The amount comes from the
    /// registry entry's precomputed minor units, so repeated issuance for
    /// the same resource always carries the identical amount.
    pub fn issue(&self, entry: &ResourceEntry) -> PaymentChallenge {
        PaymentChallenge {
            scheme: Scheme::Exact,
            network: self.terms.network.clone(),
            max_amount_required: entry.amount.to_string(),
            resource: entry.id.clone(),
            description: entry.description.clone(),
            mime_type: "application/json".to_string(),
            pay_to: self.terms.pay_to,
            max_timeout_seconds: self.terms.max_timeout_seconds,
            asset: self.terms.asset,
            extra: Some(AssetExtra {
                name: self.terms.asset_name.clone(),
                decimals: self.terms.asset_decimals,
            }),
        }
    }

    /// Builds the full 402 response body for a resource.
    pub fn payment_required(&self, entry: &ResourceEntry, error: Option<String>) -> PaymentRequired {
        PaymentRequired {
            error: error.unwrap_or_else(|| "Payment Required".to_string()),
            message: format!(
                "This content requires a payment of ${} {}",
                entry.price, self.terms.asset_name
            ),
            x402_version: X402Version1,
            schemes: vec![self.issue(entry)],
        }
    }
}

/// Maps a request path onto a gated resource identifier.
///
/// A path matches when it is `<prefix>/<id><suffix>` with a single
/// non-empty id segment, e.g. `/api/articles/1/content` with prefix
/// `/api/articles` and suffix `/content`.
#[derive(Debug, Clone)]
pub struct GatedPath {
    prefix: String,
    suffix: String,
}

impl GatedPath {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// Extracts the resource id from a matching path, `None` otherwise.
    pub fn resource_id<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.prefix.as_str())?;
        let rest = rest.strip_suffix(self.suffix.as_str())?;
        let id = rest.strip_prefix('/')?;
        if id.is_empty() || id.contains('/') {
            return None;
        }
        Some(id)
    }
}

impl Default for GatedPath {
    fn default() -> Self {
        Self::new("/api/articles", "/content")
    }
}

/// The paywall gate shared across requests.
pub struct Paywall<F> {
    registry: Arc<ResourceRegistry>,
    issuer: Arc<ChallengeIssuer>,
    validator: Arc<ProofValidator<F>>,
    path: GatedPath,
}

impl<F> Paywall<F> {
    pub fn new(
        registry: Arc<ResourceRegistry>,
        issuer: Arc<ChallengeIssuer>,
        validator: Arc<ProofValidator<F>>,
    ) -> Self {
        Self {
            registry,
            issuer,
            validator,
            path: GatedPath::default(),
        }
    }

    /// Overrides the gated path pattern.
    pub fn with_path(mut self, path: GatedPath) -> Self {
        self.path = path;
        self
    }
}

impl<F> Paywall<F>
where
    F: Facilitator + Send + Sync + 'static,
{
    /// Wraps this gate into a layer for protected routes.
    pub fn into_layer(self) -> PaywallLayer<F> {
        PaywallLayer {
            paywall: Arc::new(self),
        }
    }

    async fn handle(
        self: Arc<Self>,
        mut inner: BoxCloneSyncService<Request, Response, Infallible>,
        mut req: Request,
    ) -> Result<Response, Infallible> {
        let Some(resource_id) = self.path.resource_id(req.uri().path()).map(str::to_owned) else {
            return inner.call(req).await;
        };
        let Some(entry) = self.registry.lookup(&resource_id) else {
            // Unregistered resources are unprotected by policy.
            return inner.call(req).await;
        };
        if entry.is_free() {
            return inner.call(req).await;
        }

        let Some(header_value) = req.headers().get(X_PAYMENT_HEADER) else {
            tracing::debug!(resource = %resource_id, "no payment attached, issuing challenge");
            return Ok(self.challenge_response(entry, None));
        };

        let proof = match parse_signed_proof(header_value.as_bytes()) {
            Some(proof) => PaymentProof::Signed(proof),
            None => {
                return Ok(error_response(
                    StatusCode::BAD_REQUEST,
                    "Invalid payment format",
                ));
            }
        };

        match self.validator.validate(&proof, &resource_id).await {
            Ok(accepted) => {
                let headers = req.headers_mut();
                headers.insert(X_PAYMENT_VERIFIED_HEADER, HeaderValue::from_static("true"));
                if let Ok(amount) = HeaderValue::from_str(&accepted.amount.to_string()) {
                    headers.insert(X_PAYMENT_AMOUNT_HEADER, amount);
                }
                tracing::info!(resource = %resource_id, payer = ?accepted.payer, "payment verified");
                inner.call(req).await
            }
            Err(rejection) => Ok(self.rejection_response(entry, rejection)),
        }
    }

    fn challenge_response(&self, entry: &ResourceEntry, error: Option<String>) -> Response {
        let body = self.issuer.payment_required(entry, error);
        // Header-only clients read the same terms from X-PAYMENT-REQUIRED.
        let challenge_doc = json!({
            "x402Version": X402Version1,
            "schemes": &body.schemes,
        });
        let mut builder = Response::builder()
            .status(StatusCode::PAYMENT_REQUIRED)
            .header(header::CONTENT_TYPE, "application/json");
        if let Ok(value) = HeaderValue::from_str(&challenge_doc.to_string()) {
            builder = builder.header(X_PAYMENT_REQUIRED_HEADER, value);
        }
        let bytes = serde_json::to_vec(&body).expect("payment required body serializes");
        builder
            .body(Body::from(bytes))
            .expect("response construction cannot fail")
    }

    fn rejection_response(&self, entry: &ResourceEntry, rejection: ProofRejection) -> Response {
        match rejection {
            ProofRejection::MalformedProof | ProofRejection::UnknownResource(_) => {
                error_response(StatusCode::BAD_REQUEST, "Invalid payment format")
            }
            ProofRejection::FacilitatorUnreachable(_) => Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({
                        "error": "Payment verification temporarily unavailable",
                        "retryable": true,
                    })
                    .to_string(),
                ))
                .expect("response construction cannot fail"),
            ProofRejection::FacilitatorRejected { reason } => {
                self.challenge_response(entry, Some(reason))
            }
        }
    }
}

fn parse_signed_proof(header_bytes: &[u8]) -> Option<SignedProof> {
    serde_json::from_slice(header_bytes).ok()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "error": message }).to_string()))
        .expect("response construction cannot fail")
}

/// Layer that applies the paywall gate to a route.
pub struct PaywallLayer<F> {
    paywall: Arc<Paywall<F>>,
}

impl<F> Clone for PaywallLayer<F> {
    fn clone(&self) -> Self {
        Self {
            paywall: Arc::clone(&self.paywall),
        }
    }
}

impl<S, F> Layer<S> for PaywallLayer<F>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    F: Facilitator + Send + Sync + 'static,
{
    type Service = PaywallService<F>;

    fn layer(&self, inner: S) -> Self::Service {
        PaywallService {
            paywall: Arc::clone(&self.paywall),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// Service that enforces the paywall on incoming requests.
pub struct PaywallService<F> {
    paywall: Arc<Paywall<F>>,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl<F> Clone for PaywallService<F> {
    fn clone(&self) -> Self {
        Self {
            paywall: Arc::clone(&self.paywall),
            inner: self.inner.clone(),
        }
    }
}

impl<F> Service<Request> for PaywallService<F>
where
    F: Facilitator + Send + Sync + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let paywall = Arc::clone(&self.paywall);
        let inner = self.inner.clone();
        Box::pin(paywall.handle(inner, req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facilitator::FacilitatorError;
    use crate::proto::{VerifyRequest, VerifyResponse};
    use crate::util::MoneyAmount;
    use axum::Router;
    use axum::routing::get;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[derive(Debug, thiserror::Error)]
    #[error("mock transport failure")]
    struct MockUnreachable;

    impl FacilitatorError for MockUnreachable {
        fn is_unreachable(&self) -> bool {
            true
        }
    }

    #[derive(Clone, Copy)]
    enum Verdict {
        Valid,
        Invalid,
        Unreachable,
    }

    #[derive(Clone, Copy)]
    struct MockFacilitator(Verdict);

    impl Facilitator for MockFacilitator {
        type Error = MockUnreachable;

        async fn verify(&self, _request: &VerifyRequest) -> Result<VerifyResponse, MockUnreachable> {
            match self.0 {
                Verdict::Valid => Ok(VerifyResponse::Valid { payer: None }),
                Verdict::Invalid => Ok(VerifyResponse::Invalid {
                    reason: "signature mismatch".to_string(),
                    payer: None,
                }),
                Verdict::Unreachable => Err(MockUnreachable),
            }
        }
    }

    fn terms() -> PaymentTerms {
        PaymentTerms {
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
        }
    }

    fn app(verdict: Verdict) -> Router {
        let registry = Arc::new(
            ResourceRegistry::build(
                vec![
                    (
                        "1".to_string(),
                        MoneyAmount::parse("0.05").unwrap(),
                        "Premium article".to_string(),
                        0,
                    ),
                    (
                        "3".to_string(),
                        MoneyAmount::parse("0").unwrap(),
                        "Free article".to_string(),
                        0,
                    ),
                ],
                6,
            )
            .unwrap(),
        );
        let issuer = Arc::new(ChallengeIssuer::new(terms()));
        let validator = Arc::new(ProofValidator::new(
            Arc::clone(&registry),
            Arc::clone(&issuer),
            MockFacilitator(verdict),
        ));
        let paywall = Paywall::new(registry, issuer, validator);

        Router::new().route(
            "/api/articles/{id}/content",
            get(|req: Request| async move {
                let verified = req
                    .headers()
                    .get(X_PAYMENT_VERIFIED_HEADER)
                    .is_some();
                axum::Json(json!({ "success": true, "verified": verified }))
            })
            .layer(paywall.into_layer()),
        )
    }

    fn get_request(path: &str) -> Request {
        Request::builder()
            .uri(path)
            .body(Body::empty())
            .expect("request builds")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_payment_yields_402_with_terms_in_body_and_header() {
        let response = app(Verdict::Valid)
            .oneshot(get_request("/api/articles/1/content"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let mirrored: serde_json::Value = serde_json::from_slice(
            response
                .headers()
                .get(X_PAYMENT_REQUIRED_HEADER)
                .unwrap()
                .as_bytes(),
        )
        .unwrap();
        assert_eq!(mirrored["x402Version"], 1);

        let body = body_json(response).await;
        assert_eq!(body["x402Version"], 1);
        assert_eq!(body["schemes"][0]["scheme"], "exact");
        assert_eq!(body["schemes"][0]["maxAmountRequired"], "50000");
        assert_eq!(body["schemes"][0]["resource"], "1");
    }

    #[tokio::test]
    async fn challenge_amount_is_stable_across_issuances() {
        let app = app(Verdict::Valid);
        let first = body_json(
            app.clone()
                .oneshot(get_request("/api/articles/1/content"))
                .await
                .unwrap(),
        )
        .await;
        let second = body_json(
            app.oneshot(get_request("/api/articles/1/content"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(
            first["schemes"][0]["maxAmountRequired"],
            second["schemes"][0]["maxAmountRequired"]
        );
    }

    #[tokio::test]
    async fn free_resource_passes_through_without_402() {
        let response = app(Verdict::Valid)
            .oneshot(get_request("/api/articles/3/content"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["verified"], false);
    }

    #[tokio::test]
    async fn unregistered_resource_passes_through_without_402() {
        let response = app(Verdict::Valid)
            .oneshot(get_request("/api/articles/9/content"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn valid_payment_forwards_with_verified_marker() {
        let request = Request::builder()
            .uri("/api/articles/1/content")
            .header(
                X_PAYMENT_HEADER,
                json!({"payload": {"authorization": {}}, "signature": "0xsig"}).to_string(),
            )
            .body(Body::empty())
            .unwrap();
        let response = app(Verdict::Valid).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["verified"], true);
    }

    #[tokio::test]
    async fn malformed_payment_header_is_bad_request() {
        let request = Request::builder()
            .uri("/api/articles/1/content")
            .header(X_PAYMENT_HEADER, "not json")
            .body(Body::empty())
            .unwrap();
        let response = app(Verdict::Valid).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejected_payment_gets_a_fresh_challenge_not_content() {
        let request = Request::builder()
            .uri("/api/articles/1/content")
            .header(
                X_PAYMENT_HEADER,
                json!({"payload": {"authorization": {}}, "signature": "0xsig"}).to_string(),
            )
            .body(Body::empty())
            .unwrap();
        let response = app(Verdict::Invalid).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body = body_json(response).await;
        assert_eq!(body["error"], "signature mismatch");
        assert_eq!(body["schemes"][0]["maxAmountRequired"], "50000");
    }

    #[tokio::test]
    async fn unreachable_facilitator_is_retryable_not_payment_required() {
        let request = Request::builder()
            .uri("/api/articles/1/content")
            .header(
                X_PAYMENT_HEADER,
                json!({"payload": {"authorization": {}}, "signature": "0xsig"}).to_string(),
            )
            .body(Body::empty())
            .unwrap();
        let response = app(Verdict::Unreachable).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["retryable"], true);
    }

    #[test]
    fn gated_path_extracts_single_segment_ids() {
        let path = GatedPath::default();
        assert_eq!(path.resource_id("/api/articles/1/content"), Some("1"));
        assert_eq!(path.resource_id("/api/articles/abc/content"), Some("abc"));
        assert_eq!(path.resource_id("/api/articles/1"), None);
        assert_eq!(path.resource_id("/api/articles//content"), None);
        assert_eq!(path.resource_id("/api/articles/a/b/content"), None);
        assert_eq!(path.resource_id("/other"), None);
    }
}
