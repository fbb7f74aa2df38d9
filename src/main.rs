//! Gate server HTTP entrypoint.
//!
//! Launches an Axum-based server that gates priced resources behind the
//! HTTP 402 payment flow.
//!
//! Endpoints:
//! - `GET /api/articles` – Resource listing with prices and clap totals
//! - `GET /api/articles/{id}` – One resource's metadata
//! - `GET /api/articles/{id}/content` – Gated content, behind the paywall layer
//! - `POST /api/pay` – Settled-transaction verification endpoint
//! - `GET|POST /api/articles/{id}/claps` – Engagement totals and increments
//! - `GET /api/purchases/{address}` – Purchase history
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG` names the JSON configuration file
//! - `RUST_LOG` controls log filtering

use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use pressgate::config::Config;
use pressgate::facilitator_client::FacilitatorClient;
use pressgate::gate::ChallengeIssuer;
use pressgate::handlers::{self, AppState};
use pressgate::ledger::{ClapCounter, PurchaseLedger};
use pressgate::sig_down::SigDown;
use pressgate::store::{JsonFileStore, MemoryStore, StateStore};
use pressgate::telemetry::Telemetry;
use pressgate::validator::ProofValidator;

/// Initializes the gate server.
///
/// - Loads `.env` variables and configuration.
/// - Opens the state store and replays ledger state.
/// - Starts the Axum server with the paywall layer on gated routes.
/// - Flushes state on graceful shutdown.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Config::load()?;

    let store: Arc<dyn StateStore> = match config.state_file() {
        Some(path) => {
            tracing::info!(path = %path.display(), "opening state file");
            Arc::new(JsonFileStore::open(path)?)
        }
        None => {
            tracing::warn!("no state_file configured, ledger state is in-memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let registry = Arc::new(config.registry()?);
    let issuer = Arc::new(ChallengeIssuer::new(config.payment_terms()));
    let facilitator = FacilitatorClient::try_from(config.facilitator_url().as_str())?
        .with_timeout(Duration::from_secs(10));
    let validator = Arc::new(
        ProofValidator::new(Arc::clone(&registry), Arc::clone(&issuer), facilitator)
            .with_demo_mode(config.demo_mode()),
    );
    if config.demo_mode() {
        tracing::warn!("demo_mode is on: settled-transaction proofs are accepted on shape alone");
    }

    let ledger = Arc::new(PurchaseLedger::open(Arc::clone(&store))?);
    let claps = Arc::new(ClapCounter::open(Arc::clone(&store), config.claps_base())?);

    let app = handlers::routes(AppState {
        registry,
        issuer,
        validator,
        ledger,
        claps,
    })
    .layer(TraceLayer::new_for_http())
    .layer(
        cors::CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(cors::Any),
    );

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let sig_down = SigDown::try_new()?;
    let cancellation_token = sig_down.cancellation_token();
    let graceful_shutdown = async move { cancellation_token.cancelled().await };
    axum::serve(listener, app)
        .with_graceful_shutdown(graceful_shutdown)
        .await?;

    store.flush()?;
    tracing::info!("state flushed, shutting down");

    Ok(())
}
