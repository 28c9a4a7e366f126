//! inkfed - ActivityPub federation core for a multi-tenant blogging server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actor, inbox, collections)        │
//! │  - WebFinger, host-meta, NodeInfo                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Blog lookup and collection documents                     │
//! │  - Post fan-out                                             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Keys, signatures, inbox, resolver, delivery              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for ActivityPub and discovery
//! - `service`: Business logic layer
//! - `federation`: ActivityPub federation handling
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

use federation::{HttpRemoteClient, InboxProcessor, KeyStore, RemoteClient, Resolver};

/// Largest inbound request body accepted (1 MiB)
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like the database pool and the federation engine.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Blog lookup, collection documents and outbound fan-out
    pub federation: Arc<service::FederationService>,

    /// Inbound activity processing
    pub inbox: Arc<InboxProcessor>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the outbound HTTP client
    /// 3. Wire up the federation engine
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        let client: Arc<dyn RemoteClient> = Arc::new(HttpRemoteClient::new(&config)?);
        Self::with_client(config, client).await
    }

    /// Initialize application state around a given remote client.
    pub async fn with_client(
        config: config::AppConfig,
        client: Arc<dyn RemoteClient>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!(path = %config.database.path.display(), "Database connected");

        let config = Arc::new(config);
        let keys = Arc::new(KeyStore::new(db.clone(), config.federation.key_bits));
        let resolver = Arc::new(Resolver::new(
            db.clone(),
            keys.clone(),
            client.clone(),
            &config,
        ));

        let federation = Arc::new(service::FederationService::new(
            config.clone(),
            db.clone(),
            keys.clone(),
            client.clone(),
            resolver.clone(),
        ));
        federation.ensure_instance_key().await?;
        tracing::info!("Instance actor key ready");

        let inbox = Arc::new(InboxProcessor::new(
            config.clone(),
            db.clone(),
            keys,
            client,
            resolver,
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config,
            db,
            federation,
            inbox,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
