//! Process wiring: logging, environment, the HTTP router and the server loop.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{Router, middleware};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::{
    Modify,
    openapi::{
        InfoBuilder, OpenApi,
        security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_axum::router::OpenApiRouter;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    app_state::AppState,
    config::ServerConfig,
    middleware::{log_errors, require_api_key},
    routes,
};

pub const SERVICE_NAME: &str = "ConsultationService";

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Loads `.env` when present. Deployed containers get their variables directly.
pub fn init_env() {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            eprintln!("Failed to load .env: {err}");
        }
    }
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearerAuth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
        components.add_security_scheme(
            "apiKey",
            SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-API-KEY"))),
        );
    }
}

/// The full application: `/api` behind the API key, health, storage files and Swagger UI.
pub fn build_router(state: AppState) -> Router {
    let api = routes::api_routes().route_layer(middleware::from_fn_with_state(
        state.clone(),
        require_api_key,
    ));

    let (router, mut openapi) = OpenApiRouter::new()
        .nest("/api", api)
        .merge(routes::health::routes_with_openapi())
        .split_for_parts();

    openapi.info = InfoBuilder::new()
        .title("MedBook ConsultationService API")
        .version(env!("CARGO_PKG_VERSION"))
        .build();
    SecurityAddon.modify(&mut openapi);

    let storage_root = state.config.storage.root.clone();

    router
        .nest_service("/storage", ServeDir::new(storage_root))
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi))
        .layer(middleware::from_fn(log_errors))
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
    }
    tracing::info!("Shutting down...");
}

pub async fn serve(config: &ServerConfig, router: Router) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid server address {}:{}", config.host, config.port))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("{} listening on {}", SERVICE_NAME, addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")
}
