use axum::{extract::State, http::StatusCode, response::IntoResponse};
use diesel_async::RunQueryDsl;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{app_error::StdResponse, app_state::AppState};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().routes(utoipa_axum::routes!(health))
}

#[derive(Serialize, ToSchema)]
struct HealthRes {
    pub database: bool,
}

/// Liveness probe. Served outside `/api`, so no API key is needed.
#[utoipa::path(
    get,
    path = "/health",
    tags = ["Health"],
    responses(
        (status = 200, description = "Service is up", body = StdResponse<HealthRes>),
        (status = 503, description = "Database unreachable", body = StdResponse<HealthRes>)
    )
)]
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let database = match state.db_pool.get().await {
        Ok(mut conn) => diesel::sql_query("SELECT 1").execute(&mut *conn).await.is_ok(),
        Err(err) => {
            tracing::warn!("Health check could not get a connection: {}", err);
            false
        }
    };

    let mut response = StdResponse::ok(HealthRes { database }, "OK");
    if !database {
        response.status = StatusCode::SERVICE_UNAVAILABLE.as_u16();
        response.message = "Database unreachable".into();
    }
    response
}
