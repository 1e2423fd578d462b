use anyhow::Context;
use axum::{
    extract::{Path, State},
    response::IntoResponse,
};
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use validator::Validate;

use crate::{
    app_error::{AppError, ErrorResponse, StdResponse, ValidJson},
    app_state::AppState,
    auth::AuthUser,
    enums::SenderType,
    policy::{self, Action},
    resources::MessageRes,
    services::messages,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/consultation-messages",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_message, update_message, delete_message))
            .routes(utoipa_axum::routes!(mark_read_by_patient))
            .routes(utoipa_axum::routes!(mark_read_by_doctor)),
    )
}

#[utoipa::path(
    get,
    path = "/{id}",
    tags = ["Consultation Messages"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Message ID")),
    responses(
        (status = 200, description = "Message fetched successfully", body = StdResponse<MessageRes>),
        (status = 404, description = "Message not found", body = ErrorResponse)
    )
)]
async fn get_message(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::UseConsultations)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let res = messages::get(conn, &state.storage, id).await?;
    Ok(StdResponse::ok(res, "Message fetched successfully"))
}

#[derive(Deserialize, Validate, ToSchema)]
struct UpdateMessageReq {
    #[validate(length(max = 255))]
    pub subject: Option<String>,
    #[validate(length(min = 1))]
    pub message: String,
}

/// Edit a message's subject and text.
#[utoipa::path(
    put,
    path = "/{id}",
    tags = ["Consultation Messages"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Message ID")),
    request_body = UpdateMessageReq,
    responses(
        (status = 200, description = "Message updated successfully", body = StdResponse<MessageRes>),
        (status = 404, description = "Message not found", body = ErrorResponse)
    )
)]
async fn update_message(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<UpdateMessageReq>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::UseConsultations)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let res = messages::update(conn, &state.storage, id, body.subject, body.message).await?;
    Ok(StdResponse::ok(res, "Message updated successfully"))
}

/// Soft-delete a message.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Consultation Messages"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Message ID")),
    responses(
        (status = 200, description = "Message deleted successfully"),
        (status = 404, description = "Message not found", body = ErrorResponse)
    )
)]
async fn delete_message(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::UseConsultations)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    messages::soft_delete(conn, id).await?;
    tracing::info!("Message #{} deleted by user #{}", id, user.id);
    Ok(StdResponse::<()>::empty("Message deleted successfully"))
}

async fn mark_read(
    state: AppState,
    user: AuthUser,
    id: i64,
    reader: SenderType,
) -> Result<MessageRes, AppError> {
    policy::authorize(&user, Action::UseConsultations)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    messages::mark_read(conn, &state.storage, &state.broadcaster, id, reader).await
}

#[utoipa::path(
    patch,
    path = "/{id}/read-by-patient",
    tags = ["Consultation Messages"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Message ID")),
    responses(
        (status = 200, description = "Message marked as read by patient", body = StdResponse<MessageRes>),
        (status = 404, description = "Message not found", body = ErrorResponse)
    )
)]
async fn mark_read_by_patient(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let res = mark_read(state, user, id, SenderType::Patient).await?;
    Ok(StdResponse::ok(res, "Message marked as read by patient"))
}

#[utoipa::path(
    patch,
    path = "/{id}/read-by-doctor",
    tags = ["Consultation Messages"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Message ID")),
    responses(
        (status = 200, description = "Message marked as read by doctor", body = StdResponse<MessageRes>),
        (status = 404, description = "Message not found", body = ErrorResponse)
    )
)]
async fn mark_read_by_doctor(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let res = mark_read(state, user, id, SenderType::Doctor).await?;
    Ok(StdResponse::ok(res, "Message marked as read by doctor"))
}
