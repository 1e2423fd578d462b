use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use diesel::{
    BoolExpressionMethods, ExpressionMethods, OptionalExtension, PgTextExpressionMethods, QueryDsl,
    SelectableHelper, pg::Pg,
};
use diesel_async::RunQueryDsl;
use serde::Deserialize;
use utoipa::IntoParams;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    app_error::{AppError, ErrorResponse, StdResponse},
    app_state::AppState,
    auth::AuthUser,
    models::ConsultationAttachmentEntity,
    pagination::{PageMeta, PageParams},
    policy::{self, Action},
    resources::AttachmentRes,
    schema::consultation_attachments,
    services::like_pattern,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/consultation-attachments",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_attachments))
            .routes(utoipa_axum::routes!(get_attachment, delete_attachment)),
    )
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct AttachmentQuery {
    pub consultation_id: Option<i64>,
    pub consultation_message_id: Option<i64>,
    pub file_type: Option<String>,
    /// Matches the original or stored file name.
    pub search: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

fn filtered(query: &AttachmentQuery) -> consultation_attachments::BoxedQuery<'static, Pg> {
    let mut statement = consultation_attachments::table.into_boxed();
    if let Some(consultation_id) = query.consultation_id {
        statement = statement.filter(consultation_attachments::consultation_id.eq(consultation_id));
    }
    if let Some(message_id) = query.consultation_message_id {
        statement =
            statement.filter(consultation_attachments::consultation_message_id.eq(message_id));
    }
    if let Some(file_type) = query.file_type.clone() {
        statement = statement.filter(consultation_attachments::file_type.eq(file_type));
    }
    if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
        let pattern = like_pattern(search);
        statement = statement.filter(
            consultation_attachments::original_name
                .ilike(pattern.clone())
                .or(consultation_attachments::file_name.ilike(pattern)),
        );
    }
    statement
}

/// List attachments, newest first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Consultation Attachments"],
    security(("bearerAuth" = [])),
    params(AttachmentQuery),
    responses(
        (status = 200, description = "Attachments fetched successfully", body = StdResponse<Vec<AttachmentRes>>),
        (status = 401, description = "Unauthenticated", body = ErrorResponse)
    )
)]
async fn get_attachments(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<AttachmentQuery>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::UseConsultations)?;
    let page = PageParams::new(query.page, query.per_page);

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let total: i64 = filtered(&query)
        .count()
        .get_result(conn)
        .await
        .context("Failed to count attachments")?;

    let rows: Vec<ConsultationAttachmentEntity> = filtered(&query)
        .order_by((
            consultation_attachments::created_at.desc(),
            consultation_attachments::id.desc(),
        ))
        .limit(page.limit())
        .offset(page.offset())
        .select(ConsultationAttachmentEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get attachments")?;

    let data: Vec<AttachmentRes> = rows
        .into_iter()
        .map(|row| AttachmentRes::new(row, &state.storage))
        .collect();

    Ok(StdResponse::paginated(
        data,
        PageMeta::new(total, page),
        "Attachments fetched successfully",
    ))
}

#[utoipa::path(
    get,
    path = "/{id}",
    tags = ["Consultation Attachments"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Attachment ID")),
    responses(
        (status = 200, description = "Attachment fetched successfully", body = StdResponse<AttachmentRes>),
        (status = 404, description = "Attachment not found", body = ErrorResponse)
    )
)]
async fn get_attachment(
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

    let attachment: ConsultationAttachmentEntity = consultation_attachments::table
        .find(id)
        .select(ConsultationAttachmentEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to load attachment")?
        .ok_or(AppError::NotFound("Attachment"))?;

    Ok(StdResponse::ok(
        AttachmentRes::new(attachment, &state.storage),
        "Attachment fetched successfully",
    ))
}

/// Delete an attachment row and its stored file.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Consultation Attachments"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Attachment ID")),
    responses(
        (status = 200, description = "Attachment deleted successfully"),
        (status = 404, description = "Attachment not found", body = ErrorResponse)
    )
)]
async fn delete_attachment(
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

    let deleted: ConsultationAttachmentEntity =
        diesel::delete(consultation_attachments::table.find(id))
            .returning(ConsultationAttachmentEntity::as_returning())
            .get_result(conn)
            .await
            .optional()
            .context("Failed to delete attachment")?
            .ok_or(AppError::NotFound("Attachment"))?;

    if let Some(path) = deleted.file_path.as_deref() {
        if let Err(err) = state.storage.delete(path).await {
            tracing::warn!("Failed to remove attachment file {}: {:?}", path, err);
        }
    }

    tracing::info!("Attachment #{} deleted by user #{}", id, user.id);
    Ok(StdResponse::<()>::empty("Attachment deleted successfully"))
}
