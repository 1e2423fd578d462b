use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;
use validator::Validate;

use crate::{
    app_error::{AppError, ErrorResponse, StdResponse, ValidJson},
    app_state::AppState,
    auth::AuthUser,
    broadcast::ConsultationEvent,
    enums::{ConsultationStatus, SenderType},
    pagination::PageParams,
    policy::{self, Action},
    resources::{ConsultationRes, MessageRes},
    services::{
        consultations::{self, Actor, ConsultationChanges, ConsultationFilters, NewConsultation},
        messages::{self, MessageFilters, NewAttachment, NewMessage},
    },
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/consultations",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_consultations, create_consultation))
            .routes(utoipa_axum::routes!(
                get_consultation,
                update_consultation,
                delete_consultation
            ))
            .routes(utoipa_axum::routes!(update_consultation_status))
            .routes(utoipa_axum::routes!(send_typing))
            .routes(utoipa_axum::routes!(get_messages, send_message))
            .routes(utoipa_axum::routes!(get_last_message))
            .routes(utoipa_axum::routes!(get_unread_count)),
    )
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct ConsultationQuery {
    pub status: Option<ConsultationStatus>,
    pub patient_id: Option<i64>,
    pub doctor_id: Option<i64>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

/// List consultations, newest first, with their relations.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Consultations"],
    security(("bearerAuth" = [])),
    params(ConsultationQuery),
    responses(
        (status = 200, description = "Consultations fetched successfully", body = StdResponse<Vec<ConsultationRes>>),
        (status = 401, description = "Unauthenticated", body = ErrorResponse)
    )
)]
async fn get_consultations(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ConsultationQuery>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::UseConsultations)?;
    let page = PageParams::new(query.page, query.per_page);
    let filters = ConsultationFilters {
        status: query.status,
        patient_id: query.patient_id,
        doctor_id: query.doctor_id,
    };

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let (data, meta) = consultations::list(conn, &state.storage, &filters, page).await?;
    Ok(StdResponse::paginated(
        data,
        meta,
        "Consultations fetched successfully",
    ))
}

#[derive(Deserialize, Validate, ToSchema)]
struct CreateConsultationReq {
    pub patient_id: i64,
    pub doctor_id: Option<i64>,
    /// Defaults to `open`.
    pub status: Option<ConsultationStatus>,
}

/// Open a consultation and record its initial status.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Consultations"],
    security(("bearerAuth" = [])),
    request_body = CreateConsultationReq,
    responses(
        (status = 201, description = "Consultation created successfully", body = StdResponse<ConsultationRes>),
        (status = 422, description = "Unknown patient or doctor", body = ErrorResponse)
    )
)]
async fn create_consultation(
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<CreateConsultationReq>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::UseConsultations)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let created = consultations::create(
        conn,
        Actor::from_user(Some(&user)),
        NewConsultation {
            patient_id: body.patient_id,
            doctor_id: body.doctor_id,
            status: body.status,
        },
    )
    .await?;

    let res = consultations::get(conn, &state.storage, created.id).await?;
    Ok(StdResponse::created(res, "Consultation created successfully"))
}

/// Fetch one consultation with messages, attachments and status history.
#[utoipa::path(
    get,
    path = "/{id}",
    tags = ["Consultations"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Consultation ID")),
    responses(
        (status = 200, description = "Consultation fetched successfully", body = StdResponse<ConsultationRes>),
        (status = 404, description = "Consultation not found", body = ErrorResponse)
    )
)]
async fn get_consultation(
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

    let res = consultations::get(conn, &state.storage, id).await?;
    Ok(StdResponse::ok(res, "Consultation fetched successfully"))
}

#[derive(Deserialize, Validate, ToSchema)]
struct UpdateConsultationReq {
    /// `null` unassigns the doctor; omit to keep the current one.
    #[serde(default, deserialize_with = "crate::routes::double_option")]
    #[schema(value_type = Option<i64>)]
    pub doctor_id: Option<Option<i64>>,
    pub status: Option<ConsultationStatus>,
    pub note: Option<String>,
}

/// Reassign the doctor and/or change the status.
#[utoipa::path(
    put,
    path = "/{id}",
    tags = ["Consultations"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Consultation ID")),
    request_body = UpdateConsultationReq,
    responses(
        (status = 200, description = "Consultation updated successfully", body = StdResponse<ConsultationRes>),
        (status = 404, description = "Consultation not found", body = ErrorResponse)
    )
)]
async fn update_consultation(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<UpdateConsultationReq>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::UseConsultations)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    consultations::update(
        conn,
        Actor::from_user(Some(&user)),
        id,
        ConsultationChanges {
            doctor_id: body.doctor_id,
            status: body.status,
            note: body.note,
        },
    )
    .await?;

    let res = consultations::get(conn, &state.storage, id).await?;
    Ok(StdResponse::ok(res, "Consultation updated successfully"))
}

#[derive(Deserialize, Validate, ToSchema)]
struct UpdateStatusReq {
    pub status: ConsultationStatus,
    pub note: Option<String>,
}

/// Move a consultation to a new status. Setting the current status again is rejected.
#[utoipa::path(
    patch,
    path = "/{id}/status",
    tags = ["Consultations"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Consultation ID")),
    request_body = UpdateStatusReq,
    responses(
        (status = 200, description = "Consultation status updated successfully", body = StdResponse<ConsultationRes>),
        (status = 404, description = "Consultation not found", body = ErrorResponse),
        (status = 422, description = "Status is already set to the requested value", body = ErrorResponse)
    )
)]
async fn update_consultation_status(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<UpdateStatusReq>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::UseConsultations)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    consultations::update_status(
        conn,
        Actor::from_user(Some(&user)),
        id,
        body.status,
        body.note,
    )
    .await?;

    let res = consultations::get(conn, &state.storage, id).await?;
    Ok(StdResponse::ok(res, "Consultation status updated successfully"))
}

/// Delete a consultation together with its messages, attachments and logs.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Consultations"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Consultation ID")),
    responses(
        (status = 200, description = "Consultation deleted successfully"),
        (status = 404, description = "Consultation not found", body = ErrorResponse)
    )
)]
async fn delete_consultation(
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

    consultations::delete(conn, id).await?;
    Ok(StdResponse::<()>::empty("Consultation deleted successfully"))
}

/// Tell the other participant that the caller is typing. Nothing is stored.
#[utoipa::path(
    post,
    path = "/{id}/typing",
    tags = ["Consultations"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Consultation ID")),
    responses(
        (status = 200, description = "Typing indicator sent"),
        (status = 404, description = "Consultation not found", body = ErrorResponse)
    )
)]
async fn send_typing(
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

    messages::participants(conn, id).await?;
    state
        .broadcaster
        .publish(ConsultationEvent::TypingIndicator {
            consultation_id: id,
            user_id: user.id,
        });
    Ok(StdResponse::<()>::empty("Typing indicator sent"))
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct MessageQuery {
    pub sender_id: Option<i64>,
    pub sender_type: Option<SenderType>,
    /// Inclusive, on the creation date.
    pub from_date: Option<NaiveDate>,
    /// Inclusive, on the creation date.
    pub to_date: Option<NaiveDate>,
    /// Matches message or subject.
    pub search: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

/// List a consultation's messages, oldest first. Deleted messages are hidden.
#[utoipa::path(
    get,
    path = "/{id}/messages",
    tags = ["Consultation Messages"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Consultation ID"), MessageQuery),
    responses(
        (status = 200, description = "Messages fetched successfully", body = StdResponse<Vec<MessageRes>>),
        (status = 404, description = "Consultation not found", body = ErrorResponse)
    )
)]
async fn get_messages(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<MessageQuery>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::UseConsultations)?;
    let page = PageParams::new(query.page, query.per_page);
    let filters = MessageFilters {
        sender_id: query.sender_id,
        sender_type: query.sender_type,
        from_date: query.from_date,
        to_date: query.to_date,
        search: query.search,
    };

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    messages::participants(conn, id).await?;
    let (data, meta) = messages::list(conn, &state.storage, id, &filters, page).await?;
    Ok(StdResponse::paginated(data, meta, "Messages fetched successfully"))
}

#[derive(Deserialize, Validate, ToSchema)]
struct AttachmentReq {
    #[validate(length(min = 1))]
    pub file_name: String,
    #[validate(length(min = 1))]
    pub original_name: String,
    #[validate(length(min = 1, max = 255))]
    pub file_path: String,
    #[validate(length(min = 1, max = 50))]
    pub file_type: String,
}

#[derive(Deserialize, Validate, ToSchema)]
struct SendMessageReq {
    pub sender_id: i64,
    pub sender_type: SenderType,
    #[validate(length(max = 255))]
    pub subject: Option<String>,
    #[validate(length(min = 1))]
    pub message: String,
    /// Files previously stored through the upload endpoints.
    #[serde(default)]
    #[validate(nested)]
    pub attachments: Vec<AttachmentReq>,
}

/// Post a message, optionally with attachments, and notify channel subscribers.
#[utoipa::path(
    post,
    path = "/{id}/messages",
    tags = ["Consultation Messages"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Consultation ID")),
    request_body = SendMessageReq,
    responses(
        (status = 201, description = "Message sent successfully", body = StdResponse<MessageRes>),
        (status = 404, description = "Consultation not found", body = ErrorResponse),
        (status = 422, description = "Validation failed", body = ErrorResponse)
    )
)]
async fn send_message(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<SendMessageReq>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::UseConsultations)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let attachments = body
        .attachments
        .into_iter()
        .map(|a| NewAttachment {
            file_name: a.file_name,
            original_name: a.original_name,
            file_path: a.file_path,
            file_type: a.file_type,
        })
        .collect();

    let res = messages::send(
        conn,
        &state.storage,
        &state.broadcaster,
        NewMessage {
            consultation_id: id,
            sender_id: body.sender_id,
            sender_type: body.sender_type,
            subject: body.subject,
            message: body.message,
            attachments,
        },
    )
    .await?;

    Ok(StdResponse::created(res, "Message sent successfully"))
}

/// Latest non-deleted message of a consultation.
#[utoipa::path(
    get,
    path = "/{id}/messages/last",
    tags = ["Consultation Messages"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Consultation ID")),
    responses(
        (status = 200, description = "Last message fetched successfully", body = StdResponse<MessageRes>),
        (status = 404, description = "No messages", body = ErrorResponse)
    )
)]
async fn get_last_message(
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

    let res = messages::last_message(conn, &state.storage, id).await?;
    Ok(StdResponse::ok(res, "Last message fetched successfully"))
}

#[derive(Serialize, ToSchema)]
struct UnreadCountRes {
    pub consultation_id: i64,
    pub unread_count: i64,
}

/// Messages from the other side that the caller's side has not read.
#[utoipa::path(
    get,
    path = "/{id}/messages/unread-count",
    tags = ["Consultation Messages"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Consultation ID")),
    responses(
        (status = 200, description = "Unread count fetched successfully", body = StdResponse<UnreadCountRes>),
        (status = 403, description = "Not a participant", body = ErrorResponse),
        (status = 404, description = "Consultation not found", body = ErrorResponse)
    )
)]
async fn get_unread_count(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let unread_count = messages::unread_count(conn, id, &user).await?;
    Ok(StdResponse::ok(
        UnreadCountRes {
            consultation_id: id,
            unread_count,
        },
        "Unread count fetched successfully",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doctor_id_distinguishes_null_from_missing() {
        let req: UpdateConsultationReq = serde_json::from_str("{}").unwrap();
        assert_eq!(req.doctor_id, None);
        let req: UpdateConsultationReq = serde_json::from_str(r#"{"doctor_id":null}"#).unwrap();
        assert_eq!(req.doctor_id, Some(None));
        let req: UpdateConsultationReq = serde_json::from_str(r#"{"doctor_id":4}"#).unwrap();
        assert_eq!(req.doctor_id, Some(Some(4)));
    }

    #[test]
    fn status_must_be_known() {
        assert!(serde_json::from_str::<UpdateStatusReq>(r#"{"status":"archived"}"#).is_err());
        let req: UpdateStatusReq =
            serde_json::from_str(r#"{"status":"waiting_response","note":"x"}"#).unwrap();
        assert_eq!(req.status, ConsultationStatus::WaitingResponse);
    }

    #[test]
    fn message_body_validation() {
        let req: SendMessageReq = serde_json::from_str(
            r#"{"sender_id":1,"sender_type":"patient","message":""}"#,
        )
        .unwrap();
        assert!(req.validate().unwrap_err().field_errors().contains_key("message"));

        assert!(
            serde_json::from_str::<SendMessageReq>(
                r#"{"sender_id":1,"sender_type":"admin","message":"hi"}"#
            )
            .is_err()
        );

        let req: SendMessageReq = serde_json::from_str(
            r#"{"sender_id":1,"sender_type":"doctor","message":"hi",
                "attachments":[{"file_name":"a.pdf","original_name":"Scan.pdf","file_path":"","file_type":"pdf"}]}"#,
        )
        .unwrap();
        assert!(req.validate().is_err());
    }
}
