use anyhow::Context;
use axum::{
    extract::{Query, State},
    response::IntoResponse,
};
use chrono::NaiveDate;
use diesel::{ExpressionMethods, PgTextExpressionMethods, QueryDsl, SelectableHelper, pg::Pg};
use diesel_async::RunQueryDsl;
use serde::Deserialize;
use utoipa::IntoParams;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    app_error::{AppError, ErrorResponse, StdResponse},
    app_state::AppState,
    auth::AuthUser,
    enums::{ActorType, ConsultationStatus},
    models::ConsultationStatusLogEntity,
    pagination::{PageMeta, PageParams},
    policy::{self, Action},
    resources::{StatusLogRes, UserRes},
    schema::consultation_status_logs,
    services::{day_after, day_start, like_pattern, users_by_id},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/consultation-status-logs",
        OpenApiRouter::new().routes(utoipa_axum::routes!(get_status_logs)),
    )
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct StatusLogQuery {
    pub consultation_id: Option<i64>,
    pub from_status: Option<ConsultationStatus>,
    pub to_status: Option<ConsultationStatus>,
    pub changed_by_id: Option<i64>,
    pub changed_by_type: Option<ActorType>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    /// Matches the note.
    pub search: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

fn filtered(query: &StatusLogQuery) -> consultation_status_logs::BoxedQuery<'static, Pg> {
    let mut statement = consultation_status_logs::table.into_boxed();
    if let Some(consultation_id) = query.consultation_id {
        statement = statement.filter(consultation_status_logs::consultation_id.eq(consultation_id));
    }
    if let Some(from_status) = query.from_status {
        statement = statement.filter(consultation_status_logs::from_status.eq(from_status));
    }
    if let Some(to_status) = query.to_status {
        statement = statement.filter(consultation_status_logs::to_status.eq(to_status));
    }
    if let Some(changed_by_id) = query.changed_by_id {
        statement = statement.filter(consultation_status_logs::changed_by_id.eq(changed_by_id));
    }
    if let Some(changed_by_type) = query.changed_by_type {
        statement = statement.filter(consultation_status_logs::changed_by_type.eq(changed_by_type));
    }
    if let Some(from) = query.from_date {
        statement = statement.filter(consultation_status_logs::created_at.ge(day_start(from)));
    }
    if let Some(to) = query.to_date {
        statement = statement.filter(consultation_status_logs::created_at.lt(day_after(to)));
    }
    if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
        statement = statement.filter(consultation_status_logs::note.ilike(like_pattern(search)));
    }
    statement
}

/// Status history across consultations, newest first, with the user who made each change.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Consultation Status Logs"],
    security(("bearerAuth" = [])),
    params(StatusLogQuery),
    responses(
        (status = 200, description = "Status logs fetched successfully", body = StdResponse<Vec<StatusLogRes>>),
        (status = 401, description = "Unauthenticated", body = ErrorResponse)
    )
)]
async fn get_status_logs(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<StatusLogQuery>,
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
        .context("Failed to count status logs")?;

    let rows: Vec<ConsultationStatusLogEntity> = filtered(&query)
        .order_by((
            consultation_status_logs::created_at.desc(),
            consultation_status_logs::id.desc(),
        ))
        .limit(page.limit())
        .offset(page.offset())
        .select(ConsultationStatusLogEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get status logs")?;

    let changers = users_by_id(conn, rows.iter().filter_map(|r| r.changed_by_id).collect()).await?;
    let data: Vec<StatusLogRes> = rows
        .into_iter()
        .map(|row| {
            let changer = row
                .changed_by_id
                .and_then(|id| changers.get(&id).cloned())
                .map(|u| UserRes::new(u, &state.storage));
            StatusLogRes::new(row, changer)
        })
        .collect();

    Ok(StdResponse::paginated(
        data,
        PageMeta::new(total, page),
        "Status logs fetched successfully",
    ))
}
