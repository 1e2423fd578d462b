use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use diesel::{
    BoolExpressionMethods, ExpressionMethods, OptionalExtension, PgTextExpressionMethods,
    QueryDsl, SelectableHelper, pg::Pg,
};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;
use validator::Validate;

use crate::{
    app_error::{AppError, ErrorResponse, StdResponse, ValidJson},
    app_state::AppState,
    auth::AuthUser,
    models::{ArticleEntity, CreateArticleEntity, UpdateArticleEntity},
    pagination::{PageMeta, PageParams},
    policy::{self, Action},
    resources::ArticleRes,
    schema::articles,
    services::{
        articles::{self as article_service, category_exists},
        like_pattern, user_exists,
    },
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/articles",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_articles, create_article))
            .routes(utoipa_axum::routes!(get_article, update_article, delete_article)),
    )
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct ArticleQuery {
    /// Matches title or content.
    pub search: Option<String>,
    pub category_id: Option<i64>,
    pub doctor_id: Option<i64>,
    pub is_published: Option<bool>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

fn filtered(query: &ArticleQuery) -> articles::BoxedQuery<'static, Pg> {
    let mut statement = articles::table.into_boxed();
    if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
        let pattern = like_pattern(search);
        statement = statement.filter(
            articles::title
                .ilike(pattern.clone())
                .or(articles::content.ilike(pattern)),
        );
    }
    if let Some(category_id) = query.category_id {
        statement = statement.filter(articles::category_id.eq(category_id));
    }
    if let Some(doctor_id) = query.doctor_id {
        statement = statement.filter(articles::doctor_id.eq(doctor_id));
    }
    if let Some(is_published) = query.is_published {
        statement = statement.filter(articles::is_published.eq(is_published));
    }
    statement
}

async fn ensure_references(
    conn: &mut AsyncPgConnection,
    doctor_id: Option<i64>,
    category_id: Option<i64>,
) -> Result<(), AppError> {
    if let Some(doctor_id) = doctor_id {
        if !user_exists(conn, doctor_id).await? {
            return Err(AppError::invalid_field(
                "doctor_id",
                "The selected doctor does not exist",
            ));
        }
    }
    if let Some(category_id) = category_id {
        if !category_exists(conn, category_id).await? {
            return Err(AppError::invalid_field(
                "category_id",
                "The selected category does not exist",
            ));
        }
    }
    Ok(())
}

/// List articles, newest first, with author, category, images and comments.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Articles"],
    params(ArticleQuery),
    responses(
        (status = 200, description = "Articles fetched successfully", body = StdResponse<Vec<ArticleRes>>)
    )
)]
async fn get_articles(
    State(state): State<AppState>,
    Query(query): Query<ArticleQuery>,
) -> Result<impl IntoResponse, AppError> {
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
        .context("Failed to count articles")?;

    let rows: Vec<ArticleEntity> = filtered(&query)
        .order_by((articles::created_at.desc(), articles::id.desc()))
        .limit(page.limit())
        .offset(page.offset())
        .select(ArticleEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get articles")?;

    let data = article_service::project(conn, &state.storage, rows).await?;
    Ok(StdResponse::paginated(
        data,
        PageMeta::new(total, page),
        "Articles fetched successfully",
    ))
}

#[utoipa::path(
    get,
    path = "/{id}",
    tags = ["Articles"],
    params(("id" = i64, Path, description = "Article ID")),
    responses(
        (status = 200, description = "Article fetched successfully", body = StdResponse<ArticleRes>),
        (status = 404, description = "Article not found", body = ErrorResponse)
    )
)]
async fn get_article(
    Path(id): Path<i64>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let res = article_service::get(conn, &state.storage, id).await?;
    Ok(StdResponse::ok(res, "Article fetched successfully"))
}

#[derive(Deserialize, Validate, ToSchema)]
struct CreateArticleReq {
    pub doctor_id: Option<i64>,
    pub category_id: i64,
    #[validate(length(min = 1, max = 255))]
    pub title: String,
    pub short_description: Option<String>,
    #[validate(length(min = 1))]
    pub content: String,
    /// Defaults to `true`.
    pub is_published: Option<bool>,
    pub published_at: Option<DateTime<Utc>>,
}

#[utoipa::path(
    post,
    path = "/",
    tags = ["Articles"],
    security(("bearerAuth" = [])),
    request_body = CreateArticleReq,
    responses(
        (status = 201, description = "Article created successfully", body = StdResponse<ArticleRes>),
        (status = 403, description = "Not staff", body = ErrorResponse),
        (status = 422, description = "Validation failed", body = ErrorResponse)
    )
)]
async fn create_article(
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<CreateArticleReq>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::ManageArticles)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    ensure_references(conn, body.doctor_id, Some(body.category_id)).await?;

    let article: ArticleEntity = diesel::insert_into(articles::table)
        .values(CreateArticleEntity {
            doctor_id: body.doctor_id,
            category_id: body.category_id,
            title: body.title,
            short_description: body.short_description,
            content: body.content,
            views_count: 0,
            is_published: body.is_published.unwrap_or(true),
            published_at: body.published_at,
        })
        .returning(ArticleEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to create article")?;
    tracing::info!("Article #{} created by user #{}", article.id, user.id);

    let res = article_service::get(conn, &state.storage, article.id).await?;
    Ok(StdResponse::created(res, "Article created successfully"))
}

#[derive(Deserialize, Validate, ToSchema)]
struct UpdateArticleReq {
    #[serde(default, deserialize_with = "crate::routes::double_option")]
    #[schema(value_type = Option<i64>)]
    pub doctor_id: Option<Option<i64>>,
    pub category_id: Option<i64>,
    #[validate(length(min = 1, max = 255))]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "crate::routes::double_option")]
    #[schema(value_type = Option<String>)]
    pub short_description: Option<Option<String>>,
    #[validate(length(min = 1))]
    pub content: Option<String>,
    pub is_published: Option<bool>,
    #[serde(default, deserialize_with = "crate::routes::double_option")]
    #[schema(value_type = Option<DateTime<Utc>>)]
    pub published_at: Option<Option<DateTime<Utc>>>,
}

impl UpdateArticleReq {
    fn into_changeset(self) -> UpdateArticleEntity {
        UpdateArticleEntity {
            doctor_id: self.doctor_id,
            category_id: self.category_id,
            title: self.title,
            short_description: self.short_description,
            content: self.content,
            is_published: self.is_published,
            published_at: self.published_at,
        }
    }
}

/// Update an article. Omitted fields are left unchanged.
#[utoipa::path(
    put,
    path = "/{id}",
    tags = ["Articles"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Article ID")),
    request_body = UpdateArticleReq,
    responses(
        (status = 200, description = "Article updated successfully", body = StdResponse<ArticleRes>),
        (status = 404, description = "Article not found", body = ErrorResponse)
    )
)]
async fn update_article(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<UpdateArticleReq>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::ManageArticles)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    ensure_references(conn, body.doctor_id.flatten(), body.category_id).await?;

    let changes = body.into_changeset();
    if !changes.is_empty() {
        diesel::update(articles::table.find(id))
            .set(changes)
            .returning(articles::id)
            .get_result::<i64>(conn)
            .await
            .optional()
            .context("Failed to update article")?
            .ok_or(AppError::NotFound("Article"))?;
    }

    let res = article_service::get(conn, &state.storage, id).await?;
    Ok(StdResponse::ok(res, "Article updated successfully"))
}

/// Delete an article with its images and comments.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Articles"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Article ID")),
    responses(
        (status = 200, description = "Article deleted successfully"),
        (status = 404, description = "Article not found", body = ErrorResponse)
    )
)]
async fn delete_article(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::ManageArticles)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let affected = diesel::delete(articles::table.find(id))
        .execute(conn)
        .await
        .context("Failed to delete article")?;
    if affected == 0 {
        return Err(AppError::NotFound("Article"));
    }

    tracing::info!("Article #{} deleted by user #{}", id, user.id);
    Ok(StdResponse::<()>::empty("Article deleted successfully"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_update_keeps_omitted_fields() {
        let req: UpdateArticleReq = serde_json::from_str(r#"{"title":"Sleep hygiene"}"#).unwrap();
        let changes = req.into_changeset();
        assert_eq!(changes.title.as_deref(), Some("Sleep hygiene"));
        assert!(changes.doctor_id.is_none());
        assert!(changes.short_description.is_none());

        let req: UpdateArticleReq =
            serde_json::from_str(r#"{"doctor_id":null,"published_at":null}"#).unwrap();
        let changes = req.into_changeset();
        assert_eq!(changes.doctor_id, Some(None));
        assert_eq!(changes.published_at, Some(None));
        assert!(!changes.is_empty());

        let req: UpdateArticleReq = serde_json::from_str("{}").unwrap();
        assert!(req.into_changeset().is_empty());
    }

    #[test]
    fn title_length_is_checked() {
        let req: CreateArticleReq = serde_json::from_str(&format!(
            r#"{{"category_id":1,"title":"{}","content":"body"}}"#,
            "x".repeat(256)
        ))
        .unwrap();
        assert!(req.validate().unwrap_err().field_errors().contains_key("title"));
    }
}
