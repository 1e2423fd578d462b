use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use diesel::{
    ExpressionMethods, OptionalExtension, PgTextExpressionMethods, QueryDsl, SelectableHelper,
    pg::Pg,
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
    models::{ArticleCategoryEntity, CreateArticleCategoryEntity},
    pagination::{PageMeta, PageParams},
    policy::{self, Action},
    schema::article_categories,
    services::like_pattern,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/article-categories",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_categories, create_category))
            .routes(utoipa_axum::routes!(get_category, update_category, delete_category)),
    )
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct CategoryQuery {
    pub search: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

fn filtered(query: &CategoryQuery) -> article_categories::BoxedQuery<'static, Pg> {
    let mut statement = article_categories::table.into_boxed();
    if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
        statement = statement.filter(article_categories::name.ilike(like_pattern(search)));
    }
    statement
}

async fn ensure_unique_name(
    conn: &mut AsyncPgConnection,
    name: &str,
    except_id: Option<i64>,
) -> Result<(), AppError> {
    let mut statement = article_categories::table
        .filter(article_categories::name.eq(name.to_string()))
        .into_boxed();
    if let Some(id) = except_id {
        statement = statement.filter(article_categories::id.ne(id));
    }
    let taken: i64 = statement
        .count()
        .get_result(conn)
        .await
        .context("Failed to check category name")?;
    if taken > 0 {
        return Err(AppError::invalid_field("name", "The name has already been taken"));
    }
    Ok(())
}

/// List article categories, newest first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Article Categories"],
    params(CategoryQuery),
    responses(
        (status = 200, description = "Categories fetched successfully", body = StdResponse<Vec<ArticleCategoryEntity>>)
    )
)]
async fn get_categories(
    State(state): State<AppState>,
    Query(query): Query<CategoryQuery>,
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
        .context("Failed to count categories")?;

    let categories: Vec<ArticleCategoryEntity> = filtered(&query)
        .order_by((article_categories::created_at.desc(), article_categories::id.desc()))
        .limit(page.limit())
        .offset(page.offset())
        .select(ArticleCategoryEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get categories")?;

    Ok(StdResponse::paginated(
        categories,
        PageMeta::new(total, page),
        "Categories fetched successfully",
    ))
}

#[utoipa::path(
    get,
    path = "/{id}",
    tags = ["Article Categories"],
    params(("id" = i64, Path, description = "Category ID")),
    responses(
        (status = 200, description = "Category fetched successfully", body = StdResponse<ArticleCategoryEntity>),
        (status = 404, description = "Category not found", body = ErrorResponse)
    )
)]
async fn get_category(
    Path(id): Path<i64>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let category: ArticleCategoryEntity = article_categories::table
        .find(id)
        .select(ArticleCategoryEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to load category")?
        .ok_or(AppError::NotFound("Category"))?;

    Ok(StdResponse::ok(category, "Category fetched successfully"))
}

#[derive(Deserialize, Validate, ToSchema)]
struct CategoryReq {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
}

#[utoipa::path(
    post,
    path = "/",
    tags = ["Article Categories"],
    security(("bearerAuth" = [])),
    request_body = CategoryReq,
    responses(
        (status = 201, description = "Category created successfully", body = StdResponse<ArticleCategoryEntity>),
        (status = 403, description = "Not staff", body = ErrorResponse),
        (status = 422, description = "Name missing or taken", body = ErrorResponse)
    )
)]
async fn create_category(
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<CategoryReq>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::ManageArticleCategories)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    ensure_unique_name(conn, &body.name, None).await?;

    let category: ArticleCategoryEntity = diesel::insert_into(article_categories::table)
        .values(CreateArticleCategoryEntity { name: body.name })
        .returning(ArticleCategoryEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to create category")?;

    Ok(StdResponse::created(category, "Category created successfully"))
}

#[utoipa::path(
    put,
    path = "/{id}",
    tags = ["Article Categories"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Category ID")),
    request_body = CategoryReq,
    responses(
        (status = 200, description = "Category updated successfully", body = StdResponse<ArticleCategoryEntity>),
        (status = 404, description = "Category not found", body = ErrorResponse)
    )
)]
async fn update_category(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<CategoryReq>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::ManageArticleCategories)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    ensure_unique_name(conn, &body.name, Some(id)).await?;

    let category: ArticleCategoryEntity = diesel::update(article_categories::table.find(id))
        .set(CreateArticleCategoryEntity { name: body.name })
        .returning(ArticleCategoryEntity::as_returning())
        .get_result(conn)
        .await
        .optional()
        .context("Failed to update category")?
        .ok_or(AppError::NotFound("Category"))?;

    Ok(StdResponse::ok(category, "Category updated successfully"))
}

/// Delete a category. Its articles are deleted with it.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Article Categories"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Category ID")),
    responses(
        (status = 200, description = "Category deleted successfully"),
        (status = 404, description = "Category not found", body = ErrorResponse)
    )
)]
async fn delete_category(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::ManageArticleCategories)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let affected = diesel::delete(article_categories::table.find(id))
        .execute(conn)
        .await
        .context("Failed to delete category")?;
    if affected == 0 {
        return Err(AppError::NotFound("Category"));
    }

    tracing::info!("Category #{} deleted by user #{}", id, user.id);
    Ok(StdResponse::<()>::empty("Category deleted successfully"))
}
