use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper, pg::Pg};
use diesel_async::RunQueryDsl;
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;
use validator::Validate;

use crate::{
    app_error::{AppError, ErrorResponse, StdResponse, ValidJson},
    app_state::AppState,
    auth::AuthUser,
    models::{ArticleImageEntity, CreateArticleImageEntity, UpdateArticleImageEntity},
    pagination::{PageMeta, PageParams},
    policy::{self, Action},
    resources::ArticleImageRes,
    schema::article_images,
    services::articles::article_exists,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/article-images",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_images, create_image))
            .routes(utoipa_axum::routes!(get_image, update_image, delete_image)),
    )
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct ImageQuery {
    pub article_id: Option<i64>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

fn filtered(query: &ImageQuery) -> article_images::BoxedQuery<'static, Pg> {
    let mut statement = article_images::table.into_boxed();
    if let Some(article_id) = query.article_id {
        statement = statement.filter(article_images::article_id.eq(article_id));
    }
    statement
}

#[utoipa::path(
    get,
    path = "/",
    tags = ["Article Images"],
    params(ImageQuery),
    responses(
        (status = 200, description = "Images fetched successfully", body = StdResponse<Vec<ArticleImageRes>>)
    )
)]
async fn get_images(
    State(state): State<AppState>,
    Query(query): Query<ImageQuery>,
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
        .context("Failed to count images")?;

    let rows: Vec<ArticleImageEntity> = filtered(&query)
        .order_by((article_images::created_at.desc(), article_images::id.desc()))
        .limit(page.limit())
        .offset(page.offset())
        .select(ArticleImageEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get images")?;

    let data = rows
        .into_iter()
        .map(|image| ArticleImageRes::new(image, &state.storage))
        .collect::<Vec<_>>();
    Ok(StdResponse::paginated(
        data,
        PageMeta::new(total, page),
        "Images fetched successfully",
    ))
}

#[utoipa::path(
    get,
    path = "/{id}",
    tags = ["Article Images"],
    params(("id" = i64, Path, description = "Image ID")),
    responses(
        (status = 200, description = "Image fetched successfully", body = StdResponse<ArticleImageRes>),
        (status = 404, description = "Image not found", body = ErrorResponse)
    )
)]
async fn get_image(
    Path(id): Path<i64>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let image: ArticleImageEntity = article_images::table
        .find(id)
        .select(ArticleImageEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to load image")?
        .ok_or(AppError::NotFound("Image"))?;

    Ok(StdResponse::ok(
        ArticleImageRes::new(image, &state.storage),
        "Image fetched successfully",
    ))
}

/// Registers a file previously stored through `/uploads` against an article.
#[derive(Deserialize, Validate, ToSchema)]
struct CreateImageReq {
    pub article_id: i64,
    #[validate(length(min = 1, max = 255))]
    pub image_name: String,
    #[validate(length(min = 1, max = 255))]
    pub folder: String,
    #[serde(default)]
    pub is_cover: bool,
    pub caption: Option<String>,
}

#[utoipa::path(
    post,
    path = "/",
    tags = ["Article Images"],
    security(("bearerAuth" = [])),
    request_body = CreateImageReq,
    responses(
        (status = 201, description = "Image created successfully", body = StdResponse<ArticleImageRes>),
        (status = 403, description = "Not staff", body = ErrorResponse),
        (status = 422, description = "Validation failed", body = ErrorResponse)
    )
)]
async fn create_image(
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<CreateImageReq>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::ManageArticleImages)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    if !article_exists(conn, body.article_id).await? {
        return Err(AppError::invalid_field(
            "article_id",
            "The selected article does not exist",
        ));
    }

    let image: ArticleImageEntity = diesel::insert_into(article_images::table)
        .values(CreateArticleImageEntity {
            article_id: body.article_id,
            image_name: body.image_name,
            folder: body.folder,
            is_cover: body.is_cover,
            caption: body.caption,
        })
        .returning(ArticleImageEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to create image")?;

    Ok(StdResponse::created(
        ArticleImageRes::new(image, &state.storage),
        "Image created successfully",
    ))
}

#[derive(Deserialize, Validate, ToSchema)]
struct UpdateImageReq {
    pub article_id: Option<i64>,
    #[validate(length(min = 1, max = 255))]
    pub image_name: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub folder: Option<String>,
    pub is_cover: Option<bool>,
    #[serde(default, deserialize_with = "crate::routes::double_option")]
    #[schema(value_type = Option<String>)]
    pub caption: Option<Option<String>>,
}

#[utoipa::path(
    put,
    path = "/{id}",
    tags = ["Article Images"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Image ID")),
    request_body = UpdateImageReq,
    responses(
        (status = 200, description = "Image updated successfully", body = StdResponse<ArticleImageRes>),
        (status = 404, description = "Image not found", body = ErrorResponse)
    )
)]
async fn update_image(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<UpdateImageReq>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::ManageArticleImages)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    if let Some(article_id) = body.article_id {
        if !article_exists(conn, article_id).await? {
            return Err(AppError::invalid_field(
                "article_id",
                "The selected article does not exist",
            ));
        }
    }

    let changes = UpdateArticleImageEntity {
        article_id: body.article_id,
        image_name: body.image_name,
        folder: body.folder,
        is_cover: body.is_cover,
        caption: body.caption,
    };

    let image: ArticleImageEntity = if changes.is_empty() {
        article_images::table
            .find(id)
            .select(ArticleImageEntity::as_select())
            .first(conn)
            .await
            .optional()
            .context("Failed to load image")?
    } else {
        diesel::update(article_images::table.find(id))
            .set(changes)
            .returning(ArticleImageEntity::as_returning())
            .get_result(conn)
            .await
            .optional()
            .context("Failed to update image")?
    }
    .ok_or(AppError::NotFound("Image"))?;

    Ok(StdResponse::ok(
        ArticleImageRes::new(image, &state.storage),
        "Image updated successfully",
    ))
}

/// Delete an image record. The stored file is left in place.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Article Images"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Image ID")),
    responses(
        (status = 200, description = "Image deleted successfully"),
        (status = 404, description = "Image not found", body = ErrorResponse)
    )
)]
async fn delete_image(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::ManageArticleImages)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let affected = diesel::delete(article_images::table.find(id))
        .execute(conn)
        .await
        .context("Failed to delete image")?;
    if affected == 0 {
        return Err(AppError::NotFound("Image"));
    }

    Ok(StdResponse::<()>::empty("Image deleted successfully"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cover_flag_defaults_to_false() {
        let req: CreateImageReq = serde_json::from_str(
            r#"{"article_id":1,"image_name":"a.jpg","folder":"articles"}"#,
        )
        .unwrap();
        assert!(!req.is_cover);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn caption_can_be_cleared() {
        let req: UpdateImageReq = serde_json::from_str(r#"{"caption":null}"#).unwrap();
        assert_eq!(req.caption, Some(None));

        let req: UpdateImageReq = serde_json::from_str(r#"{"is_cover":true}"#).unwrap();
        assert_eq!(req.caption, None);
    }
}
