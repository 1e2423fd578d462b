use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper, pg::Pg};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;
use validator::Validate;

use crate::{
    app_error::{AppError, ErrorResponse, StdResponse, ValidJson},
    app_state::AppState,
    auth::AuthUser,
    models::{ArticleCommentEntity, CreateArticleCommentEntity},
    pagination::{PageMeta, PageParams},
    policy::{self, Action},
    resources::CommentRes,
    schema::article_comments,
    services::articles::{article_exists, comment_tree},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/article-comments",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_comments, create_comment))
            .routes(utoipa_axum::routes!(get_comment, update_comment, delete_comment)),
    )
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct CommentQuery {
    pub article_id: Option<i64>,
    /// Replies to this comment. Top-level comments are listed when omitted.
    pub parent_id: Option<i64>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

fn filtered(query: &CommentQuery) -> article_comments::BoxedQuery<'static, Pg> {
    let mut statement = article_comments::table.into_boxed();
    if let Some(article_id) = query.article_id {
        statement = statement.filter(article_comments::article_id.eq(article_id));
    }
    statement = match query.parent_id {
        Some(parent_id) => statement.filter(article_comments::parent_id.eq(parent_id)),
        None => statement.filter(article_comments::parent_id.is_null()),
    };
    statement
}

async fn find_comment(
    conn: &mut AsyncPgConnection,
    id: i64,
) -> Result<ArticleCommentEntity, AppError> {
    article_comments::table
        .find(id)
        .select(ArticleCommentEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to load comment")?
        .ok_or(AppError::NotFound("Comment"))
}

async fn project_one(
    conn: &mut AsyncPgConnection,
    comment: ArticleCommentEntity,
) -> Result<CommentRes, AppError> {
    comment_tree(conn, vec![comment])
        .await?
        .pop()
        .ok_or(AppError::NotFound("Comment"))
}

/// List comments oldest first, each with its author and direct replies.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Article Comments"],
    params(CommentQuery),
    responses(
        (status = 200, description = "Comments fetched successfully", body = StdResponse<Vec<CommentRes>>)
    )
)]
async fn get_comments(
    State(state): State<AppState>,
    Query(query): Query<CommentQuery>,
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
        .context("Failed to count comments")?;

    let rows: Vec<ArticleCommentEntity> = filtered(&query)
        .order_by((article_comments::created_at.asc(), article_comments::id.asc()))
        .limit(page.limit())
        .offset(page.offset())
        .select(ArticleCommentEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get comments")?;

    let data = comment_tree(conn, rows).await?;
    Ok(StdResponse::paginated(
        data,
        PageMeta::new(total, page),
        "Comments fetched successfully",
    ))
}

#[utoipa::path(
    get,
    path = "/{id}",
    tags = ["Article Comments"],
    params(("id" = i64, Path, description = "Comment ID")),
    responses(
        (status = 200, description = "Comment fetched successfully", body = StdResponse<CommentRes>),
        (status = 404, description = "Comment not found", body = ErrorResponse)
    )
)]
async fn get_comment(
    Path(id): Path<i64>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let comment = find_comment(conn, id).await?;
    let res = project_one(conn, comment).await?;
    Ok(StdResponse::ok(res, "Comment fetched successfully"))
}

#[derive(Deserialize, Validate, ToSchema)]
struct CreateCommentReq {
    pub article_id: i64,
    pub parent_id: Option<i64>,
    #[validate(length(min = 1))]
    pub content: String,
}

/// Comment on an article as the authenticated user.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Article Comments"],
    security(("bearerAuth" = [])),
    request_body = CreateCommentReq,
    responses(
        (status = 201, description = "Comment created successfully", body = StdResponse<CommentRes>),
        (status = 401, description = "Not authenticated", body = ErrorResponse),
        (status = 422, description = "Validation failed", body = ErrorResponse)
    )
)]
async fn create_comment(
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<CreateCommentReq>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::CreateComment)?;

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
    if let Some(parent_id) = body.parent_id {
        let parent = article_comments::table
            .find(parent_id)
            .select(article_comments::id)
            .first::<i64>(conn)
            .await
            .optional()
            .context("Failed to check parent comment")?;
        if parent.is_none() {
            return Err(AppError::invalid_field(
                "parent_id",
                "The selected parent comment does not exist",
            ));
        }
    }

    let comment: ArticleCommentEntity = diesel::insert_into(article_comments::table)
        .values(CreateArticleCommentEntity {
            article_id: body.article_id,
            user_id: user.id,
            parent_id: body.parent_id,
            content: body.content,
        })
        .returning(ArticleCommentEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to create comment")?;

    let res = project_one(conn, comment).await?;
    Ok(StdResponse::created(res, "Comment created successfully"))
}

#[derive(Deserialize, Validate, ToSchema)]
struct UpdateCommentReq {
    #[validate(length(min = 1))]
    pub content: String,
}

/// Edit a comment. Only its author or an admin may do so.
#[utoipa::path(
    put,
    path = "/{id}",
    tags = ["Article Comments"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Comment ID")),
    request_body = UpdateCommentReq,
    responses(
        (status = 200, description = "Comment updated successfully", body = StdResponse<CommentRes>),
        (status = 403, description = "Not the author", body = ErrorResponse),
        (status = 404, description = "Comment not found", body = ErrorResponse)
    )
)]
async fn update_comment(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<UpdateCommentReq>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let comment = find_comment(conn, id).await?;
    policy::authorize(
        &user,
        Action::ModifyComment {
            owner_id: comment.user_id,
        },
    )?;

    let comment: ArticleCommentEntity = diesel::update(article_comments::table.find(id))
        .set(article_comments::content.eq(body.content))
        .returning(ArticleCommentEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to update comment")?;

    let res = project_one(conn, comment).await?;
    Ok(StdResponse::ok(res, "Comment updated successfully"))
}

/// Delete a comment and its replies. Only its author or an admin may do so.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Article Comments"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "Comment ID")),
    responses(
        (status = 200, description = "Comment deleted successfully"),
        (status = 403, description = "Not the author", body = ErrorResponse),
        (status = 404, description = "Comment not found", body = ErrorResponse)
    )
)]
async fn delete_comment(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let comment = find_comment(conn, id).await?;
    policy::authorize(
        &user,
        Action::ModifyComment {
            owner_id: comment.user_id,
        },
    )?;

    diesel::delete(article_comments::table.find(id))
        .execute(conn)
        .await
        .context("Failed to delete comment")?;

    tracing::info!("Comment #{} deleted by user #{}", id, user.id);
    Ok(StdResponse::<()>::empty("Comment deleted successfully"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_content_is_rejected() {
        let req: CreateCommentReq =
            serde_json::from_str(r#"{"article_id":3,"content":""}"#).unwrap();
        assert!(req.validate().unwrap_err().field_errors().contains_key("content"));

        let req: CreateCommentReq =
            serde_json::from_str(r#"{"article_id":3,"parent_id":9,"content":"Thanks!"}"#).unwrap();
        assert!(req.validate().is_ok());
        assert_eq!(req.parent_id, Some(9));
    }
}
