//! Article and comment projections shared by the CMS routes.

use std::collections::HashMap;

use anyhow::Context;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper, dsl::count_star};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::{
    app_error::AppError,
    models::{ArticleCategoryEntity, ArticleCommentEntity, ArticleEntity, ArticleImageEntity},
    resources::{ArticleImageRes, ArticleRes, CommentRes},
    schema::{article_categories, article_comments, article_images, articles},
    services::users_by_id,
    storage::Storage,
};

/// Attaches authors and one level of replies to `comments`, preserving order.
/// Replies are oldest first.
pub async fn comment_tree(
    conn: &mut AsyncPgConnection,
    comments: Vec<ArticleCommentEntity>,
) -> Result<Vec<CommentRes>, AppError> {
    if comments.is_empty() {
        return Ok(vec![]);
    }

    let parent_ids: Vec<i64> = comments.iter().map(|c| c.id).collect();
    let replies: Vec<ArticleCommentEntity> = article_comments::table
        .filter(article_comments::parent_id.eq_any(&parent_ids))
        .order_by((article_comments::created_at.asc(), article_comments::id.asc()))
        .select(ArticleCommentEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to load replies")?;

    let authors = users_by_id(
        conn,
        comments
            .iter()
            .chain(replies.iter())
            .map(|c| c.user_id)
            .collect(),
    )
    .await?;

    let mut children: HashMap<i64, Vec<CommentRes>> = HashMap::new();
    for reply in replies {
        if let Some(parent_id) = reply.parent_id {
            let author = authors.get(&reply.user_id);
            children
                .entry(parent_id)
                .or_default()
                .push(CommentRes::new(reply, author, vec![]));
        }
    }

    Ok(comments
        .into_iter()
        .map(|comment| {
            let author = authors.get(&comment.user_id);
            let replies = children.remove(&comment.id).unwrap_or_default();
            CommentRes::new(comment, author, replies)
        })
        .collect())
}

/// Builds full article resources for a batch: author, category, images,
/// top-level comments with replies, and the total comment count.
pub async fn project(
    conn: &mut AsyncPgConnection,
    storage: &Storage,
    rows: Vec<ArticleEntity>,
) -> Result<Vec<ArticleRes>, AppError> {
    if rows.is_empty() {
        return Ok(vec![]);
    }
    let ids: Vec<i64> = rows.iter().map(|a| a.id).collect();

    let doctors = users_by_id(conn, rows.iter().filter_map(|a| a.doctor_id).collect()).await?;

    let category_ids: Vec<i64> = rows.iter().map(|a| a.category_id).collect();
    let categories: HashMap<i64, ArticleCategoryEntity> = article_categories::table
        .filter(article_categories::id.eq_any(&category_ids))
        .select(ArticleCategoryEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to load categories")?
        .into_iter()
        .map(|c| (c.id, c))
        .collect();

    let image_rows: Vec<ArticleImageEntity> = article_images::table
        .filter(article_images::article_id.eq_any(&ids))
        .order_by((article_images::is_cover.desc(), article_images::id.asc()))
        .select(ArticleImageEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to load article images")?;
    let mut images: HashMap<i64, Vec<ArticleImageRes>> = HashMap::new();
    for image in image_rows {
        images
            .entry(image.article_id)
            .or_default()
            .push(ArticleImageRes::new(image, storage));
    }

    let top_level: Vec<ArticleCommentEntity> = article_comments::table
        .filter(article_comments::article_id.eq_any(&ids))
        .filter(article_comments::parent_id.is_null())
        .order_by((article_comments::created_at.asc(), article_comments::id.asc()))
        .select(ArticleCommentEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to load comments")?;
    let mut comments: HashMap<i64, Vec<CommentRes>> = HashMap::new();
    for comment in comment_tree(conn, top_level).await? {
        comments.entry(comment.article_id).or_default().push(comment);
    }

    let counts: HashMap<i64, i64> = article_comments::table
        .filter(article_comments::article_id.eq_any(&ids))
        .group_by(article_comments::article_id)
        .select((article_comments::article_id, count_star()))
        .get_results::<(i64, i64)>(conn)
        .await
        .context("Failed to count comments")?
        .into_iter()
        .collect();

    Ok(rows
        .into_iter()
        .map(|article| {
            let id = article.id;
            let doctor = article.doctor_id.and_then(|d| doctors.get(&d));
            let category = categories.get(&article.category_id);
            ArticleRes::new(
                article,
                doctor,
                category,
                images.remove(&id).unwrap_or_default(),
                comments.remove(&id).unwrap_or_default(),
                counts.get(&id).copied().unwrap_or(0),
                storage,
            )
        })
        .collect())
}

pub async fn get(
    conn: &mut AsyncPgConnection,
    storage: &Storage,
    id: i64,
) -> Result<ArticleRes, AppError> {
    let article: ArticleEntity = articles::table
        .find(id)
        .select(ArticleEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to load article")?
        .ok_or(AppError::NotFound("Article"))?;

    project(conn, storage, vec![article])
        .await?
        .pop()
        .ok_or(AppError::NotFound("Article"))
}

pub async fn category_exists(conn: &mut AsyncPgConnection, id: i64) -> Result<bool, AppError> {
    let count: i64 = article_categories::table
        .find(id)
        .count()
        .get_result(conn)
        .await
        .context("Failed to check category")?;
    Ok(count > 0)
}

pub async fn article_exists(conn: &mut AsyncPgConnection, id: i64) -> Result<bool, AppError> {
    let count: i64 = articles::table
        .find(id)
        .count()
        .get_result(conn)
        .await
        .context("Failed to check article")?;
    Ok(count > 0)
}
