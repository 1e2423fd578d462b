use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::NaiveDate;
use diesel::{
    BoolExpressionMethods, ExpressionMethods, NullableExpressionMethods, OptionalExtension,
    PgTextExpressionMethods, QueryDsl, SelectableHelper, pg::Pg,
};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;
use validator::Validate;

use crate::{
    app_error::{AppError, ErrorResponse, StdResponse, ValidJson},
    app_state::AppState,
    auth::{AuthUser, hash_password, normalize_phone},
    enums::{Gender, Role},
    models::{CreateUserEntity, UpdateUserEntity, UserEntity},
    pagination::{PageMeta, PageParams},
    policy::{self, Action},
    resources::UserRes,
    routes::profile::ensure_past_birthdate,
    schema::users,
    services::{like_pattern, users::phone_conflict},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/users",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_users, create_user))
            .routes(utoipa_axum::routes!(get_user, update_user, delete_user)),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortField {
    Id,
    Name,
    Email,
    Phone,
    Role,
    CreatedAt,
}

impl SortField {
    fn parse(raw: Option<&str>) -> Result<Self, AppError> {
        match raw.unwrap_or("created_at") {
            "id" => Ok(SortField::Id),
            "name" => Ok(SortField::Name),
            "email" => Ok(SortField::Email),
            "phone" => Ok(SortField::Phone),
            "role" => Ok(SortField::Role),
            "created_at" => Ok(SortField::CreatedAt),
            _ => Err(AppError::invalid_field(
                "sort_by",
                "The sort field must be one of id, name, email, phone, role, created_at",
            )),
        }
    }
}

fn parse_descending(raw: Option<&str>) -> Result<bool, AppError> {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        None | Some("desc") => Ok(true),
        Some("asc") => Ok(false),
        Some(_) => Err(AppError::invalid_field(
            "sort_direction",
            "The sort direction must be asc or desc",
        )),
    }
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct UserQuery {
    pub role: Option<Role>,
    pub is_active: Option<bool>,
    /// Matches name, email or phone.
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_direction: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

fn filtered(query: &UserQuery) -> users::BoxedQuery<'static, Pg> {
    let mut statement = users::table.into_boxed();
    if let Some(role) = query.role {
        statement = statement.filter(users::role.eq(role));
    }
    if let Some(is_active) = query.is_active {
        statement = statement.filter(users::is_active.eq(is_active));
    }
    if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
        let pattern = like_pattern(search);
        statement = statement.filter(
            users::name
                .nullable()
                .ilike(pattern.clone())
                .or(users::email.ilike(pattern.clone()))
                .or(users::phone.ilike(pattern)),
        );
    }
    statement
}

fn sorted(
    statement: users::BoxedQuery<'static, Pg>,
    field: SortField,
    descending: bool,
) -> users::BoxedQuery<'static, Pg> {
    match (field, descending) {
        (SortField::Id, false) => statement.order_by(users::id.asc()),
        (SortField::Id, true) => statement.order_by(users::id.desc()),
        (SortField::Name, false) => statement.order_by(users::name.asc()),
        (SortField::Name, true) => statement.order_by(users::name.desc()),
        (SortField::Email, false) => statement.order_by(users::email.asc()),
        (SortField::Email, true) => statement.order_by(users::email.desc()),
        (SortField::Phone, false) => statement.order_by(users::phone.asc()),
        (SortField::Phone, true) => statement.order_by(users::phone.desc()),
        (SortField::Role, false) => statement.order_by(users::role.asc()),
        (SortField::Role, true) => statement.order_by(users::role.desc()),
        (SortField::CreatedAt, false) => statement.order_by(users::created_at.asc()),
        (SortField::CreatedAt, true) => statement.order_by(users::created_at.desc()),
    }
}

/// List users with filters, search and sorting.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Users"],
    security(("bearerAuth" = [])),
    params(UserQuery),
    responses(
        (status = 200, description = "Users fetched successfully", body = StdResponse<Vec<UserRes>>),
        (status = 422, description = "Unknown sort field", body = ErrorResponse)
    )
)]
async fn get_users(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<UserQuery>,
) -> Result<impl IntoResponse, AppError> {
    let field = SortField::parse(query.sort_by.as_deref())?;
    let descending = parse_descending(query.sort_direction.as_deref())?;
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
        .context("Failed to count users")?;

    let rows: Vec<UserEntity> = sorted(filtered(&query), field, descending)
        .then_order_by(users::id.asc())
        .limit(page.limit())
        .offset(page.offset())
        .select(UserEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get users")?;

    let data: Vec<UserRes> = rows
        .into_iter()
        .map(|user| UserRes::new(user, &state.storage))
        .collect();

    Ok(StdResponse::paginated(
        data,
        PageMeta::new(total, page),
        "Users fetched successfully",
    ))
}

/// Fetch a single user.
#[utoipa::path(
    get,
    path = "/{id}",
    tags = ["Users"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "User ID")),
    responses(
        (status = 200, description = "User fetched successfully", body = StdResponse<UserRes>),
        (status = 404, description = "User not found", body = ErrorResponse)
    )
)]
async fn get_user(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    _user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let user: UserEntity = users::table
        .find(id)
        .select(UserEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get user")?
        .ok_or(AppError::NotFound("User"))?;

    Ok(StdResponse::ok(
        UserRes::new(user, &state.storage),
        "User fetched successfully",
    ))
}

async fn ensure_unique_email(
    conn: &mut AsyncPgConnection,
    email: &str,
    except_id: Option<i64>,
) -> Result<(), AppError> {
    let mut query = users::table
        .filter(users::email.eq(email))
        .into_boxed::<Pg>();
    if let Some(id) = except_id {
        query = query.filter(users::id.ne(id));
    }
    let taken: i64 = query
        .count()
        .get_result(conn)
        .await
        .context("Failed to check email")?;

    if taken > 0 {
        return Err(AppError::invalid_field(
            "email",
            "The email has already been taken",
        ));
    }
    Ok(())
}

#[derive(Deserialize, Validate, ToSchema)]
struct CreateUserReq {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(min = 1, max = 20))]
    pub phone: Option<String>,
    #[validate(length(min = 6))]
    pub password: Option<String>,
    pub role: Role,
    #[validate(length(max = 255))]
    pub avatar: Option<String>,
    pub gender: Option<Gender>,
    pub birthdate: Option<NaiveDate>,
    pub is_active: Option<bool>,
}

/// Create a user. Admin only.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Users"],
    security(("bearerAuth" = [])),
    request_body = CreateUserReq,
    responses(
        (status = 201, description = "User created successfully", body = StdResponse<UserRes>),
        (status = 403, description = "Not an admin", body = ErrorResponse),
        (status = 422, description = "Validation failed", body = ErrorResponse)
    )
)]
async fn create_user(
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<CreateUserReq>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::ManageUsers)?;
    ensure_past_birthdate(body.birthdate)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    if let Some(email) = &body.email {
        ensure_unique_email(conn, email, None).await?;
    }
    let password = body.password.as_deref().map(hash_password).transpose()?;

    let created: UserEntity = diesel::insert_into(users::table)
        .values(CreateUserEntity {
            name: body.name,
            email: body.email,
            phone: body.phone.as_deref().map(normalize_phone),
            password,
            role: body.role,
            avatar: body.avatar,
            gender: body.gender,
            birthdate: body.birthdate,
            is_active: body.is_active.unwrap_or(true),
            device_token: None,
            device_type: None,
        })
        .returning(UserEntity::as_returning())
        .get_result(conn)
        .await
        .map_err(phone_conflict)?;

    tracing::info!("Admin #{} created {} #{}", user.id, created.role, created.id);
    Ok(StdResponse::created(
        UserRes::new(created, &state.storage),
        "User created successfully",
    ))
}

#[derive(Deserialize, Validate, ToSchema)]
struct UpdateUserReq {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(min = 1, max = 20))]
    pub phone: Option<String>,
    #[validate(length(min = 6))]
    pub password: Option<String>,
    pub role: Option<Role>,
    #[validate(length(max = 255))]
    pub avatar: Option<String>,
    pub gender: Option<Gender>,
    pub birthdate: Option<NaiveDate>,
    pub is_active: Option<bool>,
}

/// Update a user. Admin only.
#[utoipa::path(
    put,
    path = "/{id}",
    tags = ["Users"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "User ID")),
    request_body = UpdateUserReq,
    responses(
        (status = 200, description = "User updated successfully", body = StdResponse<UserRes>),
        (status = 404, description = "User not found", body = ErrorResponse)
    )
)]
async fn update_user(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<UpdateUserReq>,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::ManageUsers)?;
    ensure_past_birthdate(body.birthdate)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    if let Some(email) = &body.email {
        ensure_unique_email(conn, email, Some(id)).await?;
    }

    let changes = UpdateUserEntity {
        name: body.name,
        email: body.email.map(Some),
        phone: body.phone.as_deref().map(normalize_phone).map(Some),
        password: body
            .password
            .as_deref()
            .map(hash_password)
            .transpose()?
            .map(Some),
        role: body.role,
        avatar: body.avatar.map(Some),
        gender: body.gender.map(Some),
        birthdate: body.birthdate.map(Some),
        is_active: body.is_active,
        ..Default::default()
    };

    let updated: UserEntity = if changes.is_empty() {
        users::table
            .find(id)
            .select(UserEntity::as_select())
            .first(conn)
            .await
            .optional()
            .context("Failed to get user")?
    } else {
        diesel::update(users::table.find(id))
            .set(changes)
            .returning(UserEntity::as_returning())
            .get_result(conn)
            .await
            .optional()
            .map_err(phone_conflict)?
    }
    .ok_or(AppError::NotFound("User"))?;

    Ok(StdResponse::ok(
        UserRes::new(updated, &state.storage),
        "User updated successfully",
    ))
}

/// Delete a user and everything that cascades from it. Admin only.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Users"],
    security(("bearerAuth" = [])),
    params(("id" = i64, Path, description = "User ID")),
    responses(
        (status = 200, description = "User deleted successfully"),
        (status = 404, description = "User not found", body = ErrorResponse)
    )
)]
async fn delete_user(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::ManageUsers)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let deleted = diesel::delete(users::table.find(id))
        .execute(conn)
        .await
        .context("Failed to delete user")?;
    if deleted == 0 {
        return Err(AppError::NotFound("User"));
    }

    tracing::info!("Admin #{} deleted user #{}", user.id, id);
    Ok(StdResponse::<()>::empty("User deleted successfully"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_fields_are_whitelisted() {
        assert_eq!(SortField::parse(None).unwrap(), SortField::CreatedAt);
        assert_eq!(SortField::parse(Some("phone")).unwrap(), SortField::Phone);
        assert!(SortField::parse(Some("password")).is_err());
        assert!(SortField::parse(Some("name; drop table users")).is_err());
    }

    #[test]
    fn sort_direction_defaults_to_descending() {
        assert!(parse_descending(None).unwrap());
        assert!(!parse_descending(Some("ASC")).unwrap());
        assert!(parse_descending(Some("sideways")).is_err());
    }
}
