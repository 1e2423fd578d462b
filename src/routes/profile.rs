use anyhow::Context;
use axum::{extract::State, response::IntoResponse};
use chrono::{NaiveDate, Utc};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use validator::Validate;

use crate::{
    app_error::{AppError, ErrorResponse, StdResponse, ValidJson},
    app_state::AppState,
    auth::{AuthUser, issue_token},
    enums::{Gender, Role},
    models::{UpdateUserEntity, UserEntity},
    resources::{AVATAR_FOLDER, UserRes},
    routes::auth::AuthRes,
    schema::users,
    services::users::phone_conflict,
    storage,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/profile",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(show_profile, update_profile))
            .routes(utoipa_axum::routes!(upload_avatar, remove_avatar)),
    )
}

/// Get the caller's profile together with a freshly issued token.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Profile"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Profile retrieved successfully", body = StdResponse<AuthRes>),
        (status = 401, description = "Unauthenticated", body = ErrorResponse)
    )
)]
async fn show_profile(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let entity: UserEntity = users::table
        .find(user.id)
        .select(UserEntity::as_select())
        .first(conn)
        .await?;

    let token = issue_token(entity.id, entity.role, &state.config.auth)?;
    Ok(StdResponse::ok(
        AuthRes {
            user: UserRes::new(entity, &state.storage),
            token,
        },
        "Profile retrieved successfully",
    ))
}

#[derive(Deserialize, Validate, ToSchema)]
struct UpdateProfileReq {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    pub role: Option<Role>,
    pub gender: Option<Gender>,
    pub birthdate: Option<NaiveDate>,
    #[validate(length(max = 10))]
    pub blood_type: Option<String>,
    pub allergy: Option<String>,
    pub chronic_diseases: Option<String>,
    pub is_active: Option<bool>,
    #[validate(length(max = 255))]
    pub device_token: Option<String>,
    #[validate(custom(function = "crate::routes::validate_device_type"))]
    pub device_type: Option<String>,
}

impl UpdateProfileReq {
    fn into_changeset(self) -> UpdateUserEntity {
        UpdateUserEntity {
            name: self.name,
            role: self.role,
            gender: self.gender.map(Some),
            birthdate: self.birthdate.map(Some),
            blood_type: self.blood_type.map(Some),
            allergy: self.allergy.map(Some),
            chronic_diseases: self.chronic_diseases.map(Some),
            is_active: self.is_active,
            device_token: self.device_token.map(Some),
            device_type: self.device_type.map(Some),
            ..Default::default()
        }
    }
}

pub(crate) fn ensure_past_birthdate(birthdate: Option<NaiveDate>) -> Result<(), AppError> {
    match birthdate {
        Some(date) if date >= Utc::now().date_naive() => Err(AppError::invalid_field(
            "birthdate",
            "The birthdate must be a date before today",
        )),
        _ => Ok(()),
    }
}

/// Update the caller's own profile. Omitted fields are left unchanged.
#[utoipa::path(
    put,
    path = "/",
    tags = ["Profile"],
    security(("bearerAuth" = [])),
    request_body = UpdateProfileReq,
    responses(
        (status = 200, description = "Profile updated successfully", body = StdResponse<UserRes>),
        (status = 422, description = "Validation failed", body = ErrorResponse)
    )
)]
async fn update_profile(
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<UpdateProfileReq>,
) -> Result<impl IntoResponse, AppError> {
    ensure_past_birthdate(body.birthdate)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let changes = body.into_changeset();
    let entity: UserEntity = if changes.is_empty() {
        users::table
            .find(user.id)
            .select(UserEntity::as_select())
            .first(conn)
            .await?
    } else {
        diesel::update(users::table.find(user.id))
            .set(changes)
            .returning(UserEntity::as_returning())
            .get_result(conn)
            .await
            .map_err(phone_conflict)?
    };

    Ok(StdResponse::ok(
        UserRes::new(entity, &state.storage),
        "Profile updated successfully",
    ))
}

#[derive(Deserialize, Validate, ToSchema)]
struct UploadAvatarReq {
    /// Name of a file previously uploaded into the `users` folder.
    #[validate(length(min = 1, max = 255))]
    pub avatar_name: String,
}

#[derive(Serialize, ToSchema)]
struct AvatarRes {
    pub avatar_name: String,
    pub folder: String,
    pub avatar_url: String,
    pub user: UserRes,
}

/// Point the caller's avatar at an uploaded image, removing the previous file.
#[utoipa::path(
    post,
    path = "/avatar",
    tags = ["Profile"],
    security(("bearerAuth" = [])),
    request_body = UploadAvatarReq,
    responses(
        (status = 200, description = "Avatar updated successfully", body = StdResponse<AvatarRes>),
        (status = 404, description = "Image not found in storage", body = ErrorResponse)
    )
)]
async fn upload_avatar(
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<UploadAvatarReq>,
) -> Result<impl IntoResponse, AppError> {
    let key = storage::key(AVATAR_FOLDER, &body.avatar_name);
    if !state.storage.exists(&key).await {
        return Err(AppError::NotFound("Image"));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let previous: Option<String> = users::table
        .find(user.id)
        .select(users::avatar)
        .first(conn)
        .await?;

    let entity: UserEntity = diesel::update(users::table.find(user.id))
        .set(users::avatar.eq(&body.avatar_name))
        .returning(UserEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to update avatar")?;

    if let Some(previous) = previous.filter(|name| *name != body.avatar_name) {
        if let Err(err) = state
            .storage
            .delete(&storage::key(AVATAR_FOLDER, &previous))
            .await
        {
            tracing::warn!("Failed to remove old avatar {}: {:?}", previous, err);
        }
    }

    Ok(StdResponse::ok(
        AvatarRes {
            avatar_url: state.storage.url(&key),
            avatar_name: body.avatar_name,
            folder: AVATAR_FOLDER.to_string(),
            user: UserRes::new(entity, &state.storage),
        },
        "Avatar updated successfully",
    ))
}

/// Remove the caller's avatar and its file.
#[utoipa::path(
    delete,
    path = "/avatar",
    tags = ["Profile"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Avatar removed successfully", body = StdResponse<UserRes>),
        (status = 404, description = "No avatar to remove", body = ErrorResponse)
    )
)]
async fn remove_avatar(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let avatar: Option<String> = users::table
        .find(user.id)
        .select(users::avatar)
        .first(conn)
        .await?;
    let avatar = avatar.ok_or(AppError::NotFound("Avatar"))?;

    state
        .storage
        .delete(&storage::key(AVATAR_FOLDER, &avatar))
        .await?;

    let entity: UserEntity = diesel::update(users::table.find(user.id))
        .set(users::avatar.eq(None::<String>))
        .returning(UserEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to remove avatar")?;

    Ok(StdResponse::ok(
        UserRes::new(entity, &state.storage),
        "Avatar removed successfully",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Days;

    #[test]
    fn birthdate_must_be_in_the_past() {
        let today = Utc::now().date_naive();
        assert!(ensure_past_birthdate(Some(today)).is_err());
        assert!(ensure_past_birthdate(today.checked_sub_days(Days::new(1))).is_ok());
        assert!(ensure_past_birthdate(None).is_ok());
    }

    #[test]
    fn empty_profile_update_touches_nothing() {
        let req: UpdateProfileReq = serde_json::from_str("{}").unwrap();
        assert!(req.into_changeset().is_empty());
        let req: UpdateProfileReq = serde_json::from_str(r#"{"allergy":"pollen"}"#).unwrap();
        let changes = req.into_changeset();
        assert_eq!(changes.allergy, Some(Some("pollen".into())));
        assert!(!changes.is_empty());
    }
}
