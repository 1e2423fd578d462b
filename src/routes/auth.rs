use anyhow::Context;
use axum::{extract::State, response::IntoResponse};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use validator::Validate;

use crate::{
    app_error::{AppError, ErrorResponse, StdResponse, ValidJson},
    app_state::AppState,
    auth::{AuthUser, issue_token, normalize_phone},
    enums::Role,
    models::UserEntity,
    resources::UserRes,
    schema::users,
    services::users::login_user,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/auth",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(login))
            .routes(utoipa_axum::routes!(verify_otp))
            .routes(utoipa_axum::routes!(logout)),
    )
}

#[derive(Deserialize, Validate, ToSchema)]
struct LoginReq {
    #[validate(length(min = 1, max = 20))]
    pub phone: String,
    pub role: Role,
    #[validate(length(max = 255))]
    pub device_token: Option<String>,
    #[validate(custom(function = "crate::routes::validate_device_type"))]
    pub device_type: Option<String>,
}

#[derive(Serialize, ToSchema)]
struct LoginRes {
    pub phone: Option<String>,
    pub role: Role,
}

/// Start a login: finds or registers the user for `(phone, role)` and sends the OTP.
#[utoipa::path(
    post,
    path = "/login",
    tags = ["Auth"],
    request_body = LoginReq,
    responses(
        (status = 200, description = "OTP sent to your phone", body = StdResponse<LoginRes>),
        (status = 422, description = "Invalid phone or role", body = ErrorResponse)
    )
)]
async fn login(
    State(state): State<AppState>,
    ValidJson(body): ValidJson<LoginReq>,
) -> Result<impl IntoResponse, AppError> {
    let phone = normalize_phone(&body.phone);
    if phone.len() < 2 {
        return Err(AppError::invalid_field(
            "phone",
            "The phone number must contain digits",
        ));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let user = login_user(
        conn,
        phone,
        body.role,
        body.device_token,
        body.device_type,
    )
    .await?;
    tracing::debug!("OTP requested for {} #{}", user.role, user.id);

    Ok(StdResponse::ok(
        LoginRes {
            phone: user.phone,
            role: user.role,
        },
        "OTP sent to your phone",
    ))
}

#[derive(Deserialize, Validate, ToSchema)]
struct VerifyOtpReq {
    #[validate(length(min = 1, max = 20))]
    pub phone: String,
    pub role: Role,
    #[validate(length(min = 1))]
    pub otp: String,
    #[validate(length(max = 255))]
    pub device_token: Option<String>,
    #[validate(custom(function = "crate::routes::validate_device_type"))]
    pub device_type: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct AuthRes {
    pub user: UserRes,
    pub token: String,
}

/// Finish a login and receive a bearer token.
#[utoipa::path(
    post,
    path = "/verify-otp",
    tags = ["Auth"],
    request_body = VerifyOtpReq,
    responses(
        (status = 200, description = "OTP verified, login successful", body = StdResponse<AuthRes>),
        (status = 401, description = "Invalid OTP", body = ErrorResponse),
        (status = 404, description = "User not found", body = ErrorResponse)
    )
)]
async fn verify_otp(
    State(state): State<AppState>,
    ValidJson(body): ValidJson<VerifyOtpReq>,
) -> Result<impl IntoResponse, AppError> {
    if body.otp != state.config.auth.otp_code {
        return Err(AppError::InvalidOtp);
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let phone = normalize_phone(&body.phone);
    let user: UserEntity = diesel::update(
        users::table
            .filter(users::phone.eq(&phone))
            .filter(users::role.eq(body.role)),
    )
    .set((
        users::device_token.eq(&body.device_token),
        users::device_type.eq(&body.device_type),
    ))
    .returning(UserEntity::as_returning())
    .get_result(conn)
    .await
    .optional()
    .context("Failed to load user")?
    .ok_or(AppError::NotFound("User"))?;

    if !user.is_active {
        return Err(AppError::ForbiddenResource(
            "This account is deactivated".into(),
        ));
    }

    let token = issue_token(user.id, user.role, &state.config.auth)?;
    tracing::info!("{} #{} logged in", user.role, user.id);

    Ok(StdResponse::ok(
        AuthRes {
            user: UserRes::new(user, &state.storage),
            token,
        },
        "OTP verified, login successful",
    ))
}

/// Tokens are stateless; logging out only acknowledges the request.
#[utoipa::path(
    post,
    path = "/logout",
    tags = ["Auth"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Logged out successfully"),
        (status = 401, description = "Unauthenticated", body = ErrorResponse)
    )
)]
async fn logout(user: AuthUser) -> Result<impl IntoResponse, AppError> {
    tracing::info!("User #{} logged out", user.id);
    Ok(StdResponse::<()>::empty("Logged out successfully"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_device_types_fail_validation() {
        let req = LoginReq {
            phone: "0599".into(),
            role: Role::Patient,
            device_token: None,
            device_type: Some("fax".into()),
        };
        let errors = req.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("device_type"));
    }
}
