use anyhow::Context;
use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
};
use chrono::{Duration, Utc};
use diesel::{OptionalExtension, QueryDsl};
use diesel_async::RunQueryDsl;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::{
    app_error::AppError, app_state::AppState, config::AuthConfig, enums::Role, schema::users,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub role: Role,
    pub exp: i64,
    pub iat: i64,
}

pub fn issue_token(user_id: i64, role: Role, config: &AuthConfig) -> anyhow::Result<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        role,
        exp: (now + Duration::hours(config.jwt_ttl_hours)).timestamp(),
        iat: now.timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .context("Failed to sign access token")
}

pub fn verify_token(
    token: &str,
    config: &AuthConfig,
) -> Result<Claims, jsonwebtoken::errors::Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).context("Failed to hash password")
}

/// Canonical phone form used for the `(phone, role)` login key: no
/// whitespace, ASCII digits only, a single leading `+`.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '\u{0660}'..='\u{0669}' => {
                char::from_digit(c as u32 - '\u{0660}' as u32, 10).unwrap_or(c)
            }
            other => other,
        })
        .filter(|c| c.is_ascii_digit())
        .collect();
    format!("+{digits}")
}

/// The caller behind a verified bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub id: i64,
    pub role: Role,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(AppError::Unauthorized)?;
        let claims = verify_token(token, &state.config.auth).map_err(|err| {
            tracing::debug!("Rejected bearer token: {}", err);
            AppError::Unauthorized
        })?;
        let user_id: i64 = claims.sub.parse().map_err(|_| AppError::Unauthorized)?;

        let conn = &mut state
            .db_pool
            .get()
            .await
            .context("Failed to obtain a DB connection pool")?;

        // The role is re-read so profile role changes apply to existing tokens.
        let (id, role, is_active): (i64, Role, bool) = users::table
            .find(user_id)
            .select((users::id, users::role, users::is_active))
            .first(conn)
            .await
            .optional()
            .context("Failed to load authenticated user")?
            .ok_or(AppError::Unauthorized)?;

        if !is_active {
            return Err(AppError::ForbiddenResource("This account is deactivated".into()));
        }

        Ok(AuthUser { id, role })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn auth_config() -> AuthConfig {
        AuthConfig {
            api_key: "key".into(),
            jwt_secret: "secret".into(),
            jwt_ttl_hours: 1,
            otp_code: "666666".into(),
        }
    }

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone(" 0599 123 456 "), "+0599123456");
        assert_eq!(normalize_phone("+966-55-123"), "+96655123");
        assert_eq!(normalize_phone("٠٥٩٩١٢٣"), "+0599123");
        assert_eq!(normalize_phone("++12"), "+12");
        let once = normalize_phone("٠٥ 99-12");
        assert_eq!(normalize_phone(&once), once);
    }

    #[test]
    fn tokens_round_trip() {
        let config = auth_config();
        let token = issue_token(42, Role::Doctor, &config).unwrap();
        let claims = verify_token(&token, &config).unwrap();
        assert_eq!(claims.sub, "42");
        assert_eq!(claims.role, Role::Doctor);
    }

    #[test]
    fn tokens_signed_with_another_secret_are_rejected() {
        let token = issue_token(42, Role::Doctor, &auth_config()).unwrap();
        let other = AuthConfig {
            jwt_secret: "different".into(),
            ..auth_config()
        };
        assert!(verify_token(&token, &other).is_err());
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }
}
