use anyhow::Context;
use diesel::{ExpressionMethods, SelectableHelper, result::DatabaseErrorKind, upsert::excluded};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use uuid::Uuid;

use crate::{
    aliases::DieselError,
    app_error::AppError,
    enums::Role,
    models::{CreateUserEntity, UserEntity},
    schema::users,
};

/// Unique index over `(phone, role)`.
pub const PHONE_ROLE_INDEX: &str = "users_phone_role_idx";

/// Placeholder display name for accounts created on first login.
fn generated_user_name() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("User_{}", &suffix[..5])
}

/// Maps a write that collides on `(phone, role)` to a 422 on `phone`.
pub fn phone_conflict(err: DieselError) -> AppError {
    if let DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) = &err {
        if info.constraint_name() == Some(PHONE_ROLE_INDEX) {
            return AppError::invalid_field(
                "phone",
                "The phone has already been taken for this role",
            );
        }
    }
    AppError::Other(anyhow::Error::new(err).context("Failed to write user"))
}

/// Finds or registers the account for `(phone, role)` in one statement and
/// stores the device it logged in from. An existing account keeps its name.
pub async fn login_user(
    conn: &mut AsyncPgConnection,
    phone: String,
    role: Role,
    device_token: Option<String>,
    device_type: Option<String>,
) -> Result<UserEntity, AppError> {
    let user: UserEntity = diesel::insert_into(users::table)
        .values(CreateUserEntity {
            name: generated_user_name(),
            email: None,
            phone: Some(phone),
            password: None,
            role,
            avatar: None,
            gender: None,
            birthdate: None,
            is_active: true,
            device_token,
            device_type,
        })
        .on_conflict((users::phone, users::role))
        .do_update()
        .set((
            users::device_token.eq(excluded(users::device_token)),
            users::device_type.eq(excluded(users::device_type)),
        ))
        .returning(UserEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to log in user")?;
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_have_a_short_suffix() {
        let name = generated_user_name();
        assert!(name.starts_with("User_"));
        assert_eq!(name.len(), 10);
    }

    #[test]
    fn other_database_errors_stay_internal() {
        assert!(matches!(
            phone_conflict(DieselError::RollbackTransaction),
            AppError::Other(_)
        ));
    }
}
