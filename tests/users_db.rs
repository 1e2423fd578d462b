//! Account uniqueness against a real database.

mod common;

use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use medbook_consultationservice::{
    app_error::AppError,
    enums::Role,
    models::UserEntity,
    schema::users,
    services::users::{login_user, phone_conflict},
};

use common::{new_user, pool, random_phone};

#[tokio::test]
async fn phone_is_unique_per_role() {
    let Some(pool) = pool().await else { return };
    let conn = &mut pool.get().await.unwrap();
    let phone = random_phone();

    diesel::insert_into(users::table)
        .values(new_user(&phone, Role::Patient))
        .execute(conn)
        .await
        .unwrap();

    let err = diesel::insert_into(users::table)
        .values(new_user(&phone, Role::Patient))
        .execute(conn)
        .await
        .map_err(phone_conflict)
        .unwrap_err();
    let AppError::ValidationFailed(errors) = err else {
        panic!("expected a validation error, got {err:?}");
    };
    assert!(errors.field_errors().contains_key("phone"));

    diesel::insert_into(users::table)
        .values(new_user(&phone, Role::Doctor))
        .execute(conn)
        .await
        .unwrap();

    let count: i64 = users::table
        .filter(users::phone.eq(&phone))
        .count()
        .get_result(conn)
        .await
        .unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn login_registers_once_and_refreshes_the_device() {
    let Some(pool) = pool().await else { return };
    let conn = &mut pool.get().await.unwrap();
    let phone = random_phone();

    let first = login_user(
        conn,
        phone.clone(),
        Role::Patient,
        Some("token-a".into()),
        Some("android".into()),
    )
    .await
    .unwrap();
    assert!(first.name.starts_with("User_"));
    assert!(first.is_active);

    let second = login_user(
        conn,
        phone.clone(),
        Role::Patient,
        Some("token-b".into()),
        Some("ios".into()),
    )
    .await
    .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.name, first.name);
    assert_eq!(second.device_token.as_deref(), Some("token-b"));
    assert_eq!(second.device_type.as_deref(), Some("ios"));

    let rows: Vec<UserEntity> = users::table
        .filter(users::phone.eq(&phone))
        .filter(users::role.eq(Role::Patient))
        .select(UserEntity::as_select())
        .get_results(conn)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    let doctor = login_user(conn, phone, Role::Doctor, None, None).await.unwrap();
    assert_ne!(doctor.id, first.id);
}
