//! Shared set-up for tests that need a real database.
//!
//! Those tests are skipped unless `TEST_DATABASE_URL` points at a disposable
//! Postgres database.

#![allow(dead_code)]

use diesel::SelectableHelper;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{EmbeddedMigrations, embed_migrations};
use medbook_consultationservice::{
    auth::AuthUser,
    db::{self, DbPool},
    enums::Role,
    models::{CreateUserEntity, UserEntity},
    schema::users,
    storage::Storage,
};
use tokio::sync::OnceCell;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

static MIGRATED: OnceCell<()> = OnceCell::const_new();

pub async fn pool() -> Option<DbPool> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };
    MIGRATED
        .get_or_init(|| async {
            db::run_migrations_blocking(MIGRATIONS, &url).await.unwrap();
        })
        .await;
    Some(db::create_pool(&url, 2).await.unwrap())
}

pub fn storage() -> Storage {
    Storage::new(std::env::temp_dir(), "http://localhost/storage")
}

pub fn random_phone() -> String {
    format!("+9639{}", &uuid::Uuid::new_v4().as_u128().to_string()[..8])
}

pub fn new_user(phone: &str, role: Role) -> CreateUserEntity {
    CreateUserEntity {
        name: format!("Test {role}"),
        email: None,
        phone: Some(phone.to_owned()),
        password: None,
        role,
        avatar: None,
        gender: None,
        birthdate: None,
        is_active: true,
        device_token: None,
        device_type: None,
    }
}

pub async fn create_user(conn: &mut AsyncPgConnection, role: Role) -> AuthUser {
    let user: UserEntity = diesel::insert_into(users::table)
        .values(new_user(&random_phone(), role))
        .returning(UserEntity::as_returning())
        .get_result(conn)
        .await
        .unwrap();
    AuthUser { id: user.id, role }
}
