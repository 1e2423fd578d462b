use serde::{Deserialize, Deserializer};
use utoipa_axum::router::OpenApiRouter;
use validator::ValidationError;

use crate::app_state::AppState;

pub mod article_categories;
pub mod article_comments;
pub mod article_images;
pub mod articles;
pub mod auth;
pub mod broadcasting;
pub mod consultation_attachments;
pub mod consultation_messages;
pub mod consultation_status_logs;
pub mod consultations;
pub mod health;
pub mod profile;
pub mod uploads;
pub mod users;

const DEVICE_TYPES: &[&str] = &["android", "ios", "mobile", "web"];

/// Every route served under `/api`.
pub fn api_routes() -> OpenApiRouter<AppState> {
    auth::routes_with_openapi()
        .merge(profile::routes_with_openapi())
        .merge(users::routes_with_openapi())
        .merge(uploads::routes_with_openapi())
        .merge(article_categories::routes_with_openapi())
        .merge(articles::routes_with_openapi())
        .merge(article_comments::routes_with_openapi())
        .merge(article_images::routes_with_openapi())
        .merge(consultations::routes_with_openapi())
        .merge(consultation_messages::routes_with_openapi())
        .merge(consultation_attachments::routes_with_openapi())
        .merge(consultation_status_logs::routes_with_openapi())
        .merge(broadcasting::routes_with_openapi())
}

pub(crate) fn validate_device_type(value: &str) -> Result<(), ValidationError> {
    if DEVICE_TYPES.contains(&value) {
        Ok(())
    } else {
        let mut error = ValidationError::new("device_type");
        error.message = Some("The device type must be one of android, ios, mobile, web".into());
        Err(error)
    }
}

/// For nullable fields in partial updates: missing keeps the value, `null` clears it.
/// Use together with `#[serde(default)]`.
pub(crate) fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
