use axum::{
    Json,
    extract::{FromRequest, Request, multipart::MultipartError, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

use crate::{aliases::DieselError, pagination::PageMeta};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Unauthenticated")]
    Unauthorized,

    #[error("Unauthorized: Invalid API Key")]
    InvalidApiKey,

    #[error("Invalid OTP")]
    InvalidOtp,

    #[error("{0}")]
    ForbiddenResource(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Validation failed")]
    ValidationFailed(#[from] ValidationErrors),

    #[error("{message}")]
    InvalidBody { status: StatusCode, message: String },

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized | AppError::InvalidApiKey | AppError::InvalidOtp => {
                StatusCode::UNAUTHORIZED
            }
            AppError::ForbiddenResource(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ValidationFailed(_) | AppError::Conflict(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AppError::InvalidBody { status, .. } => *status,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Single-field validation error, for checks that need the database.
    pub fn invalid_field(field: &'static str, message: &'static str) -> Self {
        let mut errors = ValidationErrors::new();
        let mut error = validator::ValidationError::new("invalid");
        error.message = Some(message.into());
        errors.add(field, error);
        AppError::ValidationFailed(errors)
    }
}

impl From<DieselError> for AppError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => AppError::NotFound("Resource"),
            other => AppError::Other(other.into()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::InvalidBody {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::InvalidBody {
            status: err.status(),
            message: err.body_text(),
        }
    }
}

/// Failure envelope: `{status, message, errors}`.
#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
    #[schema(value_type = Object)]
    pub errors: Value,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let errors = match &self {
            AppError::ValidationFailed(errors) => {
                serde_json::to_value(errors).unwrap_or_else(|_| json!({}))
            }
            AppError::InvalidBody { message, .. } => json!({ "body": [message] }),
            _ => json!({}),
        };
        let message = match &self {
            AppError::Other(err) => {
                tracing::error!("Internal error: {:?}", err);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        (
            status,
            Json(ErrorResponse {
                status: status.as_u16(),
                message,
                errors,
            }),
        )
            .into_response()
    }
}

/// Success envelope: `{status, message, data, meta?}`.
#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct StdResponse<T> {
    pub status: u16,
    pub message: String,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub meta: Option<PageMeta>,
}

impl<T> StdResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK.as_u16(),
            message: message.into(),
            data: Some(data),
            meta: None,
        }
    }

    pub fn created(data: T, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CREATED.as_u16(),
            ..Self::ok(data, message)
        }
    }

    pub fn paginated(data: T, meta: PageMeta, message: impl Into<String>) -> Self {
        Self {
            meta: Some(meta),
            ..Self::ok(data, message)
        }
    }
}

impl StdResponse<()> {
    pub fn empty(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK.as_u16(),
            message: message.into(),
            data: None,
            meta: None,
        }
    }
}

impl<T: Serialize> IntoResponse for StdResponse<T> {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        (status, Json(self)).into_response()
    }
}

/// JSON body extractor that runs `validator` rules and reports failures in
/// the standard error envelope.
pub struct ValidJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate + Send,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(ValidJson(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn conflict_uses_422_envelope() {
        let response = AppError::Conflict("Status is already set to the requested value".into())
            .into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["status"], 422);
        assert_eq!(body["message"], "Status is already set to the requested value");
        assert_eq!(body["errors"], json!({}));
    }

    #[tokio::test]
    async fn internal_errors_hide_details() {
        let response = AppError::Other(anyhow::anyhow!("connection reset")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Internal server error");
    }

    #[tokio::test]
    async fn field_errors_are_listed() {
        let response = AppError::invalid_field("patient_id", "The selected patient does not exist")
            .into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(
            body["errors"]["patient_id"][0]["message"],
            "The selected patient does not exist"
        );
    }

    #[tokio::test]
    async fn success_envelope_omits_missing_meta() {
        let response = StdResponse::created(json!({"id": 1}), "Created").into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["status"], 201);
        assert_eq!(body["data"]["id"], 1);
        assert!(body.get("meta").is_none());
    }

    #[test]
    fn diesel_not_found_maps_to_404() {
        let err: AppError = DieselError::NotFound.into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
