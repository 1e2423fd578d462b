use std::path::Path as FsPath;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State},
    response::IntoResponse,
};
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use uuid::Uuid;

use crate::{
    app_error::{AppError, ErrorResponse, StdResponse},
    app_state::AppState,
    auth::AuthUser,
    policy::{self, Action},
    storage,
};

const MAX_FILE_BYTES: usize = 20 * 1024 * 1024;
const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
const MAX_REQUEST_BYTES: usize = 100 * 1024 * 1024;
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(utoipa_axum::routes!(upload_files))
        .routes(utoipa_axum::routes!(upload_images))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
}

struct Upload {
    original_name: String,
    bytes: Bytes,
}

/// Reads every part named `field` (or `field[]`) plus the `folder` text part.
async fn read_parts(
    mut multipart: Multipart,
    field: &'static str,
) -> Result<(String, Vec<Upload>), AppError> {
    let mut folder = None;
    let mut uploads = Vec::new();
    let array_field = format!("{field}[]");

    while let Some(part) = multipart.next_field().await? {
        let name = part.name().unwrap_or_default().to_string();
        if name == "folder" {
            folder = Some(part.text().await?);
        } else if name == field || name == array_field {
            let original_name = part.file_name().unwrap_or("upload").to_string();
            let bytes = part.bytes().await?;
            uploads.push(Upload {
                original_name,
                bytes,
            });
        }
    }

    let folder = folder
        .map(|f| f.trim().trim_matches('/').to_string())
        .filter(|f| !f.is_empty() && !f.split('/').any(|segment| segment == ".."))
        .ok_or_else(|| AppError::invalid_field("folder", "The folder field is required"))?;
    if uploads.is_empty() {
        return Err(AppError::invalid_field(field, "At least one file is required"));
    }
    Ok((folder, uploads))
}

fn extension(file_name: &str) -> String {
    FsPath::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// Checks the leading bytes against the image formats accepted for upload.
fn looks_like_image(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0xFF, 0xD8, 0xFF])
        || bytes.starts_with(b"\x89PNG\r\n\x1a\n")
        || bytes.starts_with(b"GIF87a")
        || bytes.starts_with(b"GIF89a")
        || (bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP")
}

fn stored_name(ext: &str) -> String {
    if ext.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        format!("{}.{}", Uuid::new_v4(), ext)
    }
}

#[derive(Serialize, ToSchema)]
struct UploadedFile {
    pub file_name: String,
    pub file_url: String,
    pub file_type: String,
    pub original_name: String,
}

#[derive(Serialize, ToSchema)]
struct FileUploadRes {
    pub uploaded: Vec<UploadedFile>,
    /// Original names of files that could not be stored.
    pub failed: Vec<String>,
}

/// Upload one or more files into a storage folder.
#[utoipa::path(
    post,
    path = "/files/upload",
    tags = ["Uploads"],
    security(("bearerAuth" = [])),
    request_body(content_type = "multipart/form-data", description = "`files` parts and a `folder` field"),
    responses(
        (status = 200, description = "Files uploaded successfully", body = StdResponse<FileUploadRes>),
        (status = 403, description = "Not staff", body = ErrorResponse)
    )
)]
async fn upload_files(
    State(state): State<AppState>,
    user: AuthUser,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::UploadFiles)?;
    let (folder, uploads) = read_parts(multipart, "files").await?;

    let mut uploaded = Vec::new();
    let mut failed = Vec::new();
    for upload in uploads {
        let ext = extension(&upload.original_name);
        if upload.bytes.len() > MAX_FILE_BYTES {
            failed.push(upload.original_name);
            continue;
        }
        let file_name = stored_name(&ext);
        let key = storage::key(&folder, &file_name);
        match state.storage.put(&key, &upload.bytes).await {
            Ok(()) => uploaded.push(UploadedFile {
                file_url: state.storage.url(&key),
                file_type: if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
                    "image".to_string()
                } else {
                    ext
                },
                file_name,
                original_name: upload.original_name,
            }),
            Err(err) => {
                tracing::warn!("Failed to store {}: {:?}", upload.original_name, err);
                failed.push(upload.original_name);
            }
        }
    }

    tracing::info!(
        "User #{} uploaded {} file(s) to {} ({} failed)",
        user.id,
        uploaded.len(),
        folder,
        failed.len()
    );
    Ok(StdResponse::ok(
        FileUploadRes { uploaded, failed },
        "Files uploaded successfully",
    ))
}

#[derive(Serialize, ToSchema)]
struct UploadedImage {
    pub image_name: String,
    pub image_url: String,
}

#[derive(Serialize, ToSchema)]
struct ImageUploadRes {
    pub uploaded: Vec<UploadedImage>,
    pub failed: Vec<String>,
}

/// Upload one or more images into a storage folder.
#[utoipa::path(
    post,
    path = "/images/upload",
    tags = ["Uploads"],
    security(("bearerAuth" = [])),
    request_body(content_type = "multipart/form-data", description = "`images` parts and a `folder` field"),
    responses(
        (status = 200, description = "Images uploaded successfully", body = StdResponse<ImageUploadRes>),
        (status = 403, description = "Not staff", body = ErrorResponse)
    )
)]
async fn upload_images(
    State(state): State<AppState>,
    user: AuthUser,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    policy::authorize(&user, Action::UploadFiles)?;
    let (folder, uploads) = read_parts(multipart, "images").await?;

    let mut uploaded = Vec::new();
    let mut failed = Vec::new();
    for upload in uploads {
        let ext = extension(&upload.original_name);
        if upload.bytes.len() > MAX_IMAGE_BYTES
            || !IMAGE_EXTENSIONS.contains(&ext.as_str())
            || !looks_like_image(&upload.bytes)
        {
            failed.push(upload.original_name);
            continue;
        }
        let image_name = stored_name(&ext);
        let key = storage::key(&folder, &image_name);
        match state.storage.put(&key, &upload.bytes).await {
            Ok(()) => uploaded.push(UploadedImage {
                image_url: state.storage.url(&key),
                image_name,
            }),
            Err(err) => {
                tracing::warn!("Failed to store {}: {:?}", upload.original_name, err);
                failed.push(upload.original_name);
            }
        }
    }

    Ok(StdResponse::ok(
        ImageUploadRes { uploaded, failed },
        "Images uploaded successfully",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_are_lowercased() {
        assert_eq!(extension("Scan.PDF"), "pdf");
        assert_eq!(extension("README"), "");
    }

    #[test]
    fn image_sniffing() {
        assert!(looks_like_image(b"\x89PNG\r\n\x1a\n...."));
        assert!(looks_like_image(&[0xFF, 0xD8, 0xFF, 0xE0]));
        assert!(looks_like_image(b"RIFF\x00\x00\x00\x00WEBPVP8 "));
        assert!(!looks_like_image(b"%PDF-1.7"));
        assert!(!looks_like_image(b""));
    }

    #[test]
    fn stored_names_keep_the_extension() {
        let name = stored_name("png");
        assert!(name.ends_with(".png"));
        assert_eq!(name.len(), 36 + 4);
        assert_eq!(stored_name("").len(), 36);
    }
}
