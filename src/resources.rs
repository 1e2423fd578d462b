//! Response projections. Entities never leave the service directly; handlers
//! turn them into these shapes, attaching related rows and public URLs.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    enums::{ActorType, ConsultationStatus, Gender, Role, SenderType},
    models::{
        ArticleCategoryEntity, ArticleCommentEntity, ArticleEntity, ArticleImageEntity,
        ConsultationAttachmentEntity, ConsultationEntity, ConsultationMessageEntity,
        ConsultationStatusLogEntity, UserEntity,
    },
    storage::{self, Storage},
};

pub const AVATAR_FOLDER: &str = "users";
const ATTACHMENT_FOLDER: &str = "consultations/attachments";

fn avatar_url(storage: &Storage, avatar: Option<&str>) -> Option<String> {
    avatar.map(|name| storage.url(&storage::key(AVATAR_FOLDER, name)))
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct UserRes {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: Role,
    pub avatar: Option<String>,
    pub avatar_url: Option<String>,
    pub gender: Option<Gender>,
    pub birthdate: Option<NaiveDate>,
    pub blood_type: Option<String>,
    pub allergy: Option<String>,
    pub chronic_diseases: Option<String>,
    pub is_active: bool,
    pub device_token: Option<String>,
    pub device_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRes {
    pub fn new(user: UserEntity, storage: &Storage) -> Self {
        Self {
            avatar_url: avatar_url(storage, user.avatar.as_deref()),
            id: user.id,
            name: user.name,
            email: user.email,
            phone: user.phone,
            role: user.role,
            avatar: user.avatar,
            gender: user.gender,
            birthdate: user.birthdate,
            blood_type: user.blood_type,
            allergy: user.allergy,
            chronic_diseases: user.chronic_diseases,
            is_active: user.is_active,
            device_token: user.device_token,
            device_type: user.device_type,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

/// Compact user shape embedded in consultations and messages.
#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct UserSummaryRes {
    pub id: i64,
    pub name: String,
    pub role: Role,
    pub avatar_url: Option<String>,
}

impl UserSummaryRes {
    pub fn new(user: &UserEntity, storage: &Storage) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            role: user.role,
            avatar_url: avatar_url(storage, user.avatar.as_deref()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct AttachmentRes {
    pub id: i64,
    pub consultation_id: i64,
    pub consultation_message_id: Option<i64>,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub file_url: Option<String>,
    pub original_name: Option<String>,
}

impl AttachmentRes {
    pub fn new(attachment: ConsultationAttachmentEntity, storage: &Storage) -> Self {
        let file_url = attachment.file_name.as_deref().map(|name| {
            let key = attachment
                .file_path
                .clone()
                .unwrap_or_else(|| storage::key(ATTACHMENT_FOLDER, name));
            storage.url(&key)
        });
        Self {
            id: attachment.id,
            consultation_id: attachment.consultation_id,
            consultation_message_id: attachment.consultation_message_id,
            file_name: attachment.file_name,
            file_type: attachment.file_type,
            file_url,
            original_name: attachment.original_name,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct MessageRes {
    pub id: i64,
    pub consultation_id: i64,
    pub sender_id: i64,
    pub sender_type: SenderType,
    pub subject: Option<String>,
    pub message: Option<String>,
    pub read_by_patient: bool,
    pub read_by_doctor: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub sender: Option<UserSummaryRes>,
    pub attachments: Vec<AttachmentRes>,
}

impl MessageRes {
    pub fn new(
        message: ConsultationMessageEntity,
        sender: Option<UserSummaryRes>,
        attachments: Vec<AttachmentRes>,
    ) -> Self {
        Self {
            id: message.id,
            consultation_id: message.consultation_id,
            sender_id: message.sender_id,
            sender_type: message.sender_type,
            subject: message.subject,
            message: message.message,
            read_by_patient: message.read_by_patient,
            read_by_doctor: message.read_by_doctor,
            deleted_at: message.deleted_at,
            created_at: message.created_at,
            sender,
            attachments,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct StatusLogRes {
    pub id: i64,
    pub consultation_id: i64,
    pub from_status: ConsultationStatus,
    pub to_status: ConsultationStatus,
    pub changed_by_id: Option<i64>,
    pub changed_by_type: ActorType,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub changer: Option<UserRes>,
}

impl StatusLogRes {
    pub fn new(log: ConsultationStatusLogEntity, changer: Option<UserRes>) -> Self {
        Self {
            id: log.id,
            consultation_id: log.consultation_id,
            from_status: log.from_status,
            to_status: log.to_status,
            changed_by_id: log.changed_by_id,
            changed_by_type: log.changed_by_type,
            note: log.note,
            created_at: log.created_at,
            changer,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct ConsultationRes {
    pub id: i64,
    pub patient_id: i64,
    pub doctor_id: Option<i64>,
    pub status: ConsultationStatus,
    pub closed_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_sender_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub patient: Option<UserSummaryRes>,
    pub doctor: Option<UserSummaryRes>,
    pub last_sender: Option<UserSummaryRes>,
    pub messages: Vec<MessageRes>,
    pub attachments: Vec<AttachmentRes>,
    pub status_logs: Vec<StatusLogRes>,
}

// Articles

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct ArticleImageRes {
    pub id: i64,
    pub article_id: i64,
    pub image_name: String,
    pub folder: String,
    pub is_cover: bool,
    pub caption: Option<String>,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ArticleImageRes {
    pub fn new(image: ArticleImageEntity, storage: &Storage) -> Self {
        Self {
            image_url: storage.url(&storage::key(&image.folder, &image.image_name)),
            id: image.id,
            article_id: image.article_id,
            image_name: image.image_name,
            folder: image.folder,
            is_cover: image.is_cover,
            caption: image.caption,
            created_at: image.created_at,
            updated_at: image.updated_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct CommentAuthorRes {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub avatar: Option<String>,
}

impl CommentAuthorRes {
    pub fn new(user: Option<&UserEntity>) -> Self {
        Self {
            id: user.map(|u| u.id),
            name: user.map(|u| u.name.clone()),
            avatar: user.and_then(|u| u.avatar.clone()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct CommentRes {
    pub id: i64,
    pub article_id: i64,
    pub user: CommentAuthorRes,
    pub parent_id: Option<i64>,
    pub content: String,
    #[schema(no_recursion)]
    pub children: Vec<CommentRes>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CommentRes {
    pub fn new(
        comment: ArticleCommentEntity,
        user: Option<&UserEntity>,
        children: Vec<CommentRes>,
    ) -> Self {
        Self {
            id: comment.id,
            article_id: comment.article_id,
            user: CommentAuthorRes::new(user),
            parent_id: comment.parent_id,
            content: comment.content,
            children,
            created_at: comment.created_at,
            updated_at: comment.updated_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct ArticleAuthorRes {
    pub id: i64,
    pub name: String,
    pub avatar: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct ArticleCategoryRes {
    pub id: i64,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct ArticleRes {
    pub id: i64,
    pub doctor: Option<ArticleAuthorRes>,
    pub category: Option<ArticleCategoryRes>,
    pub title: String,
    pub short_description: Option<String>,
    pub content: String,
    pub views_count: i64,
    pub is_published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub images: Vec<ArticleImageRes>,
    pub comments_count: i64,
    pub comments: Vec<CommentRes>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ArticleRes {
    pub fn new(
        article: ArticleEntity,
        doctor: Option<&UserEntity>,
        category: Option<&ArticleCategoryEntity>,
        images: Vec<ArticleImageRes>,
        comments: Vec<CommentRes>,
        comments_count: i64,
        storage: &Storage,
    ) -> Self {
        Self {
            id: article.id,
            doctor: doctor.map(|d| ArticleAuthorRes {
                id: d.id,
                name: d.name.clone(),
                avatar: d.avatar.clone(),
                avatar_url: avatar_url(storage, d.avatar.as_deref()),
            }),
            category: category.map(|c| ArticleCategoryRes {
                id: c.id,
                name: c.name.clone(),
            }),
            title: article.title,
            short_description: article.short_description,
            content: article.content,
            views_count: article.views_count,
            is_published: article.is_published,
            published_at: article.published_at,
            images,
            comments_count,
            comments,
            created_at: article.created_at,
            updated_at: article.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> Storage {
        Storage::new("/tmp/medbook", "http://cdn.test")
    }

    fn attachment(
        file_name: Option<&str>,
        file_path: Option<&str>,
    ) -> ConsultationAttachmentEntity {
        ConsultationAttachmentEntity {
            id: 1,
            consultation_message_id: Some(3),
            consultation_id: 2,
            file_name: file_name.map(Into::into),
            original_name: Some("scan.pdf".into()),
            file_path: file_path.map(Into::into),
            file_type: Some("pdf".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn attachment_url_prefers_stored_path() {
        let res = AttachmentRes::new(attachment(Some("a.pdf"), Some("uploads/a.pdf")), &storage());
        assert_eq!(res.file_url.as_deref(), Some("http://cdn.test/uploads/a.pdf"));
    }

    #[test]
    fn attachment_url_falls_back_to_default_folder() {
        let res = AttachmentRes::new(attachment(Some("a.pdf"), None), &storage());
        assert_eq!(
            res.file_url.as_deref(),
            Some("http://cdn.test/consultations/attachments/a.pdf")
        );
        let res = AttachmentRes::new(attachment(None, Some("uploads/a.pdf")), &storage());
        assert_eq!(res.file_url, None);
    }

    #[test]
    fn comment_author_tolerates_missing_user() {
        let author = CommentAuthorRes::new(None);
        assert!(author.id.is_none() && author.name.is_none());
    }
}
