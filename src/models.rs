use chrono::{DateTime, NaiveDate, Utc};
use diesel::{
    Selectable,
    prelude::{AsChangeset, Identifiable, Insertable, Queryable},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::enums::{ActorType, ConsultationStatus, Gender, Role, SenderType};

// Users

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct UserEntity {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub role: Role,
    pub avatar: Option<String>,
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

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::users)]
pub struct CreateUserEntity {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub password: Option<String>,
    pub role: Role,
    pub avatar: Option<String>,
    pub gender: Option<Gender>,
    pub birthdate: Option<NaiveDate>,
    pub is_active: bool,
    pub device_token: Option<String>,
    pub device_type: Option<String>,
}

/// Partial user update. `None` leaves a column untouched, `Some(None)` clears it.
#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = crate::schema::users)]
pub struct UpdateUserEntity {
    pub name: Option<String>,
    pub email: Option<Option<String>>,
    pub phone: Option<Option<String>>,
    pub password: Option<Option<String>>,
    pub role: Option<Role>,
    pub avatar: Option<Option<String>>,
    pub gender: Option<Option<Gender>>,
    pub birthdate: Option<Option<NaiveDate>>,
    pub blood_type: Option<Option<String>>,
    pub allergy: Option<Option<String>>,
    pub chronic_diseases: Option<Option<String>>,
    pub is_active: Option<bool>,
    pub device_token: Option<Option<String>>,
    pub device_type: Option<Option<String>>,
}

impl UpdateUserEntity {
    /// Diesel refuses to run an UPDATE without columns.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.email.is_none()
            && self.phone.is_none()
            && self.password.is_none()
            && self.role.is_none()
            && self.avatar.is_none()
            && self.gender.is_none()
            && self.birthdate.is_none()
            && self.blood_type.is_none()
            && self.allergy.is_none()
            && self.chronic_diseases.is_none()
            && self.is_active.is_none()
            && self.device_token.is_none()
            && self.device_type.is_none()
    }
}

// Articles

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::article_categories)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ArticleCategoryEntity {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, AsChangeset, Deserialize, Debug)]
#[diesel(table_name = crate::schema::article_categories)]
pub struct CreateArticleCategoryEntity {
    pub name: String,
}

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::articles)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ArticleEntity {
    pub id: i64,
    pub doctor_id: Option<i64>,
    pub category_id: i64,
    pub title: String,
    pub short_description: Option<String>,
    pub content: String,
    pub views_count: i64,
    pub is_published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::articles)]
pub struct CreateArticleEntity {
    pub doctor_id: Option<i64>,
    pub category_id: i64,
    pub title: String,
    pub short_description: Option<String>,
    pub content: String,
    pub views_count: i64,
    pub is_published: bool,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = crate::schema::articles)]
pub struct UpdateArticleEntity {
    pub doctor_id: Option<Option<i64>>,
    pub category_id: Option<i64>,
    pub title: Option<String>,
    pub short_description: Option<Option<String>>,
    pub content: Option<String>,
    pub is_published: Option<bool>,
    pub published_at: Option<Option<DateTime<Utc>>>,
}

impl UpdateArticleEntity {
    pub fn is_empty(&self) -> bool {
        self.doctor_id.is_none()
            && self.category_id.is_none()
            && self.title.is_none()
            && self.short_description.is_none()
            && self.content.is_none()
            && self.is_published.is_none()
            && self.published_at.is_none()
    }
}

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::article_comments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ArticleCommentEntity {
    pub id: i64,
    pub article_id: i64,
    pub user_id: i64,
    pub parent_id: Option<i64>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::article_comments)]
pub struct CreateArticleCommentEntity {
    pub article_id: i64,
    pub user_id: i64,
    pub parent_id: Option<i64>,
    pub content: String,
}

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::article_images)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ArticleImageEntity {
    pub id: i64,
    pub article_id: i64,
    pub image_name: String,
    pub folder: String,
    pub is_cover: bool,
    pub caption: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::article_images)]
pub struct CreateArticleImageEntity {
    pub article_id: i64,
    pub image_name: String,
    pub folder: String,
    pub is_cover: bool,
    pub caption: Option<String>,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = crate::schema::article_images)]
pub struct UpdateArticleImageEntity {
    pub article_id: Option<i64>,
    pub image_name: Option<String>,
    pub folder: Option<String>,
    pub is_cover: Option<bool>,
    pub caption: Option<Option<String>>,
}

impl UpdateArticleImageEntity {
    pub fn is_empty(&self) -> bool {
        self.article_id.is_none()
            && self.image_name.is_none()
            && self.folder.is_none()
            && self.is_cover.is_none()
            && self.caption.is_none()
    }
}

// Consultations

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::consultations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ConsultationEntity {
    pub id: i64,
    pub patient_id: i64,
    pub doctor_id: Option<i64>,
    pub status: ConsultationStatus,
    pub closed_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_sender_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::consultations)]
pub struct CreateConsultationEntity {
    pub patient_id: i64,
    pub doctor_id: Option<i64>,
    pub status: ConsultationStatus,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = crate::schema::consultations)]
pub struct UpdateConsultationEntity {
    pub doctor_id: Option<Option<i64>>,
    pub status: Option<ConsultationStatus>,
    pub closed_at: Option<Option<DateTime<Utc>>>,
}

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::consultation_messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ConsultationMessageEntity {
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
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::consultation_messages)]
pub struct CreateConsultationMessageEntity {
    pub consultation_id: i64,
    pub sender_id: i64,
    pub sender_type: SenderType,
    pub subject: Option<String>,
    pub message: Option<String>,
    pub read_by_patient: bool,
    pub read_by_doctor: bool,
}

impl CreateConsultationMessageEntity {
    /// Builds a new message row with read flags set for the sender's side only.
    pub fn new(
        consultation_id: i64,
        sender_id: i64,
        sender_type: SenderType,
        subject: Option<String>,
        message: String,
    ) -> Self {
        let (read_by_patient, read_by_doctor) = sender_type.initial_read_flags();
        Self {
            consultation_id,
            sender_id,
            sender_type,
            subject,
            message: Some(message),
            read_by_patient,
            read_by_doctor,
        }
    }
}

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::consultation_attachments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ConsultationAttachmentEntity {
    pub id: i64,
    pub consultation_message_id: Option<i64>,
    pub consultation_id: i64,
    pub file_name: Option<String>,
    pub original_name: Option<String>,
    pub file_path: Option<String>,
    pub file_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::consultation_attachments)]
pub struct CreateConsultationAttachmentEntity {
    pub consultation_message_id: Option<i64>,
    pub consultation_id: i64,
    pub file_name: Option<String>,
    pub original_name: Option<String>,
    pub file_path: Option<String>,
    pub file_type: Option<String>,
}

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::consultation_status_logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ConsultationStatusLogEntity {
    pub id: i64,
    pub consultation_id: i64,
    pub from_status: ConsultationStatus,
    pub to_status: ConsultationStatus,
    pub changed_by_id: Option<i64>,
    pub changed_by_type: ActorType,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::consultation_status_logs)]
pub struct CreateConsultationStatusLogEntity {
    pub consultation_id: i64,
    pub from_status: ConsultationStatus,
    pub to_status: ConsultationStatus,
    pub changed_by_id: Option<i64>,
    pub changed_by_type: ActorType,
    pub note: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patient_message_is_unread_for_doctor() {
        let row =
            CreateConsultationMessageEntity::new(5, 1, SenderType::Patient, None, "hi".into());
        assert!(row.read_by_patient);
        assert!(!row.read_by_doctor);
        assert_eq!(row.message.as_deref(), Some("hi"));
    }

    #[test]
    fn doctor_message_is_unread_for_patient() {
        let row = CreateConsultationMessageEntity::new(
            5,
            2,
            SenderType::Doctor,
            Some("Follow-up".into()),
            "Take rest".into(),
        );
        assert!(!row.read_by_patient);
        assert!(row.read_by_doctor);
    }
}
