use std::collections::HashMap;

use anyhow::Context;
use chrono::NaiveDate;
use diesel::{
    BoolExpressionMethods, ExpressionMethods, OptionalExtension, PgTextExpressionMethods, QueryDsl,
    SelectableHelper, pg::Pg,
};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};

use crate::{
    app_error::AppError,
    auth::AuthUser,
    broadcast::{Broadcaster, ConsultationEvent},
    enums::{Role, SenderType},
    models::{
        ConsultationAttachmentEntity, ConsultationMessageEntity,
        CreateConsultationAttachmentEntity, CreateConsultationMessageEntity,
    },
    pagination::{PageMeta, PageParams},
    policy::{self, Action, Participants},
    resources::{AttachmentRes, MessageRes, UserSummaryRes},
    schema::{consultation_attachments, consultation_messages, consultations},
    services::{day_after, day_start, like_pattern, user_exists, users_by_id},
    storage::Storage,
};

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub file_name: String,
    pub original_name: String,
    pub file_path: String,
    pub file_type: String,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub consultation_id: i64,
    pub sender_id: i64,
    pub sender_type: SenderType,
    pub subject: Option<String>,
    pub message: String,
    pub attachments: Vec<NewAttachment>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilters {
    pub sender_id: Option<i64>,
    pub sender_type: Option<SenderType>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub search: Option<String>,
}

/// Which side's read flag a caller counts against.
pub fn reader_side(user: &AuthUser) -> SenderType {
    match user.role {
        Role::Patient => SenderType::Patient,
        Role::Doctor | Role::Admin | Role::Receptionist => SenderType::Doctor,
    }
}

/// Attaches senders and attachments to a batch of messages, preserving order.
pub async fn project(
    conn: &mut AsyncPgConnection,
    storage: &Storage,
    messages: Vec<ConsultationMessageEntity>,
) -> Result<Vec<MessageRes>, AppError> {
    if messages.is_empty() {
        return Ok(vec![]);
    }

    let message_ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
    let senders = users_by_id(conn, messages.iter().map(|m| m.sender_id).collect()).await?;

    let attachments: Vec<ConsultationAttachmentEntity> = consultation_attachments::table
        .filter(consultation_attachments::consultation_message_id.eq_any(&message_ids))
        .order_by(consultation_attachments::id.asc())
        .select(ConsultationAttachmentEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to load message attachments")?;

    let mut group: HashMap<i64, Vec<AttachmentRes>> = HashMap::new();
    for attachment in attachments {
        if let Some(message_id) = attachment.consultation_message_id {
            group
                .entry(message_id)
                .or_default()
                .push(AttachmentRes::new(attachment, storage));
        }
    }

    Ok(messages
        .into_iter()
        .map(|message| {
            let sender = senders
                .get(&message.sender_id)
                .map(|user| UserSummaryRes::new(user, storage));
            let attachments = group.remove(&message.id).unwrap_or_default();
            MessageRes::new(message, sender, attachments)
        })
        .collect())
}

pub async fn project_one(
    conn: &mut AsyncPgConnection,
    storage: &Storage,
    message: ConsultationMessageEntity,
) -> Result<MessageRes, AppError> {
    project(conn, storage, vec![message])
        .await?
        .pop()
        .ok_or(AppError::NotFound("Message"))
}

async fn find_live(
    conn: &mut AsyncPgConnection,
    id: i64,
) -> Result<ConsultationMessageEntity, AppError> {
    consultation_messages::table
        .find(id)
        .filter(consultation_messages::deleted_at.is_null())
        .select(ConsultationMessageEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to load message")?
        .ok_or(AppError::NotFound("Message"))
}

pub async fn get(
    conn: &mut AsyncPgConnection,
    storage: &Storage,
    id: i64,
) -> Result<MessageRes, AppError> {
    let message = find_live(conn, id).await?;
    project_one(conn, storage, message).await
}

/// Stores a message with its attachments and bumps the consultation's
/// last-message fields in one transaction, then announces it on the
/// consultation channel. The consultation row stays locked until commit.
pub async fn send(
    conn: &mut AsyncPgConnection,
    storage: &Storage,
    broadcaster: &Broadcaster,
    new: NewMessage,
) -> Result<MessageRes, AppError> {
    let message = conn
        .transaction(move |conn| {
            Box::pin(async move {
                consultations::table
                    .find(new.consultation_id)
                    .select(consultations::id)
                    .for_update()
                    .first::<i64>(conn)
                    .await
                    .optional()
                    .context("Failed to lock consultation")?
                    .ok_or(AppError::NotFound("Consultation"))?;
                if !user_exists(conn, new.sender_id).await? {
                    return Err(AppError::invalid_field(
                        "sender_id",
                        "The selected sender does not exist",
                    ));
                }

                let message: ConsultationMessageEntity =
                    diesel::insert_into(consultation_messages::table)
                        .values(CreateConsultationMessageEntity::new(
                            new.consultation_id,
                            new.sender_id,
                            new.sender_type,
                            new.subject,
                            new.message,
                        ))
                        .returning(ConsultationMessageEntity::as_returning())
                        .get_result(conn)
                        .await
                        .context("Failed to create message")?;

                if !new.attachments.is_empty() {
                    let rows: Vec<CreateConsultationAttachmentEntity> = new
                        .attachments
                        .into_iter()
                        .map(|attachment| CreateConsultationAttachmentEntity {
                            consultation_message_id: Some(message.id),
                            consultation_id: message.consultation_id,
                            file_name: Some(attachment.file_name),
                            original_name: Some(attachment.original_name),
                            file_path: Some(attachment.file_path),
                            file_type: Some(attachment.file_type),
                        })
                        .collect();

                    diesel::insert_into(consultation_attachments::table)
                        .values(rows)
                        .execute(conn)
                        .await
                        .context("Failed to create message attachments")?;
                }

                diesel::update(consultations::table.find(message.consultation_id))
                    .set((
                        consultations::last_message_at.eq(message.created_at),
                        consultations::last_sender_id.eq(message.sender_id),
                    ))
                    .execute(conn)
                    .await
                    .context("Failed to update consultation last message")?;

                Ok::<ConsultationMessageEntity, AppError>(message)
            })
        })
        .await?;

    tracing::info!(
        "Message #{} sent on consultation #{} by {} #{}",
        message.id,
        message.consultation_id,
        message.sender_type,
        message.sender_id
    );

    let res = project_one(conn, storage, message).await?;
    broadcaster.publish(ConsultationEvent::NewConsultationMessage {
        message: res.clone(),
    });
    Ok(res)
}

/// Sets the reader's flag. Marking an already-read message again is a no-op
/// that still re-announces the message.
pub async fn mark_read(
    conn: &mut AsyncPgConnection,
    storage: &Storage,
    broadcaster: &Broadcaster,
    id: i64,
    reader: SenderType,
) -> Result<MessageRes, AppError> {
    let target = consultation_messages::table
        .filter(consultation_messages::id.eq(id))
        .filter(consultation_messages::deleted_at.is_null());

    let updated: Option<ConsultationMessageEntity> = match reader {
        SenderType::Patient => diesel::update(target)
            .set(consultation_messages::read_by_patient.eq(true))
            .returning(ConsultationMessageEntity::as_returning())
            .get_result(conn)
            .await
            .optional(),
        SenderType::Doctor => diesel::update(target)
            .set(consultation_messages::read_by_doctor.eq(true))
            .returning(ConsultationMessageEntity::as_returning())
            .get_result(conn)
            .await
            .optional(),
    }
    .context("Failed to mark message as read")?;

    let message = updated.ok_or(AppError::NotFound("Message"))?;
    let res = project_one(conn, storage, message).await?;
    broadcaster.publish(ConsultationEvent::NewConsultationMessage {
        message: res.clone(),
    });
    Ok(res)
}

pub async fn participants(
    conn: &mut AsyncPgConnection,
    consultation_id: i64,
) -> Result<Participants, AppError> {
    let (patient_id, doctor_id): (i64, Option<i64>) = consultations::table
        .find(consultation_id)
        .select((consultations::patient_id, consultations::doctor_id))
        .first(conn)
        .await
        .optional()
        .context("Failed to load consultation")?
        .ok_or(AppError::NotFound("Consultation"))?;

    Ok(Participants {
        patient_id,
        doctor_id,
    })
}

/// Messages from the other side that the caller's side has not read yet.
pub async fn unread_count(
    conn: &mut AsyncPgConnection,
    consultation_id: i64,
    user: &AuthUser,
) -> Result<i64, AppError> {
    let participants = participants(conn, consultation_id).await?;
    policy::authorize(user, Action::ViewUnreadCount(participants))?;

    let reader = reader_side(user);
    let mut query = consultation_messages::table
        .filter(consultation_messages::consultation_id.eq(consultation_id))
        .filter(consultation_messages::deleted_at.is_null())
        .filter(consultation_messages::sender_type.eq(reader.counterpart()))
        .into_boxed::<Pg>();

    query = match reader {
        SenderType::Doctor => query.filter(consultation_messages::read_by_doctor.eq(false)),
        SenderType::Patient => query.filter(consultation_messages::read_by_patient.eq(false)),
    };

    let count: i64 = query
        .count()
        .get_result(conn)
        .await
        .context("Failed to count unread messages")?;
    Ok(count)
}

pub async fn last_message(
    conn: &mut AsyncPgConnection,
    storage: &Storage,
    consultation_id: i64,
) -> Result<MessageRes, AppError> {
    let message: ConsultationMessageEntity = consultation_messages::table
        .filter(consultation_messages::consultation_id.eq(consultation_id))
        .filter(consultation_messages::deleted_at.is_null())
        .order_by((
            consultation_messages::created_at.desc(),
            consultation_messages::id.desc(),
        ))
        .select(ConsultationMessageEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to load last message")?
        .ok_or(AppError::NotFound("Message"))?;

    project_one(conn, storage, message).await
}

/// Replaces the text of a message. Sender fields never change.
pub async fn update(
    conn: &mut AsyncPgConnection,
    storage: &Storage,
    id: i64,
    subject: Option<String>,
    message: String,
) -> Result<MessageRes, AppError> {
    let updated: ConsultationMessageEntity = diesel::update(
        consultation_messages::table
            .filter(consultation_messages::id.eq(id))
            .filter(consultation_messages::deleted_at.is_null()),
    )
    .set((
        consultation_messages::subject.eq(subject),
        consultation_messages::message.eq(Some(message)),
    ))
    .returning(ConsultationMessageEntity::as_returning())
    .get_result(conn)
    .await
    .optional()
    .context("Failed to update message")?
    .ok_or(AppError::NotFound("Message"))?;

    project_one(conn, storage, updated).await
}

pub async fn soft_delete(conn: &mut AsyncPgConnection, id: i64) -> Result<(), AppError> {
    let affected = diesel::update(
        consultation_messages::table
            .filter(consultation_messages::id.eq(id))
            .filter(consultation_messages::deleted_at.is_null()),
    )
    .set(consultation_messages::deleted_at.eq(diesel::dsl::now))
    .execute(conn)
    .await
    .context("Failed to delete message")?;

    if affected == 0 {
        return Err(AppError::NotFound("Message"));
    }
    Ok(())
}

fn filtered(
    consultation_id: i64,
    filters: &MessageFilters,
) -> consultation_messages::BoxedQuery<'static, Pg> {
    let mut query = consultation_messages::table
        .filter(consultation_messages::consultation_id.eq(consultation_id))
        .filter(consultation_messages::deleted_at.is_null())
        .into_boxed();

    if let Some(sender_id) = filters.sender_id {
        query = query.filter(consultation_messages::sender_id.eq(sender_id));
    }
    if let Some(sender_type) = filters.sender_type {
        query = query.filter(consultation_messages::sender_type.eq(sender_type));
    }
    if let Some(from) = filters.from_date {
        query = query.filter(consultation_messages::created_at.ge(day_start(from)));
    }
    if let Some(to) = filters.to_date {
        query = query.filter(consultation_messages::created_at.lt(day_after(to)));
    }
    if let Some(search) = filters.search.as_deref().filter(|s| !s.is_empty()) {
        let pattern = like_pattern(search);
        query = query.filter(
            consultation_messages::message
                .ilike(pattern.clone())
                .or(consultation_messages::subject.ilike(pattern)),
        );
    }
    query
}

/// Oldest first, so a page reads like a conversation.
pub async fn list(
    conn: &mut AsyncPgConnection,
    storage: &Storage,
    consultation_id: i64,
    filters: &MessageFilters,
    page: PageParams,
) -> Result<(Vec<MessageRes>, PageMeta), AppError> {
    let total: i64 = filtered(consultation_id, filters)
        .count()
        .get_result(conn)
        .await
        .context("Failed to count messages")?;

    let messages: Vec<ConsultationMessageEntity> = filtered(consultation_id, filters)
        .order_by((
            consultation_messages::created_at.asc(),
            consultation_messages::id.asc(),
        ))
        .limit(page.limit())
        .offset(page.offset())
        .select(ConsultationMessageEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get messages")?;

    let messages = project(conn, storage, messages).await?;
    Ok((messages, PageMeta::new(total, page)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_count_the_other_side() {
        let doctor = AuthUser { id: 2, role: Role::Doctor };
        let admin = AuthUser { id: 9, role: Role::Admin };
        let patient = AuthUser { id: 1, role: Role::Patient };
        assert_eq!(reader_side(&doctor), SenderType::Doctor);
        assert_eq!(reader_side(&admin), SenderType::Doctor);
        assert_eq!(reader_side(&patient), SenderType::Patient);
        assert_eq!(reader_side(&patient).counterpart(), SenderType::Doctor);
    }
}
