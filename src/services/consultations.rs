//! Consultation lifecycle: creation, reassignment and status changes, each
//! paired with its status log row inside one transaction.

use std::collections::HashMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper, pg::Pg};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};

use crate::{
    app_error::AppError,
    auth::AuthUser,
    enums::{ActorType, ConsultationStatus},
    models::{
        ConsultationAttachmentEntity, ConsultationEntity, ConsultationMessageEntity,
        ConsultationStatusLogEntity, CreateConsultationEntity, CreateConsultationStatusLogEntity,
        UpdateConsultationEntity,
    },
    pagination::{PageMeta, PageParams},
    resources::{
        AttachmentRes, ConsultationRes, MessageRes, StatusLogRes, UserRes, UserSummaryRes,
    },
    schema::{
        consultation_attachments, consultation_messages, consultation_status_logs, consultations,
    },
    services::{user_exists, users_by_id},
    storage::Storage,
};

pub const CREATED_NOTE: &str = "Consultation created";
pub const SAME_STATUS: &str = "Status is already set to the requested value";

/// Who is recorded on a status log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Option<i64>,
    pub actor_type: ActorType,
}

impl Actor {
    pub fn from_user(user: Option<&AuthUser>) -> Self {
        match user {
            Some(user) => Actor {
                id: Some(user.id),
                actor_type: user.role.into(),
            },
            None => Actor {
                id: None,
                actor_type: ActorType::Patient,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewConsultation {
    pub patient_id: i64,
    pub doctor_id: Option<i64>,
    pub status: Option<ConsultationStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct ConsultationChanges {
    /// `Some(None)` unassigns the doctor.
    pub doctor_id: Option<Option<i64>>,
    pub status: Option<ConsultationStatus>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConsultationFilters {
    pub status: Option<ConsultationStatus>,
    pub patient_id: Option<i64>,
    pub doctor_id: Option<i64>,
}

/// How `closed_at` moves on a status transition: stamped when entering
/// `closed`, cleared when leaving it, untouched otherwise.
pub fn closed_at_change(
    from: ConsultationStatus,
    to: ConsultationStatus,
    now: DateTime<Utc>,
) -> Option<Option<DateTime<Utc>>> {
    match (from == ConsultationStatus::Closed, to == ConsultationStatus::Closed) {
        (false, true) => Some(Some(now)),
        (true, false) => Some(None),
        _ => None,
    }
}

fn log_row(
    consultation_id: i64,
    from: ConsultationStatus,
    to: ConsultationStatus,
    actor: Actor,
    note: Option<String>,
) -> CreateConsultationStatusLogEntity {
    CreateConsultationStatusLogEntity {
        consultation_id,
        from_status: from,
        to_status: to,
        changed_by_id: actor.id,
        changed_by_type: actor.actor_type,
        note,
    }
}

async fn ensure_user(
    conn: &mut AsyncPgConnection,
    id: i64,
    field: &'static str,
    message: &'static str,
) -> Result<(), AppError> {
    if user_exists(conn, id).await? {
        Ok(())
    } else {
        Err(AppError::invalid_field(field, message))
    }
}

async fn lock(conn: &mut AsyncPgConnection, id: i64) -> Result<ConsultationEntity, AppError> {
    consultations::table
        .find(id)
        .select(ConsultationEntity::as_select())
        .for_update()
        .first(conn)
        .await
        .optional()
        .context("Failed to lock consultation")?
        .ok_or(AppError::NotFound("Consultation"))
}

async fn insert_log(
    conn: &mut AsyncPgConnection,
    row: CreateConsultationStatusLogEntity,
) -> Result<(), AppError> {
    diesel::insert_into(consultation_status_logs::table)
        .values(row)
        .execute(conn)
        .await
        .context("Failed to write status log")?;
    Ok(())
}

pub async fn create(
    conn: &mut AsyncPgConnection,
    actor: Actor,
    new: NewConsultation,
) -> Result<ConsultationEntity, AppError> {
    ensure_user(
        conn,
        new.patient_id,
        "patient_id",
        "The selected patient does not exist",
    )
    .await?;
    if let Some(doctor_id) = new.doctor_id {
        ensure_user(conn, doctor_id, "doctor_id", "The selected doctor does not exist").await?;
    }

    let status = new.status.unwrap_or_default();
    let consultation = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let consultation: ConsultationEntity = diesel::insert_into(consultations::table)
                    .values(CreateConsultationEntity {
                        patient_id: new.patient_id,
                        doctor_id: new.doctor_id,
                        status,
                        closed_at: closed_at_change(ConsultationStatus::Open, status, Utc::now())
                            .flatten(),
                    })
                    .returning(ConsultationEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to create consultation")?;

                insert_log(
                    conn,
                    log_row(
                        consultation.id,
                        ConsultationStatus::Open,
                        consultation.status,
                        actor,
                        Some(CREATED_NOTE.to_string()),
                    ),
                )
                .await?;

                Ok::<ConsultationEntity, AppError>(consultation)
            })
        })
        .await?;

    tracing::info!(
        "Consultation #{} created for patient #{} with status {}",
        consultation.id,
        consultation.patient_id,
        consultation.status
    );
    Ok(consultation)
}

/// Moves a consultation to `status`. Asking for the status it already has is
/// rejected and leaves the log untouched.
pub async fn update_status(
    conn: &mut AsyncPgConnection,
    actor: Actor,
    id: i64,
    status: ConsultationStatus,
    note: Option<String>,
) -> Result<ConsultationEntity, AppError> {
    let consultation = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let current = lock(conn, id).await?;
                if current.status == status {
                    return Err(AppError::Conflict(SAME_STATUS.to_string()));
                }

                let updated: ConsultationEntity = diesel::update(consultations::table.find(id))
                    .set(UpdateConsultationEntity {
                        status: Some(status),
                        closed_at: closed_at_change(current.status, status, Utc::now()),
                        ..Default::default()
                    })
                    .returning(ConsultationEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to update consultation status")?;

                insert_log(conn, log_row(id, current.status, status, actor, note)).await?;

                Ok::<ConsultationEntity, AppError>(updated)
            })
        })
        .await?;

    tracing::info!("Consultation #{} moved to {}", consultation.id, consultation.status);
    Ok(consultation)
}

/// Reassigns the doctor and/or changes the status. An unchanged status is
/// not an error here and writes no log row.
pub async fn update(
    conn: &mut AsyncPgConnection,
    actor: Actor,
    id: i64,
    changes: ConsultationChanges,
) -> Result<ConsultationEntity, AppError> {
    if let Some(Some(doctor_id)) = changes.doctor_id {
        ensure_user(conn, doctor_id, "doctor_id", "The selected doctor does not exist").await?;
    }

    conn.transaction(move |conn| {
        Box::pin(async move {
            let current = lock(conn, id).await?;
            let new_status = changes.status.filter(|status| *status != current.status);

            let mut changeset = UpdateConsultationEntity {
                doctor_id: changes.doctor_id,
                ..Default::default()
            };
            if let Some(status) = new_status {
                changeset.status = Some(status);
                changeset.closed_at = closed_at_change(current.status, status, Utc::now());
            }

            if changeset.doctor_id.is_none() && changeset.status.is_none() {
                return Ok(current);
            }

            let updated: ConsultationEntity = diesel::update(consultations::table.find(id))
                .set(changeset)
                .returning(ConsultationEntity::as_returning())
                .get_result(conn)
                .await
                .context("Failed to update consultation")?;

            if let Some(status) = new_status {
                insert_log(conn, log_row(id, current.status, status, actor, changes.note)).await?;
            }

            Ok::<ConsultationEntity, AppError>(updated)
        })
    })
    .await
}

/// Hard delete. Messages, attachments and logs go with it.
pub async fn delete(conn: &mut AsyncPgConnection, id: i64) -> Result<(), AppError> {
    let affected = diesel::delete(consultations::table.find(id))
        .execute(conn)
        .await
        .context("Failed to delete consultation")?;
    if affected == 0 {
        return Err(AppError::NotFound("Consultation"));
    }
    tracing::info!("Consultation #{} deleted", id);
    Ok(())
}

fn filtered(filters: &ConsultationFilters) -> consultations::BoxedQuery<'static, Pg> {
    let mut query = consultations::table.into_boxed();
    if let Some(status) = filters.status {
        query = query.filter(consultations::status.eq(status));
    }
    if let Some(patient_id) = filters.patient_id {
        query = query.filter(consultations::patient_id.eq(patient_id));
    }
    if let Some(doctor_id) = filters.doctor_id {
        query = query.filter(consultations::doctor_id.eq(doctor_id));
    }
    query
}

pub async fn list(
    conn: &mut AsyncPgConnection,
    storage: &Storage,
    filters: &ConsultationFilters,
    page: PageParams,
) -> Result<(Vec<ConsultationRes>, PageMeta), AppError> {
    let total: i64 = filtered(filters)
        .count()
        .get_result(conn)
        .await
        .context("Failed to count consultations")?;

    let rows: Vec<ConsultationEntity> = filtered(filters)
        .order_by((consultations::created_at.desc(), consultations::id.desc()))
        .limit(page.limit())
        .offset(page.offset())
        .select(ConsultationEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get consultations")?;

    let consultations = load_details(conn, storage, rows).await?;
    Ok((consultations, PageMeta::new(total, page)))
}

pub async fn get(
    conn: &mut AsyncPgConnection,
    storage: &Storage,
    id: i64,
) -> Result<ConsultationRes, AppError> {
    let consultation: ConsultationEntity = consultations::table
        .find(id)
        .select(ConsultationEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get consultation")?
        .ok_or(AppError::NotFound("Consultation"))?;

    load_details(conn, storage, vec![consultation])
        .await?
        .pop()
        .ok_or(AppError::NotFound("Consultation"))
}

/// Attaches participants, live messages, attachments and status logs to a
/// batch of consultations with one query per relation.
pub async fn load_details(
    conn: &mut AsyncPgConnection,
    storage: &Storage,
    consultations: Vec<ConsultationEntity>,
) -> Result<Vec<ConsultationRes>, AppError> {
    if consultations.is_empty() {
        return Ok(vec![]);
    }
    let ids: Vec<i64> = consultations.iter().map(|c| c.id).collect();

    let messages: Vec<ConsultationMessageEntity> = consultation_messages::table
        .filter(consultation_messages::consultation_id.eq_any(&ids))
        .filter(consultation_messages::deleted_at.is_null())
        .order_by((
            consultation_messages::created_at.asc(),
            consultation_messages::id.asc(),
        ))
        .select(ConsultationMessageEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to load consultation messages")?;

    let attachments: Vec<ConsultationAttachmentEntity> = consultation_attachments::table
        .filter(consultation_attachments::consultation_id.eq_any(&ids))
        .order_by(consultation_attachments::id.asc())
        .select(ConsultationAttachmentEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to load consultation attachments")?;

    let logs: Vec<ConsultationStatusLogEntity> = consultation_status_logs::table
        .filter(consultation_status_logs::consultation_id.eq_any(&ids))
        .order_by((
            consultation_status_logs::created_at.asc(),
            consultation_status_logs::id.asc(),
        ))
        .select(ConsultationStatusLogEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to load status logs")?;

    let mut user_ids: Vec<i64> = Vec::new();
    for consultation in &consultations {
        user_ids.push(consultation.patient_id);
        user_ids.extend(consultation.doctor_id);
        user_ids.extend(consultation.last_sender_id);
    }
    user_ids.extend(messages.iter().map(|m| m.sender_id));
    user_ids.extend(logs.iter().filter_map(|l| l.changed_by_id));
    let users = users_by_id(conn, user_ids).await?;
    let summary = |id: Option<i64>| {
        id.and_then(|id| users.get(&id))
            .map(|user| UserSummaryRes::new(user, storage))
    };

    let mut message_attachments: HashMap<i64, Vec<AttachmentRes>> = HashMap::new();
    let mut attachment_group: HashMap<i64, Vec<AttachmentRes>> = HashMap::new();
    for attachment in attachments {
        let res = AttachmentRes::new(attachment, storage);
        if let Some(message_id) = res.consultation_message_id {
            message_attachments
                .entry(message_id)
                .or_default()
                .push(res.clone());
        }
        attachment_group
            .entry(res.consultation_id)
            .or_default()
            .push(res);
    }

    let mut message_group: HashMap<i64, Vec<MessageRes>> = HashMap::new();
    for message in messages {
        let sender = summary(Some(message.sender_id));
        let attachments = message_attachments.remove(&message.id).unwrap_or_default();
        message_group
            .entry(message.consultation_id)
            .or_default()
            .push(MessageRes::new(message, sender, attachments));
    }

    let mut log_group: HashMap<i64, Vec<StatusLogRes>> = HashMap::new();
    for log in logs {
        let changer = log
            .changed_by_id
            .and_then(|id| users.get(&id))
            .map(|user| UserRes::new(user.clone(), storage));
        log_group
            .entry(log.consultation_id)
            .or_default()
            .push(StatusLogRes::new(log, changer));
    }

    Ok(consultations
        .into_iter()
        .map(|c| ConsultationRes {
            patient: summary(Some(c.patient_id)),
            doctor: summary(c.doctor_id),
            last_sender: summary(c.last_sender_id),
            messages: message_group.remove(&c.id).unwrap_or_default(),
            attachments: attachment_group.remove(&c.id).unwrap_or_default(),
            status_logs: log_group.remove(&c.id).unwrap_or_default(),
            id: c.id,
            patient_id: c.patient_id,
            doctor_id: c.doctor_id,
            status: c.status,
            closed_at: c.closed_at,
            last_message_at: c.last_message_at,
            last_sender_id: c.last_sender_id,
            created_at: c.created_at,
            updated_at: c.updated_at,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::Role;

    #[test]
    fn closed_at_follows_the_closed_state() {
        let now = Utc::now();
        use ConsultationStatus::*;
        assert_eq!(closed_at_change(Open, Closed, now), Some(Some(now)));
        assert_eq!(closed_at_change(Closed, Open, now), Some(None));
        assert_eq!(closed_at_change(Open, Answered, now), None);
        assert_eq!(closed_at_change(Closed, Closed, now), None);
    }

    #[test]
    fn actors_are_derived_from_the_caller() {
        let receptionist = AuthUser { id: 4, role: Role::Receptionist };
        assert_eq!(
            Actor::from_user(Some(&receptionist)),
            Actor { id: Some(4), actor_type: ActorType::Admin }
        );
        assert_eq!(
            Actor::from_user(None),
            Actor { id: None, actor_type: ActorType::Patient }
        );
    }

    #[test]
    fn creation_log_starts_from_open() {
        let actor = Actor {
            id: Some(2),
            actor_type: ActorType::Doctor,
        };
        let row = log_row(
            8,
            ConsultationStatus::Open,
            ConsultationStatus::Answered,
            actor,
            Some(CREATED_NOTE.into()),
        );
        assert_eq!(row.from_status, ConsultationStatus::Open);
        assert_eq!(row.to_status, ConsultationStatus::Answered);
        assert_eq!(row.changed_by_id, Some(2));
        assert_eq!(row.note.as_deref(), Some("Consultation created"));
    }
}
