//! Consultation and messaging flows against a real database.

mod common;

use chrono::{DateTime, Utc};
use diesel::{ExpressionMethods, QueryDsl};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use medbook_consultationservice::{
    app_error::AppError,
    auth::AuthUser,
    broadcast::{Broadcaster, Channel},
    enums::{ConsultationStatus, Role, SenderType},
    pagination::PageParams,
    models::ConsultationEntity,
    schema::{
        consultation_attachments, consultation_status_logs, consultations as consultations_table,
    },
    services::{
        consultations::{self, Actor, ConsultationChanges, NewConsultation},
        messages::{self, MessageFilters, NewAttachment, NewMessage},
    },
};

use common::{create_user, pool, storage};

async fn log_count(conn: &mut AsyncPgConnection, consultation_id: i64) -> i64 {
    consultation_status_logs::table
        .filter(consultation_status_logs::consultation_id.eq(consultation_id))
        .count()
        .get_result(conn)
        .await
        .unwrap()
}

async fn transitions(
    conn: &mut AsyncPgConnection,
    consultation_id: i64,
) -> Vec<(ConsultationStatus, ConsultationStatus)> {
    consultation_status_logs::table
        .filter(consultation_status_logs::consultation_id.eq(consultation_id))
        .order_by(consultation_status_logs::id)
        .select((
            consultation_status_logs::from_status,
            consultation_status_logs::to_status,
        ))
        .get_results(conn)
        .await
        .unwrap()
}

async fn open_consultation(
    conn: &mut AsyncPgConnection,
    patient: &AuthUser,
    doctor: &AuthUser,
) -> ConsultationEntity {
    consultations::create(
        conn,
        Actor::from_user(Some(patient)),
        NewConsultation {
            patient_id: patient.id,
            doctor_id: Some(doctor.id),
            status: None,
        },
    )
    .await
    .unwrap()
}

fn text(consultation_id: i64, sender: &AuthUser, sender_type: SenderType) -> NewMessage {
    NewMessage {
        consultation_id,
        sender_id: sender.id,
        sender_type,
        subject: None,
        message: "How are you feeling today?".into(),
        attachments: vec![],
    }
}

#[tokio::test]
async fn status_changes_are_logged_once() {
    let Some(pool) = pool().await else { return };
    let conn = &mut pool.get().await.unwrap();

    let patient = create_user(conn, Role::Patient).await;
    let doctor = create_user(conn, Role::Doctor).await;

    let consultation = open_consultation(conn, &patient, &doctor).await;
    assert_eq!(consultation.status, ConsultationStatus::Open);
    assert_eq!(
        transitions(conn, consultation.id).await,
        [(ConsultationStatus::Open, ConsultationStatus::Open)]
    );

    let closed = consultations::update_status(
        conn,
        Actor::from_user(Some(&doctor)),
        consultation.id,
        ConsultationStatus::Closed,
        Some("Resolved".into()),
    )
    .await
    .unwrap();
    assert!(closed.closed_at.is_some());
    assert_eq!(log_count(conn, consultation.id).await, 2);

    let err = consultations::update_status(
        conn,
        Actor::from_user(Some(&doctor)),
        consultation.id,
        ConsultationStatus::Closed,
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(log_count(conn, consultation.id).await, 2);

    let reopened = consultations::update_status(
        conn,
        Actor::from_user(Some(&doctor)),
        consultation.id,
        ConsultationStatus::Open,
        None,
    )
    .await
    .unwrap();
    assert!(reopened.closed_at.is_none());
}

#[tokio::test]
async fn messages_track_read_state_per_side() {
    let Some(pool) = pool().await else { return };
    let conn = &mut pool.get().await.unwrap();
    let storage = storage();
    let broadcaster = Broadcaster::new();

    let patient = create_user(conn, Role::Patient).await;
    let doctor = create_user(conn, Role::Doctor).await;
    let consultation = open_consultation(conn, &patient, &doctor).await;

    let mut events = broadcaster.subscribe(&Channel::Consultation(consultation.id));

    assert_eq!(messages::unread_count(conn, consultation.id, &doctor).await.unwrap(), 0);

    let sent = messages::send(
        conn,
        &storage,
        &broadcaster,
        text(consultation.id, &patient, SenderType::Patient),
    )
    .await
    .unwrap();
    assert!(sent.read_by_patient);
    assert!(!sent.read_by_doctor);

    let envelope = events.try_recv().unwrap();
    assert_eq!(envelope.event, "NewConsultationMessage");
    assert_eq!(envelope.data["message"]["id"], sent.id);

    assert_eq!(messages::unread_count(conn, consultation.id, &doctor).await.unwrap(), 1);
    assert_eq!(messages::unread_count(conn, consultation.id, &patient).await.unwrap(), 0);

    let read = messages::mark_read(conn, &storage, &broadcaster, sent.id, SenderType::Doctor)
        .await
        .unwrap();
    assert!(read.read_by_doctor);
    assert_eq!(messages::unread_count(conn, consultation.id, &doctor).await.unwrap(), 0);

    let reply = messages::send(
        conn,
        &storage,
        &broadcaster,
        text(consultation.id, &doctor, SenderType::Doctor),
    )
    .await
    .unwrap();
    assert!(reply.read_by_doctor);
    assert!(!reply.read_by_patient);
    assert_eq!(messages::unread_count(conn, consultation.id, &doctor).await.unwrap(), 0);
    assert_eq!(messages::unread_count(conn, consultation.id, &patient).await.unwrap(), 1);

    let stranger = create_user(conn, Role::Patient).await;
    let err = messages::unread_count(conn, consultation.id, &stranger)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ForbiddenResource(_)));
}

#[tokio::test]
async fn deleted_messages_are_hidden() {
    let Some(pool) = pool().await else { return };
    let conn = &mut pool.get().await.unwrap();
    let storage = storage();
    let broadcaster = Broadcaster::new();

    let patient = create_user(conn, Role::Patient).await;
    let doctor = create_user(conn, Role::Doctor).await;
    let consultation = open_consultation(conn, &patient, &doctor).await;

    let first = messages::send(
        conn,
        &storage,
        &broadcaster,
        text(consultation.id, &doctor, SenderType::Doctor),
    )
    .await
    .unwrap();
    let second = messages::send(
        conn,
        &storage,
        &broadcaster,
        text(consultation.id, &doctor, SenderType::Doctor),
    )
    .await
    .unwrap();

    assert_eq!(messages::unread_count(conn, consultation.id, &patient).await.unwrap(), 2);

    messages::soft_delete(conn, second.id).await.unwrap();
    assert!(matches!(
        messages::soft_delete(conn, second.id).await.unwrap_err(),
        AppError::NotFound(_)
    ));
    assert!(matches!(
        messages::get(conn, &storage, second.id).await.unwrap_err(),
        AppError::NotFound(_)
    ));

    let last = messages::last_message(conn, &storage, consultation.id)
        .await
        .unwrap();
    assert_eq!(last.id, first.id);

    let (listed, meta) = messages::list(
        conn,
        &storage,
        consultation.id,
        &MessageFilters::default(),
        PageParams::new(None, None),
    )
    .await
    .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(meta.total, 1);
    assert_eq!(messages::unread_count(conn, consultation.id, &patient).await.unwrap(), 1);
}

#[tokio::test]
async fn update_logs_only_real_status_changes() {
    let Some(pool) = pool().await else { return };
    let conn = &mut pool.get().await.unwrap();

    let patient = create_user(conn, Role::Patient).await;
    let doctor = create_user(conn, Role::Doctor).await;
    let other_doctor = create_user(conn, Role::Doctor).await;
    let consultation = open_consultation(conn, &patient, &doctor).await;

    let unchanged = consultations::update(
        conn,
        Actor::from_user(Some(&doctor)),
        consultation.id,
        ConsultationChanges {
            status: Some(ConsultationStatus::Open),
            note: Some("Still open".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(unchanged.status, ConsultationStatus::Open);
    assert_eq!(log_count(conn, consultation.id).await, 1);

    let reassigned = consultations::update(
        conn,
        Actor::from_user(Some(&doctor)),
        consultation.id,
        ConsultationChanges {
            doctor_id: Some(Some(other_doctor.id)),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(reassigned.doctor_id, Some(other_doctor.id));
    assert_eq!(log_count(conn, consultation.id).await, 1);

    let answered = consultations::update(
        conn,
        Actor::from_user(Some(&other_doctor)),
        consultation.id,
        ConsultationChanges {
            status: Some(ConsultationStatus::Answered),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(answered.status, ConsultationStatus::Answered);
    assert_eq!(
        transitions(conn, consultation.id).await,
        [
            (ConsultationStatus::Open, ConsultationStatus::Open),
            (ConsultationStatus::Open, ConsultationStatus::Answered),
        ]
    );
}

#[tokio::test]
async fn failed_attachment_rolls_back_the_message() {
    let Some(pool) = pool().await else { return };
    let conn = &mut pool.get().await.unwrap();
    let storage = storage();
    let broadcaster = Broadcaster::new();

    let patient = create_user(conn, Role::Patient).await;
    let doctor = create_user(conn, Role::Doctor).await;
    let consultation = open_consultation(conn, &patient, &doctor).await;
    let mut events = broadcaster.subscribe(&Channel::Consultation(consultation.id));

    let mut new = text(consultation.id, &patient, SenderType::Patient);
    new.attachments.push(NewAttachment {
        file_name: "scan.pdf".into(),
        original_name: "scan.pdf".into(),
        file_path: "consultations/scan.pdf".into(),
        // Longer than the file_type column allows.
        file_type: "x".repeat(300),
    });
    let err = messages::send(conn, &storage, &broadcaster, new)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Other(_)));
    assert!(events.try_recv().is_err());

    let (listed, meta) = messages::list(
        conn,
        &storage,
        consultation.id,
        &MessageFilters::default(),
        PageParams::new(None, None),
    )
    .await
    .unwrap();
    assert!(listed.is_empty());
    assert_eq!(meta.total, 0);
    assert_eq!(messages::unread_count(conn, consultation.id, &doctor).await.unwrap(), 0);

    let attachments: i64 = consultation_attachments::table
        .filter(consultation_attachments::consultation_id.eq(consultation.id))
        .count()
        .get_result(conn)
        .await
        .unwrap();
    assert_eq!(attachments, 0);

    let (last_message_at, last_sender_id): (Option<DateTime<Utc>>, Option<i64>) =
        consultations_table::table
            .find(consultation.id)
            .select((
                consultations_table::last_message_at,
                consultations_table::last_sender_id,
            ))
            .first(conn)
            .await
            .unwrap();
    assert!(last_message_at.is_none());
    assert!(last_sender_id.is_none());
}

#[tokio::test]
async fn sending_to_a_deleted_consultation_is_not_found() {
    let Some(pool) = pool().await else { return };
    let conn = &mut pool.get().await.unwrap();
    let storage = storage();
    let broadcaster = Broadcaster::new();

    let patient = create_user(conn, Role::Patient).await;
    let doctor = create_user(conn, Role::Doctor).await;
    let consultation = open_consultation(conn, &patient, &doctor).await;
    consultations::delete(conn, consultation.id).await.unwrap();

    let err = messages::send(
        conn,
        &storage,
        &broadcaster,
        text(consultation.id, &patient, SenderType::Patient),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::NotFound("Consultation")));

    let live = open_consultation(conn, &patient, &doctor).await;
    let mut ghost = text(live.id, &patient, SenderType::Patient);
    ghost.sender_id = -1;
    let err = messages::send(conn, &storage, &broadcaster, ghost)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ValidationFailed(_)));
}
