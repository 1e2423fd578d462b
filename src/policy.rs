//! Access rules for REST handlers and real-time channels, kept in one table
//! so both layers answer the same question the same way.

use crate::{app_error::AppError, auth::AuthUser, enums::Role};

const STAFF: &[Role] = &[Role::Admin, Role::Doctor, Role::Receptionist];
const ADMIN: &[Role] = &[Role::Admin];
const NOBODY: &[Role] = &[];

/// The two users attached to a consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participants {
    pub patient_id: i64,
    pub doctor_id: Option<i64>,
}

impl Participants {
    pub fn contains(&self, user_id: i64) -> bool {
        self.patient_id == user_id || self.doctor_id == Some(user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ManageArticleCategories,
    ManageArticles,
    ManageArticleImages,
    UploadFiles,
    CreateComment,
    ModifyComment { owner_id: i64 },
    ManageUsers,
    /// Consultation, message, attachment and status-log endpoints.
    UseConsultations,
    ViewUnreadCount(Participants),
    JoinConsultationChannel(Participants),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    Authenticated,
    Roles(&'static [Role]),
    OwnerOrRoles(i64, &'static [Role]),
    ParticipantOrRoles(Participants, &'static [Role]),
}

impl Action {
    fn rule(&self) -> Rule {
        match *self {
            Action::ManageArticleCategories
            | Action::ManageArticles
            | Action::ManageArticleImages
            | Action::UploadFiles => Rule::Roles(STAFF),
            Action::CreateComment | Action::UseConsultations => Rule::Authenticated,
            Action::ModifyComment { owner_id } => Rule::OwnerOrRoles(owner_id, ADMIN),
            Action::ManageUsers => Rule::Roles(ADMIN),
            Action::ViewUnreadCount(participants) => Rule::ParticipantOrRoles(participants, ADMIN),
            Action::JoinConsultationChannel(participants) => {
                Rule::ParticipantOrRoles(participants, NOBODY)
            }
        }
    }

    fn denial(&self) -> &'static str {
        match self {
            Action::ManageArticleCategories => "You are not authorized to manage categories",
            Action::ManageArticles => "You are not authorized to manage articles",
            Action::ManageArticleImages => "You are not authorized to manage images",
            Action::UploadFiles => "You are not authorized to upload files",
            Action::CreateComment => "You are not authorized to add comments",
            Action::ModifyComment { .. } => "You are not authorized to modify this comment",
            Action::ManageUsers => "You are not authorized to manage users",
            Action::UseConsultations => "You are not authorized to access consultations",
            Action::ViewUnreadCount(_) => "You are not a participant of this consultation",
            Action::JoinConsultationChannel(_) => "You may not listen on this channel",
        }
    }
}

pub fn allows(user: &AuthUser, action: Action) -> bool {
    match action.rule() {
        Rule::Authenticated => true,
        Rule::Roles(roles) => roles.contains(&user.role),
        Rule::OwnerOrRoles(owner_id, roles) => owner_id == user.id || roles.contains(&user.role),
        Rule::ParticipantOrRoles(participants, roles) => {
            participants.contains(user.id) || roles.contains(&user.role)
        }
    }
}

pub fn authorize(user: &AuthUser, action: Action) -> Result<(), AppError> {
    if allows(user, action) {
        Ok(())
    } else {
        Err(AppError::ForbiddenResource(action.denial().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64, role: Role) -> AuthUser {
        AuthUser { id, role }
    }

    const CONSULTATION: Participants = Participants {
        patient_id: 1,
        doctor_id: Some(2),
    };

    #[test]
    fn staff_manage_cms_patients_do_not() {
        for role in [Role::Admin, Role::Doctor, Role::Receptionist] {
            assert!(allows(&user(9, role), Action::ManageArticles));
            assert!(allows(&user(9, role), Action::UploadFiles));
        }
        let err = authorize(&user(9, Role::Patient), Action::ManageArticleCategories).unwrap_err();
        assert!(matches!(err, AppError::ForbiddenResource(_)));
    }

    #[test]
    fn comments_are_owner_or_admin() {
        let action = Action::ModifyComment { owner_id: 7 };
        assert!(allows(&user(7, Role::Patient), action));
        assert!(allows(&user(8, Role::Admin), action));
        assert!(!allows(&user(8, Role::Doctor), action));
        assert!(allows(&user(8, Role::Patient), Action::CreateComment));
    }

    #[test]
    fn unread_count_admits_participants_and_admins() {
        let action = Action::ViewUnreadCount(CONSULTATION);
        assert!(allows(&user(1, Role::Patient), action));
        assert!(allows(&user(2, Role::Doctor), action));
        assert!(allows(&user(99, Role::Admin), action));
        assert!(!allows(&user(3, Role::Doctor), action));
        assert!(!allows(&user(4, Role::Receptionist), action));
    }

    #[test]
    fn channels_admit_participants_only() {
        let action = Action::JoinConsultationChannel(CONSULTATION);
        assert!(allows(&user(1, Role::Patient), action));
        assert!(allows(&user(2, Role::Doctor), action));
        assert!(!allows(&user(99, Role::Admin), action));
        assert!(allows(&user(2, Role::Admin), action));
    }

    #[test]
    fn unassigned_doctor_slot_matches_nobody() {
        let unassigned = Participants {
            patient_id: 1,
            doctor_id: None,
        };
        assert!(!unassigned.contains(2));
        assert!(unassigned.contains(1));
    }

    #[test]
    fn user_management_is_admin_only() {
        assert!(allows(&user(1, Role::Admin), Action::ManageUsers));
        assert!(!allows(&user(1, Role::Doctor), Action::ManageUsers));
        assert!(allows(&user(1, Role::Patient), Action::UseConsultations));
    }
}
