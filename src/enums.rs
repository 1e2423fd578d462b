//! Closed vocabularies stored as text columns.
//!
//! Each enum serializes as its snake_case name both in JSON and in the
//! database, so a row written by one side is always readable by the other.

use std::{fmt, io::Write, str::FromStr};

use diesel::{
    AsExpression, FromSqlRow,
    deserialize::{self, FromSql},
    pg::{Pg, PgValue},
    serialize::{self, IsNull, Output, ToSql},
    sql_types::Text,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident : $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression,
            FromSqlRow, ToSchema,
        )]
        #[diesel(sql_type = Text)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql<Text, Pg> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
                out.write_all(self.as_str().as_bytes())?;
                Ok(IsNull::No)
            }
        }

        impl FromSql<Text, Pg> for $name {
            fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
                let raw = std::str::from_utf8(bytes.as_bytes())?;
                Ok(raw.parse::<$name>()?)
            }
        }
    };
}

text_enum! {
    /// Platform role. Part of the login key together with the phone number.
    Role: "role" {
        Admin => "admin",
        Doctor => "doctor",
        Receptionist => "receptionist",
        Patient => "patient",
    }
}

text_enum! {
    Gender: "gender" {
        Male => "male",
        Female => "female",
        Other => "other",
    }
}

text_enum! {
    /// Lifecycle status of a consultation. New consultations start `open`.
    ConsultationStatus: "consultation status" {
        Open => "open",
        WaitingResponse => "waiting_response",
        Answered => "answered",
        Closed => "closed",
        Cancelled => "cancelled",
    }
}

text_enum! {
    /// Which side of a consultation wrote a message.
    SenderType: "sender type" {
        Doctor => "doctor",
        Patient => "patient",
    }
}

text_enum! {
    /// Category recorded as `changed_by_type` on status log rows.
    ActorType: "actor type" {
        Doctor => "doctor",
        Patient => "patient",
        Admin => "admin",
    }
}

impl Default for ConsultationStatus {
    fn default() -> Self {
        ConsultationStatus::Open
    }
}

impl Role {
    pub fn is_staff(&self) -> bool {
        matches!(self, Role::Admin | Role::Doctor | Role::Receptionist)
    }
}

impl From<Role> for ActorType {
    /// Receptionists act on consultations on behalf of the clinic, so they are
    /// logged in the admin bucket.
    fn from(role: Role) -> Self {
        match role {
            Role::Doctor => ActorType::Doctor,
            Role::Patient => ActorType::Patient,
            Role::Admin | Role::Receptionist => ActorType::Admin,
        }
    }
}

impl SenderType {
    /// Read flags `(read_by_patient, read_by_doctor)` for a freshly sent
    /// message: the sender's own side has seen it, the other side has not.
    pub fn initial_read_flags(&self) -> (bool, bool) {
        match self {
            SenderType::Patient => (true, false),
            SenderType::Doctor => (false, true),
        }
    }

    pub fn counterpart(&self) -> SenderType {
        match self {
            SenderType::Patient => SenderType::Doctor,
            SenderType::Doctor => SenderType::Patient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_round_trip_through_text() {
        for status in ConsultationStatus::ALL {
            assert_eq!(status.as_str().parse::<ConsultationStatus>().unwrap(), *status);
        }
        assert_eq!(ConsultationStatus::WaitingResponse.as_str(), "waiting_response");
    }

    #[test]
    fn serde_matches_database_spelling() {
        let json = serde_json::to_string(&ConsultationStatus::WaitingResponse).unwrap();
        assert_eq!(json, "\"waiting_response\"");
        let role: Role = serde_json::from_str("\"receptionist\"").unwrap();
        assert_eq!(role, Role::Receptionist);
    }

    #[test]
    fn unknown_values_are_rejected() {
        let err = "archived".parse::<ConsultationStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown consultation status `archived`");
        assert!(serde_json::from_str::<SenderType>("\"admin\"").is_err());
    }

    #[test]
    fn sender_side_starts_read() {
        assert_eq!(SenderType::Patient.initial_read_flags(), (true, false));
        assert_eq!(SenderType::Doctor.initial_read_flags(), (false, true));
        assert_eq!(SenderType::Doctor.counterpart(), SenderType::Patient);
    }

    #[test]
    fn roles_map_onto_actor_types() {
        assert_eq!(ActorType::from(Role::Doctor), ActorType::Doctor);
        assert_eq!(ActorType::from(Role::Patient), ActorType::Patient);
        assert_eq!(ActorType::from(Role::Admin), ActorType::Admin);
        assert_eq!(ActorType::from(Role::Receptionist), ActorType::Admin);
        assert!(Role::Receptionist.is_staff());
        assert!(!Role::Patient.is_staff());
    }
}
