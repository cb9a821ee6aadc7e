//! Participant identity for the visit workflow
//!
//! Sessions are keyed by the counter-party's user id, which the surrounding
//! visit workflow supplies together with a display name and clinical role.
//! The core never authenticates anyone; identities arrive pre-authenticated
//! over the signaling channel.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

/// Opaque user identifier handed in by the visit workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Create a new user id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Clinical role of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Consulting doctor
    Doctor,
    /// Visiting nurse
    Nurse,
    /// Patient receiving the visit
    Patient,
    /// Laboratory staff
    Lab,
    /// Platform administrator
    Admin,
}

impl Role {
    /// Stable lowercase name used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Doctor => "doctor",
            Self::Nurse => "nurse",
            Self::Patient => "patient",
            Self::Lab => "lab",
            Self::Admin => "admin",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "doctor" => Ok(Self::Doctor),
            "nurse" => Ok(Self::Nurse),
            "patient" => Ok(Self::Patient),
            "lab" => Ok(Self::Lab),
            "admin" => Ok(Self::Admin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Error for an unrecognized role string
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

/// A call participant as known to the signaling layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// User identifier
    pub id: UserId,
    /// Human-readable name shown on the ringing screen
    pub display_name: String,
    /// Clinical role
    pub role: Role,
}

impl Participant {
    /// Create a new participant
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role,
        }
    }
}

impl Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_display() {
        let id = UserId::new("doctor-17");
        assert_eq!(id.to_string(), "doctor-17");
        assert_eq!(id.as_str(), "doctor-17");
    }

    #[test]
    fn test_role_round_trip() {
        for role in [Role::Doctor, Role::Nurse, Role::Patient, Role::Lab, Role::Admin] {
            let parsed: Role = role.as_str().parse().unwrap();
            assert_eq!(parsed, role);
        }
        assert!("surgeon".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&Role::Nurse).unwrap();
        assert_eq!(json, "\"nurse\"");
    }

    #[test]
    fn test_participant_display() {
        let p = Participant::new("nurse-4", "A. Okafor", Role::Nurse);
        assert_eq!(p.to_string(), "A. Okafor (nurse-4)");
    }
}
