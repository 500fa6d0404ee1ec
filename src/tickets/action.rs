//! Moderation action taxonomy
//!
//! The set of actions that produce tickets is fixed: each variant carries a
//! stable numeric id that is what gets persisted on a ticket.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{TicketError, TicketResult};

/// Type of moderation action a ticket records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ActionType {
    /// Server ban
    Ban,
    /// Server unban
    Unban,
    /// Server kick
    Kick,
    /// Manual moderator note
    Note,
    /// A tracked role was granted
    RoleAdd,
    /// A tracked role was revoked
    RoleRemove,
}

impl ActionType {
    /// Every action type, in id order
    pub const ALL: [Self; 6] = [
        Self::Ban,
        Self::Unban,
        Self::Kick,
        Self::Note,
        Self::RoleAdd,
        Self::RoleRemove,
    ];

    /// Stable id persisted on tickets
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::Ban => 1,
            Self::Unban => 2,
            Self::Kick => 3,
            Self::Note => 4,
            Self::RoleAdd => 5,
            Self::RoleRemove => 6,
        }
    }

    /// Look up an action type by its stable id
    ///
    /// # Errors
    /// Returns `TicketError::NotFound` for an unknown id.
    pub fn from_id(id: u8) -> TicketResult<Self> {
        Self::ALL
            .into_iter()
            .find(|action| action.id() == id)
            .ok_or_else(|| TicketError::NotFound(format!("action type {id}")))
    }

    /// Whether this action is a tracked-role change
    #[must_use]
    pub fn is_role_change(self) -> bool {
        matches!(self, Self::RoleAdd | Self::RoleRemove)
    }
}

impl TryFrom<u8> for ActionType {
    type Error = TicketError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Self::from_id(id)
    }
}

impl From<ActionType> for u8 {
    fn from(action: ActionType) -> Self {
        action.id()
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ban => write!(f, "BAN"),
            Self::Unban => write!(f, "UNBAN"),
            Self::Kick => write!(f, "KICK"),
            Self::Note => write!(f, "NOTE"),
            Self::RoleAdd => write!(f, "ROLE_ADD"),
            Self::RoleRemove => write!(f, "ROLE_RM"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_stable_and_unique() {
        let ids: Vec<u8> = ActionType::ALL.iter().map(|a| a.id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
        for action in ActionType::ALL {
            assert_eq!(ActionType::from_id(action.id()).unwrap(), action);
        }
    }

    #[test]
    fn test_unknown_id() {
        assert!(matches!(
            ActionType::from_id(0),
            Err(TicketError::NotFound(_))
        ));
        assert!(ActionType::from_id(7).is_err());
    }

    #[test]
    fn test_serialized_as_id() {
        let yaml = serde_yaml::to_string(&ActionType::Kick).expect("Failed to serialize");
        assert_eq!(yaml.trim(), "3");
        let action: ActionType = serde_yaml::from_str("5").expect("Failed to deserialize");
        assert_eq!(action, ActionType::RoleAdd);
        assert!(serde_yaml::from_str::<ActionType>("99").is_err());
    }

    #[test]
    fn test_role_change() {
        assert!(ActionType::RoleAdd.is_role_change());
        assert!(ActionType::RoleRemove.is_role_change());
        assert!(!ActionType::Ban.is_role_change());
        assert_eq!(ActionType::RoleRemove.to_string(), "ROLE_RM");
    }
}
