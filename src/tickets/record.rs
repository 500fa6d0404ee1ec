//! Ticket records and their modifications
//!
//! A ticket is never deleted. Every change goes through [`Ticket::apply`],
//! which produces the next committed state of the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{ActionType, TicketError, TicketResult};

/// Unique key of a ticket: (guild id, per-guild ticket number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TicketKey {
    pub guild_id: u64,
    pub number: u64,
}

impl TicketKey {
    #[must_use]
    pub fn new(guild_id: u64, number: u64) -> Self {
        Self { guild_id, number }
    }
}

impl fmt::Display for TicketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} in guild {}", self.number, self.guild_id)
    }
}

/// Record of a moderation action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    /// Guild the action happened in
    pub guild_id: u64,
    /// Sequential number within the guild, starting at 1
    pub number: u64,
    /// What kind of action this was
    pub action: ActionType,
    /// Moderator responsible for the action
    pub moderator_id: u64,
    /// User the action was taken against
    pub subject_id: u64,
    /// Audit log entry the ticket was created from, if any
    pub audit_entry_id: Option<u64>,
    /// Tracked role, for role-change tickets only
    pub role_id: Option<u64>,
    /// Reason given for the action
    pub reason: Option<String>,
    /// Whether the ticket has been given a reason
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    pub modified_by_id: u64,
    pub modified_at: DateTime<Utc>,
    /// Message mirroring this ticket in the notification channel
    pub notification_message_id: Option<u64>,
    /// Channel that message lives in; the guild's channel may change later
    #[serde(default)]
    pub notification_channel_id: Option<u64>,
}

impl Ticket {
    #[must_use]
    pub fn key(&self) -> TicketKey {
        TicketKey::new(self.guild_id, self.number)
    }

    /// Produce the state of this ticket after `changes` are applied by `modified_by`
    #[must_use]
    pub fn apply(&self, changes: &TicketChanges, modified_by: u64, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        if let Some(reason) = &changes.reason {
            next.reason = Some(reason.clone());
        }
        if let Some(moderator_id) = changes.moderator_id {
            next.moderator_id = moderator_id;
        }
        if let Some(resolved) = changes.resolved {
            next.resolved = resolved;
        }
        next.modified_by_id = modified_by;
        next.modified_at = now;
        next
    }
}

/// Requested modifications to a ticket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketChanges {
    pub reason: Option<String>,
    pub moderator_id: Option<u64>,
    pub resolved: Option<bool>,
}

impl TicketChanges {
    /// Set the reason and mark the ticket resolved
    #[must_use]
    pub fn resolve(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            resolved: Some(true),
            ..Default::default()
        }
    }

    /// Hand the ticket to another moderator
    #[must_use]
    pub fn reassign(moderator_id: u64) -> Self {
        Self {
            moderator_id: Some(moderator_id),
            ..Default::default()
        }
    }

    /// Reject empty change sets and blank reasons
    ///
    /// # Errors
    /// Returns `TicketError::Invalid` describing the problem.
    pub fn validate(&self) -> TicketResult<()> {
        if self.reason.is_none() && self.moderator_id.is_none() && self.resolved.is_none() {
            return Err(TicketError::Invalid("no changes requested".to_string()));
        }
        if self.reason.as_deref().is_some_and(|r| r.trim().is_empty()) {
            return Err(TicketError::Invalid("reason must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Parameters for creating a ticket
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub guild_id: u64,
    pub action: ActionType,
    pub moderator_id: u64,
    pub subject_id: u64,
    pub resolved: bool,
    pub reason: Option<String>,
    pub role_id: Option<u64>,
    pub audit_entry_id: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
}

impl NewTicket {
    /// A new, unresolved ticket with no optional fields set
    #[must_use]
    pub fn new(guild_id: u64, action: ActionType, moderator_id: u64, subject_id: u64) -> Self {
        Self {
            guild_id,
            action,
            moderator_id,
            subject_id,
            resolved: false,
            reason: None,
            role_id: None,
            audit_entry_id: None,
            created_at: None,
        }
    }

    /// Attach a reason; a non-empty reason also resolves the ticket
    #[must_use]
    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        let reason = reason.filter(|r| !r.trim().is_empty());
        self.resolved = reason.is_some();
        self.reason = reason;
        self
    }

    #[must_use]
    pub fn with_role(mut self, role_id: u64) -> Self {
        self.role_id = Some(role_id);
        self
    }

    #[must_use]
    pub fn from_audit_entry(mut self, entry_id: u64, created_at: DateTime<Utc>) -> Self {
        self.audit_entry_id = Some(entry_id);
        self.created_at = Some(created_at);
        self
    }

    /// Materialize the ticket under the given number
    #[must_use]
    pub fn into_ticket(self, number: u64, now: DateTime<Utc>) -> Ticket {
        Ticket {
            guild_id: self.guild_id,
            number,
            action: self.action,
            moderator_id: self.moderator_id,
            subject_id: self.subject_id,
            audit_entry_id: self.audit_entry_id,
            role_id: self.role_id,
            reason: self.reason,
            resolved: self.resolved,
            created_at: self.created_at.unwrap_or(now),
            modified_by_id: self.moderator_id,
            modified_at: now,
            notification_message_id: None,
            notification_channel_id: None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn sample_ticket(number: u64, moderator_id: u64) -> Ticket {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
            + chrono::Duration::minutes(i64::try_from(number).unwrap());
        NewTicket::new(10, ActionType::Ban, moderator_id, 500 + number)
            .into_ticket(number, created)
    }

    #[test]
    fn test_apply_resolve() {
        let ticket = sample_ticket(1, 7);
        let now = Utc::now();
        let next = ticket.apply(&TicketChanges::resolve("spam"), 7, now);
        assert!(next.resolved);
        assert_eq!(next.reason.as_deref(), Some("spam"));
        assert_eq!(next.modified_at, now);
        assert_eq!(next.moderator_id, 7);
        assert_eq!(next.created_at, ticket.created_at);
    }

    #[test]
    fn test_apply_reassign() {
        let ticket = sample_ticket(2, 7);
        let next = ticket.apply(&TicketChanges::reassign(8), 9, Utc::now());
        assert_eq!(next.moderator_id, 8);
        assert_eq!(next.modified_by_id, 9);
        assert!(!next.resolved);
        assert!(next.reason.is_none());
    }

    #[test]
    fn test_validate_changes() {
        assert!(TicketChanges::default().validate().is_err());
        assert!(TicketChanges::resolve("   ").validate().is_err());
        assert!(TicketChanges::resolve("raiding").validate().is_ok());
        assert!(TicketChanges::reassign(3).validate().is_ok());
    }

    #[test]
    fn test_new_ticket_reason_rule() {
        let with_reason = NewTicket::new(1, ActionType::Kick, 2, 3).with_reason(Some("spam".into()));
        assert!(with_reason.resolved);

        let blank = NewTicket::new(1, ActionType::Kick, 2, 3).with_reason(Some(String::new()));
        assert!(!blank.resolved);
        assert!(blank.reason.is_none());
    }

    #[test]
    fn test_into_ticket_defaults() {
        let now = Utc::now();
        let ticket = NewTicket::new(1, ActionType::Note, 2, 3).into_ticket(4, now);
        assert_eq!(ticket.key(), TicketKey::new(1, 4));
        assert_eq!(ticket.created_at, now);
        assert_eq!(ticket.modified_by_id, 2);
        assert!(ticket.notification_message_id.is_none());
        assert!(ticket.notification_channel_id.is_none());
    }
}
