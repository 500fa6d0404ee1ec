//! Boundary to the chat platform
//!
//! The ticket system only talks to Discord through the [`Platform`] trait, so
//! reconciliation and the moderator queues can run against a mock in tests.

pub mod discord;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

use crate::tickets::TicketResult;

pub use discord::DiscordPlatform;

/// Discord epoch (2015-01-01T00:00:00Z) in milliseconds
pub const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

/// Creation time embedded in a snowflake id
#[must_use]
pub fn snowflake_time(id: u64) -> DateTime<Utc> {
    let millis = (id >> 22) + DISCORD_EPOCH_MS;
    i64::try_from(millis)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Smallest snowflake id created at `time`
#[must_use]
pub fn snowflake_at(time: DateTime<Utc>) -> u64 {
    let millis = u64::try_from(time.timestamp_millis()).unwrap_or(0);
    millis.saturating_sub(DISCORD_EPOCH_MS) << 22
}

/// Kind of action an audit log entry records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditAction {
    Ban,
    Unban,
    Kick,
    /// Roles on a member changed. Discord only reports the delta, so `before`
    /// holds the removed roles and `after` the added ones.
    MemberRoleUpdate { before: Vec<u64>, after: Vec<u64> },
    /// Anything the ticket system does not track
    Other,
}

/// One entry of a guild's audit log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    /// User who performed the action
    pub actor_id: u64,
    /// User the action was performed on
    pub target_id: u64,
    pub action: AuditAction,
    pub reason: Option<String>,
}

/// A user as seen by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformUser {
    pub id: u64,
    pub name: String,
    pub bot: bool,
}

/// Handle to a message that can be edited later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    pub channel_id: u64,
    pub message_id: u64,
}

/// Rich card rendered for a ticket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketCard {
    pub header: String,
    pub title: String,
    pub description: String,
    pub fields: Vec<(String, String)>,
    pub footer: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Outbound message body: plain text, a card, or both
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContent {
    pub text: Option<String>,
    pub card: Option<TicketCard>,
}

impl MessageContent {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            card: None,
        }
    }

    #[must_use]
    pub fn card(card: TicketCard) -> Self {
        Self {
            text: None,
            card: Some(card),
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

/// Operations the ticket system needs from the chat platform
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Platform: Send + Sync {
    /// Fetch audit log entries with ids strictly greater than `after`, in any order
    async fn fetch_audit_entries(&self, guild_id: u64, after: u64) -> TicketResult<Vec<AuditEntry>>;

    /// Resolve a user, `None` when the platform cannot see them
    async fn lookup_user(&self, user_id: u64) -> Option<PlatformUser>;

    /// Send a direct message; fails with `Unreachable` when the user blocks DMs
    async fn send_direct_message(
        &self,
        user_id: u64,
        content: &MessageContent,
    ) -> TicketResult<MessageHandle>;

    /// Replace the content of a previously sent message
    async fn edit_message(&self, handle: MessageHandle, content: &MessageContent) -> TicketResult<()>;

    /// Post to a guild channel; fails with `ChannelGone` when it was deleted
    async fn post_to_channel(
        &self,
        channel_id: u64,
        content: &MessageContent,
    ) -> TicketResult<MessageHandle>;

    /// Wait for the next direct message from `user_id`; fails with `TimedOut`
    async fn wait_for_direct_reply(&self, user_id: u64, timeout: Duration) -> TicketResult<String>;
}
