//! Error types for the ticket system
//!
//! This module defines the various errors that can occur while reconciling,
//! storing, and routing moderation tickets.

use thiserror::Error;

/// Errors that can occur during ticket operations
#[derive(Debug, Error)]
pub enum TicketError {
    /// Ticket, tracked role, or other record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The guild has not been registered with the bot
    #[error("Guild {0} is not registered")]
    GuildNotRegistered(u64),

    /// A user cannot be reached by direct message
    #[error("User {0} cannot be reached")]
    Unreachable(u64),

    /// The notification channel no longer exists
    #[error("Channel {0} no longer exists")]
    ChannelGone(u64),

    /// A human did not reply in time
    #[error("Timed out waiting for a reply")]
    TimedOut,

    /// Malformed input, rejected before any change was made
    #[error("Invalid input: {0}")]
    Invalid(String),

    /// The change conflicts with existing state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Durable storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Discord API error
    #[error("Discord API error: {0}")]
    DiscordApi(#[from] Box<poise::serenity_prelude::Error>),

    /// Generic error
    #[error("Ticket error: {0}")]
    Other(String),
}

impl TicketError {
    /// Whether this error only affects the single operation that raised it,
    /// as opposed to the surrounding reconciliation pass.
    #[must_use]
    pub fn is_delivery_failure(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::ChannelGone(_))
    }
}

impl From<poise::serenity_prelude::Error> for TicketError {
    fn from(error: poise::serenity_prelude::Error) -> Self {
        Self::DiscordApi(Box::new(error))
    }
}

impl From<serde_yaml::Error> for TicketError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<std::io::Error> for TicketError {
    fn from(error: std::io::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

/// Convert a string into a TicketError
impl From<String> for TicketError {
    fn from(message: String) -> Self {
        Self::Other(message)
    }
}

/// Result type for ticket operations
pub type TicketResult<T> = Result<T, TicketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = TicketError::NotFound("ticket #4".to_string());
        assert_eq!(error.to_string(), "Not found: ticket #4");

        let error = TicketError::ChannelGone(42);
        assert_eq!(error.to_string(), "Channel 42 no longer exists");

        let error = TicketError::from("Something went wrong".to_string());
        assert_eq!(error.to_string(), "Ticket error: Something went wrong");
    }

    #[test]
    fn test_delivery_failures() {
        assert!(TicketError::Unreachable(1).is_delivery_failure());
        assert!(TicketError::ChannelGone(1).is_delivery_failure());
        assert!(!TicketError::Storage("disk full".to_string()).is_delivery_failure());
        assert!(!TicketError::TimedOut.is_delivery_failure());
    }

    #[test]
    fn test_io_error_is_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(TicketError::from(io), TicketError::Storage(_)));
    }
}
