//! Ticket store
//!
//! The store is the only writer of ticket records. It allocates ticket
//! numbers, keeps the notification channel mirror up to date, and reports
//! every committed change to the registered [`TicketObserver`].

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{error, info, warn};

use crate::platform::{MessageContent, MessageHandle, Platform};
use crate::tickets::render;
use crate::tickets::{
    GuildRegistry, GuildState, NewTicket, Storage, Ticket, TicketChanges, TicketError, TicketKey,
    TicketResult,
};

/// Receives ticket changes committed by the store
#[async_trait]
pub trait TicketObserver: Send + Sync {
    /// A ticket was created
    async fn ticket_created(&self, ticket: &Ticket);

    /// A ticket went from `before` to `after`
    async fn ticket_changed(&self, before: &Ticket, after: &Ticket);
}

/// Store for ticket records
pub struct TicketStore {
    storage: Arc<dyn Storage>,
    registry: Arc<GuildRegistry>,
    platform: Arc<dyn Platform>,
    observer: OnceLock<Weak<dyn TicketObserver>>,
}

impl std::fmt::Debug for TicketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketStore")
            .field("registry", &self.registry)
            .field("observer", &self.observer.get().is_some())
            .finish_non_exhaustive()
    }
}

impl TicketStore {
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<GuildRegistry>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            storage,
            registry,
            platform,
            observer: OnceLock::new(),
        }
    }

    /// Register the observer notified of committed changes. Only the first call has effect.
    pub fn set_observer(&self, observer: Weak<dyn TicketObserver>) {
        if self.observer.set(observer).is_err() {
            warn!("Ticket observer already registered, ignoring");
        }
    }

    fn observer(&self) -> Option<Arc<dyn TicketObserver>> {
        self.observer.get().and_then(Weak::upgrade)
    }

    fn guild(&self, guild_id: u64) -> TicketResult<Arc<GuildState>> {
        self.registry
            .get(guild_id)
            .ok_or(TicketError::GuildNotRegistered(guild_id))
    }

    /// Create a ticket, post it to the notification channel, and route it to its moderator
    ///
    /// The ticket number is only committed once the ticket is stored; if the
    /// notification channel is gone the number is released again.
    ///
    /// # Errors
    /// Returns `GuildNotRegistered`, `ChannelGone` if the notification
    /// channel no longer exists, or a storage error.
    pub async fn create_ticket(&self, new: NewTicket) -> TicketResult<Ticket> {
        self.registry.wait_ready().await;
        let guild = self.guild(new.guild_id)?;
        let channel_id = guild.modlog_channel_id();

        let mut count = guild.ticket_count.lock().await;
        let number = *count + 1;

        let placeholder = MessageContent::card(render::placeholder_card(number));
        let handle = self.platform.post_to_channel(channel_id, &placeholder).await?;

        let mut ticket = new.into_ticket(number, Utc::now());
        ticket.notification_message_id = Some(handle.message_id);
        ticket.notification_channel_id = Some(handle.channel_id);
        self.storage.insert_ticket(&ticket).await?;
        *count = number;
        drop(count);

        info!(
            guild_id = ticket.guild_id,
            ticket = ticket.number,
            action = %ticket.action,
            moderator_id = ticket.moderator_id,
            subject_id = ticket.subject_id,
            resolved = ticket.resolved,
            "Ticket created"
        );

        self.refresh_message(&guild, &ticket).await;
        if let Some(observer) = self.observer() {
            observer.ticket_created(&ticket).await;
        }
        Ok(ticket)
    }

    /// Get a ticket by guild and number
    ///
    /// # Errors
    /// Returns `NotFound` if the ticket does not exist.
    pub async fn get_ticket(&self, guild_id: u64, number: u64) -> TicketResult<Ticket> {
        let key = TicketKey::new(guild_id, number);
        self.storage
            .get_ticket(key)
            .await?
            .ok_or_else(|| TicketError::NotFound(format!("ticket {key}")))
    }

    /// Snapshots of a ticket, oldest first, starting with its creation
    ///
    /// # Errors
    /// Returns `NotFound` if the ticket does not exist.
    pub async fn get_history(&self, guild_id: u64, number: u64) -> TicketResult<Vec<Ticket>> {
        let key = TicketKey::new(guild_id, number);
        let history = self.storage.ticket_history(key).await?;
        if history.is_empty() {
            return Err(TicketError::NotFound(format!("ticket {key}")));
        }
        Ok(history)
    }

    /// Tickets against a user, ordered by modification time
    ///
    /// # Errors
    /// Returns a storage error.
    pub async fn get_tickets_for_subject(
        &self,
        guild_id: u64,
        subject_id: u64,
    ) -> TicketResult<Vec<Ticket>> {
        self.storage.tickets_for_subject(guild_id, subject_id).await
    }

    /// Unresolved tickets across all guilds, oldest first
    ///
    /// # Errors
    /// Returns a storage error.
    pub async fn unresolved_tickets(&self) -> TicketResult<Vec<Ticket>> {
        self.storage.unresolved_tickets().await
    }

    /// Apply changes to a ticket on behalf of `modified_by`
    ///
    /// # Errors
    /// Returns `Invalid` for an empty change set or blank reason, `NotFound`
    /// for an unknown ticket, or a storage error. Failing to refresh the
    /// notification message is only logged.
    pub async fn update_ticket(
        &self,
        key: TicketKey,
        changes: TicketChanges,
        modified_by: u64,
    ) -> TicketResult<Ticket> {
        changes.validate()?;
        let guild = self.guild(key.guild_id)?;
        let before = self.get_ticket(key.guild_id, key.number).await?;
        let after = before.apply(&changes, modified_by, Utc::now());
        self.storage.update_ticket(&after).await?;

        info!(
            guild_id = key.guild_id,
            ticket = key.number,
            modified_by,
            moderator_id = after.moderator_id,
            resolved = after.resolved,
            "Ticket updated"
        );

        if let Some(observer) = self.observer() {
            observer.ticket_changed(&before, &after).await;
        }
        self.refresh_message(&guild, &after).await;
        Ok(after)
    }

    /// Display name of a ticket's action
    ///
    /// # Errors
    /// Returns `GuildNotRegistered` if the ticket's guild is unknown.
    pub fn action_label(&self, ticket: &Ticket) -> TicketResult<String> {
        Ok(self.guild(ticket.guild_id)?.action_label(ticket))
    }

    /// Render the card for a ticket
    ///
    /// # Errors
    /// Returns `GuildNotRegistered` if the ticket's guild is unknown.
    pub fn render(&self, ticket: &Ticket) -> TicketResult<MessageContent> {
        let label = self.action_label(ticket)?;
        Ok(MessageContent::card(render::ticket_card(ticket, &label)))
    }

    /// Bring the notification channel mirror in line with `ticket`
    async fn refresh_message(&self, guild: &GuildState, ticket: &Ticket) {
        let Some(message_id) = ticket.notification_message_id else {
            return;
        };
        let handle = MessageHandle {
            channel_id: ticket
                .notification_channel_id
                .unwrap_or_else(|| guild.modlog_channel_id()),
            message_id,
        };
        let content = MessageContent::card(render::ticket_card(ticket, &guild.action_label(ticket)));
        if let Err(e) = self.platform.edit_message(handle, &content).await {
            error!(
                guild_id = ticket.guild_id,
                ticket = ticket.number,
                error = %e,
                "Failed to refresh ticket message"
            );
        }
    }
}
