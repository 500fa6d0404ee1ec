//! Discord implementation of [`Platform`] on top of serenity

use async_trait::async_trait;
use poise::serenity_prelude as serenity;
use serenity::{
    ChannelId, Context, CreateEmbed, CreateEmbedAuthor, CreateEmbedFooter, CreateMessage,
    EditMessage, GuildId, MessageCollector, MessageId, Timestamp, UserId,
};
use ::serenity::model::guild::audit_log::{Action, AuditLogEntry, Change, MemberAction};
use ::serenity::http::HttpError;
use ::serenity::model::id::AuditLogEntryId;
use std::time::Duration;
use tracing::debug;

use super::{
    AuditAction, AuditEntry, MessageContent, MessageHandle, Platform, PlatformUser, TicketCard,
    snowflake_time,
};
use crate::tickets::{TicketError, TicketResult};

/// Audit log entries per page, the API maximum
const AUDIT_PAGE_SIZE: u8 = 100;

/// JSON error codes returned by the Discord API
const UNKNOWN_CHANNEL: isize = 10003;
const MISSING_ACCESS: isize = 50001;
const CANNOT_MESSAGE_USER: isize = 50007;

/// Platform backed by a live gateway connection
#[derive(Clone)]
pub struct DiscordPlatform {
    ctx: Context,
}

impl std::fmt::Debug for DiscordPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordPlatform")
            .field("shard_id", &self.ctx.shard_id)
            .finish_non_exhaustive()
    }
}

impl DiscordPlatform {
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }
}

fn json_code(e: &serenity::Error) -> Option<isize> {
    match e {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) => Some(response.error.code),
        _ => None,
    }
}

fn channel_error(channel_id: u64, e: serenity::Error) -> TicketError {
    match json_code(&e) {
        Some(UNKNOWN_CHANNEL | MISSING_ACCESS) => TicketError::ChannelGone(channel_id),
        _ => e.into(),
    }
}

fn direct_message_error(user_id: u64, e: serenity::Error) -> TicketError {
    match json_code(&e) {
        Some(CANNOT_MESSAGE_USER | UNKNOWN_CHANNEL | MISSING_ACCESS) => TicketError::Unreachable(user_id),
        _ => e.into(),
    }
}

/// Build the embed for a ticket card
#[must_use]
pub fn card_embed(card: &TicketCard) -> CreateEmbed {
    let mut embed = CreateEmbed::new().author(CreateEmbedAuthor::new(&card.header));
    if !card.title.is_empty() {
        embed = embed.title(&card.title);
    }
    if !card.description.is_empty() {
        embed = embed.description(&card.description);
    }
    for (name, value) in &card.fields {
        embed = embed.field(name, value, false);
    }
    if let Some(footer) = &card.footer {
        embed = embed.footer(CreateEmbedFooter::new(footer));
    }
    if let Some(timestamp) = card
        .timestamp
        .and_then(|t| Timestamp::from_unix_timestamp(t.timestamp()).ok())
    {
        embed = embed.timestamp(timestamp);
    }
    embed
}

fn create_message(content: &MessageContent) -> CreateMessage {
    let mut message = CreateMessage::new();
    if let Some(text) = &content.text {
        message = message.content(text);
    }
    if let Some(card) = &content.card {
        message = message.embed(card_embed(card));
    }
    message
}

fn edit_message(content: &MessageContent) -> EditMessage {
    let message = EditMessage::new().content(content.text.clone().unwrap_or_default());
    match &content.card {
        Some(card) => message.embed(card_embed(card)),
        None => message.embeds(Vec::new()),
    }
}

/// Convert a serenity audit log entry, `None` when it has no target user
fn audit_entry(entry: &AuditLogEntry) -> Option<AuditEntry> {
    let target_id = entry.target_id?.get();
    let action = match entry.action {
        Action::Member(MemberAction::BanAdd) => AuditAction::Ban,
        Action::Member(MemberAction::BanRemove) => AuditAction::Unban,
        Action::Member(MemberAction::Kick) => AuditAction::Kick,
        Action::Member(MemberAction::RoleUpdate) => {
            let mut before = Vec::new();
            let mut after = Vec::new();
            for change in entry.changes.iter().flatten() {
                match change {
                    Change::RolesAdded { new, .. } => {
                        after.extend(new.iter().flatten().map(|role| role.id.get()));
                    }
                    Change::RolesRemove { new, .. } => {
                        before.extend(new.iter().flatten().map(|role| role.id.get()));
                    }
                    _ => {}
                }
            }
            AuditAction::MemberRoleUpdate { before, after }
        }
        _ => AuditAction::Other,
    };
    let id = entry.id.get();
    Some(AuditEntry {
        id,
        created_at: snowflake_time(id),
        actor_id: entry.user_id.get(),
        target_id,
        action,
        reason: entry.reason.clone(),
    })
}

#[async_trait]
impl Platform for DiscordPlatform {
    async fn fetch_audit_entries(&self, guild_id: u64, after: u64) -> TicketResult<Vec<AuditEntry>> {
        let guild = GuildId::new(guild_id);
        let mut entries = Vec::new();
        let mut before: Option<AuditLogEntryId> = None;
        // Pages come newest first; stop at the first page that reaches `after`
        loop {
            let page = guild
                .audit_logs(&self.ctx.http, None, None, before, Some(AUDIT_PAGE_SIZE))
                .await?;
            let oldest = page.entries.iter().map(|e| e.id).min();
            let full = page.entries.len() >= usize::from(AUDIT_PAGE_SIZE);
            entries.extend(
                page.entries
                    .iter()
                    .filter(|e| e.id.get() > after)
                    .filter_map(audit_entry),
            );
            match oldest {
                Some(oldest) if full && oldest.get() > after => before = Some(oldest),
                _ => break,
            }
        }
        debug!(guild_id, after, entries = entries.len(), "Fetched audit log");
        Ok(entries)
    }

    async fn lookup_user(&self, user_id: u64) -> Option<PlatformUser> {
        let id = UserId::new(user_id);
        let cached = self.ctx.cache.user(id).map(|user| PlatformUser {
            id: user_id,
            name: user.name.clone(),
            bot: user.bot,
        });
        if cached.is_some() {
            return cached;
        }
        id.to_user(&self.ctx).await.ok().map(|user| PlatformUser {
            id: user_id,
            name: user.name,
            bot: user.bot,
        })
    }

    async fn send_direct_message(
        &self,
        user_id: u64,
        content: &MessageContent,
    ) -> TicketResult<MessageHandle> {
        let message = UserId::new(user_id)
            .direct_message(&self.ctx, create_message(content))
            .await
            .map_err(|e| direct_message_error(user_id, e))?;
        Ok(MessageHandle {
            channel_id: message.channel_id.get(),
            message_id: message.id.get(),
        })
    }

    async fn edit_message(&self, handle: MessageHandle, content: &MessageContent) -> TicketResult<()> {
        ChannelId::new(handle.channel_id)
            .edit_message(&self.ctx, MessageId::new(handle.message_id), edit_message(content))
            .await
            .map_err(|e| channel_error(handle.channel_id, e))?;
        Ok(())
    }

    async fn post_to_channel(
        &self,
        channel_id: u64,
        content: &MessageContent,
    ) -> TicketResult<MessageHandle> {
        let message = ChannelId::new(channel_id)
            .send_message(&self.ctx, create_message(content))
            .await
            .map_err(|e| channel_error(channel_id, e))?;
        Ok(MessageHandle {
            channel_id,
            message_id: message.id.get(),
        })
    }

    async fn wait_for_direct_reply(&self, user_id: u64, timeout: Duration) -> TicketResult<String> {
        MessageCollector::new(&self.ctx)
            .author_id(UserId::new(user_id))
            .filter(|message| message.guild_id.is_none())
            .timeout(timeout)
            .next()
            .await
            .map(|message| message.content)
            .ok_or(TicketError::TimedOut)
    }
}
