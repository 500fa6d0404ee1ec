//! Moderator commands
//!
//! Thin wrappers over [`TicketService`](crate::tickets::TicketService); every
//! command is guild only. Configuration commands need Manage Server, the
//! rest need the guild's staff role or Manage Server.

use ::serenity::http::UserPagination;
use poise::serenity_prelude as serenity;
use poise::{CreateReply, command};
use tracing::info;

use crate::platform::discord::card_embed;
use crate::tickets::{
    ActionType, NewTicket, PromptOutcome, Ticket, TicketChanges, TicketError, TicketKey,
    TicketResult, render,
};
use crate::{COMMAND_TARGET, Context, Error};

/// Discord message length limit
const MESSAGE_LIMIT: usize = 2000;
/// Bans fetched per page by `importbans`
const BAN_PAGE_SIZE: u8 = 100;

/// All commands, for the framework options
#[must_use]
pub fn all() -> Vec<poise::Command<crate::Data, Error>> {
    vec![
        setup(),
        addrole(),
        rmrole(),
        importbans(),
        show(),
        setreason(),
        changemod(),
        claim(),
        note(),
        queue(),
        userlog(),
        tickethistory(),
    ]
}

/// Parse a ticket list such as `1, 2, 3`
///
/// Duplicates are dropped, order is kept.
///
/// # Errors
/// Returns `Invalid` for an empty list or anything that is not a number.
pub fn parse_ticket_numbers(input: &str) -> TicketResult<Vec<u64>> {
    let mut numbers = Vec::new();
    for part in input.split(',') {
        let part = part.trim().trim_start_matches('#');
        let number: u64 = part
            .parse()
            .map_err(|_| TicketError::Invalid(format!("`{part}` is not a ticket number")))?;
        if !numbers.contains(&number) {
            numbers.push(number);
        }
    }
    if numbers.is_empty() {
        return Err(TicketError::Invalid("no ticket numbers given".to_string()));
    }
    Ok(numbers)
}

fn guild_id(ctx: Context<'_>) -> TicketResult<u64> {
    ctx.guild_id()
        .map(serenity::GuildId::get)
        .ok_or_else(|| TicketError::Invalid("this command only works in a server".to_string()))
}

/// Whether the author holds the guild's staff role or can manage the guild
async fn is_staff(ctx: Context<'_>) -> Result<bool, Error> {
    let guild_id = guild_id(ctx)?;
    let staff_role = ctx
        .data()
        .tickets()
        .registry
        .get(guild_id)
        .map(|guild| serenity::RoleId::new(guild.settings().staff_role_id))
        .ok_or(TicketError::GuildNotRegistered(guild_id))?;
    let Some(member) = ctx.author_member().await else {
        return Ok(false);
    };
    // Interaction members carry their permissions, prefix invocations use the cache
    let permissions = member
        .permissions
        .or_else(|| ctx.guild().map(|guild| guild.member_permissions(&member)));
    Ok(staff_allowed(&member.roles, staff_role, permissions))
}

fn staff_allowed(
    roles: &[serenity::RoleId],
    staff_role: serenity::RoleId,
    permissions: Option<serenity::Permissions>,
) -> bool {
    roles.contains(&staff_role)
        || permissions.is_some_and(|p| p.contains(serenity::Permissions::MANAGE_GUILD))
}

async fn say_pages(ctx: Context<'_>, lines: &[String]) -> Result<(), Error> {
    for page in render::paginate(lines, MESSAGE_LIMIT) {
        ctx.say(page).await?;
    }
    Ok(())
}

fn summaries(ctx: Context<'_>, tickets: &[Ticket]) -> TicketResult<Vec<String>> {
    let store = &ctx.data().tickets().store;
    tickets
        .iter()
        .map(|t| Ok(render::ticket_summary(t, &store.action_label(t)?)))
        .collect()
}

/// Register this server, its staff role, and its moderation log channel
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD"
)]
pub async fn setup(
    ctx: Context<'_>,
    #[description = "Role allowed to use ticket commands"] staff_role: serenity::Role,
    #[description = "Channel tickets are posted to"] modlog: serenity::GuildChannel,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    ctx.data()
        .tickets()
        .register_guild(guild_id, staff_role.id.get(), modlog.id.get())
        .await?;
    info!(target: COMMAND_TARGET, guild_id, "Guild registered");
    ctx.say(format!(
        "Tickets will be posted to <#{}>, staff role is **{}**.",
        modlog.id, staff_role.name
    ))
    .await?;
    Ok(())
}

/// Track a role so granting or removing it creates a ticket
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD"
)]
pub async fn addrole(
    ctx: Context<'_>,
    #[description = "Role to track"] role: serenity::Role,
    #[description = "Action name when granted, e.g. MUTED"] add_name: String,
    #[description = "Action name when removed, e.g. UNMUTED"] remove_name: String,
) -> Result<(), Error> {
    let tracked = ctx
        .data()
        .tickets()
        .add_tracked_role(guild_id(ctx)?, role.id.get(), &add_name, &remove_name)
        .await?;
    ctx.say(format!(
        "Tracking **{}**: granting is {}, removing is {}.",
        role.name, tracked.add_name, tracked.remove_name
    ))
    .await?;
    Ok(())
}

/// Stop tracking a role
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD"
)]
pub async fn rmrole(
    ctx: Context<'_>,
    #[description = "Role to stop tracking"] role: serenity::Role,
) -> Result<(), Error> {
    ctx.data()
        .tickets()
        .remove_tracked_role(guild_id(ctx)?, role.id.get())
        .await?;
    ctx.say(format!("No longer tracking **{}**.", role.name)).await?;
    Ok(())
}

/// Create resolved tickets for every existing ban
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    required_bot_permissions = "BAN_MEMBERS"
)]
pub async fn importbans(ctx: Context<'_>) -> Result<(), Error> {
    let guild = serenity::GuildId::new(guild_id(ctx)?);
    ctx.defer().await?;

    let mut bans = Vec::new();
    let mut after = None;
    loop {
        let page = guild
            .bans(ctx.http(), after.map(UserPagination::After), Some(BAN_PAGE_SIZE))
            .await?;
        let full = page.len() >= usize::from(BAN_PAGE_SIZE);
        after = page.last().map(|ban| ban.user.id);
        bans.extend(page.into_iter().map(|ban| (ban.user.id.get(), ban.reason)));
        if !full {
            break;
        }
    }

    let total = bans.len();
    let imported = ctx.data().tickets().import_bans(guild.get(), bans).await?;
    ctx.say(format!(
        "Imported {} of {total} bans as tickets.",
        imported.len()
    ))
    .await?;
    Ok(())
}

/// Show a ticket
#[command(prefix_command, slash_command, guild_only, check = "is_staff")]
pub async fn show(
    ctx: Context<'_>,
    #[description = "Ticket number"] number: u64,
) -> Result<(), Error> {
    let service = ctx.data().tickets();
    let ticket = service.get_ticket(guild_id(ctx)?, number).await?;
    let content = service.store.render(&ticket)?;
    let mut reply = CreateReply::default();
    if let Some(card) = &content.card {
        reply = reply.embed(card_embed(card));
    }
    ctx.send(reply).await?;
    Ok(())
}

/// Set the reason of one or more tickets, e.g. `setreason 1,2 spam`
#[command(prefix_command, slash_command, guild_only, check = "is_staff")]
pub async fn setreason(
    ctx: Context<'_>,
    #[description = "Ticket numbers, comma separated"] tickets: String,
    #[description = "Reason"]
    #[rest]
    reason: String,
) -> Result<(), Error> {
    let numbers = parse_ticket_numbers(&tickets)?;
    let updated = ctx
        .data()
        .tickets()
        .update_tickets(
            guild_id(ctx)?,
            &numbers,
            TicketChanges::resolve(reason),
            ctx.author().id.get(),
        )
        .await?;
    say_pages(ctx, &summaries(ctx, &updated)?).await
}

/// Hand tickets to another moderator
#[command(prefix_command, slash_command, guild_only, check = "is_staff")]
pub async fn changemod(
    ctx: Context<'_>,
    #[description = "Ticket numbers, comma separated"] tickets: String,
    #[description = "New moderator"] moderator: serenity::User,
) -> Result<(), Error> {
    let numbers = parse_ticket_numbers(&tickets)?;
    ctx.data()
        .tickets()
        .update_tickets(
            guild_id(ctx)?,
            &numbers,
            TicketChanges::reassign(moderator.id.get()),
            ctx.author().id.get(),
        )
        .await?;
    ctx.say(format!(
        "Moved {} ticket(s) to <@{}>.",
        numbers.len(),
        moderator.id
    ))
    .await?;
    Ok(())
}

/// Take over tickets yourself
#[command(prefix_command, slash_command, guild_only, check = "is_staff")]
pub async fn claim(
    ctx: Context<'_>,
    #[description = "Ticket numbers, comma separated"] tickets: String,
) -> Result<(), Error> {
    let numbers = parse_ticket_numbers(&tickets)?;
    let author = ctx.author().id.get();
    ctx.data()
        .tickets()
        .update_tickets(
            guild_id(ctx)?,
            &numbers,
            TicketChanges::reassign(author),
            author,
        )
        .await?;
    ctx.say(format!("Claimed {} ticket(s).", numbers.len())).await?;
    Ok(())
}

/// Leave a note on a user
#[command(prefix_command, slash_command, guild_only, check = "is_staff")]
pub async fn note(
    ctx: Context<'_>,
    #[description = "User the note is about"] user: serenity::User,
    #[description = "Note"]
    #[rest]
    text: String,
) -> Result<(), Error> {
    let new = NewTicket::new(
        guild_id(ctx)?,
        ActionType::Note,
        ctx.author().id.get(),
        user.id.get(),
    )
    .with_reason(Some(text));
    if !new.resolved {
        return Err(TicketError::Invalid("a note needs some text".to_string()).into());
    }
    let ticket = ctx.data().tickets().create_ticket(new).await?;
    ctx.say(format!("Noted as ticket #{}.", ticket.number)).await?;
    Ok(())
}

fn outcome_text(outcome: &PromptOutcome) -> String {
    match outcome {
        PromptOutcome::Resolved(ticket) => format!("Resolved ticket #{}.", ticket.number),
        PromptOutcome::Cancelled => "Cancelled, the ticket is still queued.".to_string(),
        PromptOutcome::TimedOut => "No reason given in time, the ticket is still queued.".to_string(),
        PromptOutcome::Unreachable => "I can't send you direct messages.".to_string(),
        PromptOutcome::Busy => "You already have a prompt open in your direct messages.".to_string(),
        PromptOutcome::Empty => "Your queue is empty.".to_string(),
        PromptOutcome::Stale => "That ticket was already handled.".to_string(),
    }
}

/// List your queued tickets, or answer one in your direct messages
///
/// `ticket` picks a queued ticket by number; `resolve: true` picks the newest.
#[command(prefix_command, slash_command, guild_only, check = "is_staff")]
pub async fn queue(
    ctx: Context<'_>,
    #[description = "Prompt for the next ticket in your direct messages"] resolve: Option<bool>,
    #[description = "Prompt for this queued ticket instead"] ticket: Option<u64>,
) -> Result<(), Error> {
    let service = ctx.data().tickets();
    let author = ctx.author().id.get();

    if let Some(number) = ticket {
        let key = TicketKey::new(guild_id(ctx)?, number);
        ctx.say("Check your direct messages.").await?;
        let outcome = service.prompt_resolution(author, key).await?;
        ctx.say(outcome_text(&outcome)).await?;
        return Ok(());
    }
    if resolve.unwrap_or(false) {
        ctx.say("Check your direct messages.").await?;
        let outcome = service.resolve_next(author).await?;
        ctx.say(outcome_text(&outcome)).await?;
        return Ok(());
    }

    let queued = service.current_queue_for(author);
    if queued.is_empty() {
        ctx.say("Your queue is empty.").await?;
        return Ok(());
    }
    let mut lines = vec![format!("{} ticket(s) awaiting a reason:", queued.len())];
    lines.extend(summaries(ctx, &queued)?);
    say_pages(ctx, &lines).await
}

/// Every ticket about a user
#[command(prefix_command, slash_command, guild_only, check = "is_staff")]
pub async fn userlog(
    ctx: Context<'_>,
    #[description = "User to look up"] user: serenity::User,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let service = ctx.data().tickets();
    let mut tickets = service.get_tickets_for_subject(guild_id, user.id.get()).await?;
    if tickets.is_empty() {
        ctx.say(format!("No tickets for <@{}>.", user.id)).await?;
        return Ok(());
    }
    tickets.sort_by_key(|t| t.number);

    let channel_id = service
        .registry
        .get(guild_id)
        .ok_or(TicketError::GuildNotRegistered(guild_id))?
        .modlog_channel_id();
    let mut lines = vec![format!("Tickets for <@{}>:", user.id)];
    for ticket in &tickets {
        let label = service.store.action_label(ticket)?;
        lines.push(render::user_log_line(ticket, &label, channel_id));
    }
    say_pages(ctx, &lines).await
}

/// Changes made to a ticket
#[command(prefix_command, slash_command, guild_only, check = "is_staff")]
pub async fn tickethistory(
    ctx: Context<'_>,
    #[description = "Ticket number"] number: u64,
) -> Result<(), Error> {
    let key = TicketKey::new(guild_id(ctx)?, number);
    let history = ctx
        .data()
        .tickets()
        .get_history(key.guild_id, key.number)
        .await?;
    let mut lines = vec![format!("History of ticket #{number}:")];
    lines.extend(render::history_lines(&history));
    say_pages(ctx, &lines).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ticket_numbers() {
        assert_eq!(parse_ticket_numbers("1, 2,3").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_ticket_numbers("#4,4, 2").unwrap(), vec![4, 2]);
        assert!(matches!(
            parse_ticket_numbers("1, two"),
            Err(TicketError::Invalid(msg)) if msg.contains("two")
        ));
        assert!(matches!(parse_ticket_numbers(""), Err(TicketError::Invalid(_))));
        assert!(matches!(parse_ticket_numbers("1,,2"), Err(TicketError::Invalid(_))));
    }

    #[test]
    fn test_outcome_text() {
        assert_eq!(outcome_text(&PromptOutcome::Empty), "Your queue is empty.");
        assert!(outcome_text(&PromptOutcome::TimedOut).contains("still queued"));
    }

    #[test]
    fn test_command_definitions() {
        let commands = all();
        assert_eq!(commands.len(), 12);
        assert!(commands.iter().all(|cmd| cmd.guild_only));
        let setup = commands.iter().find(|cmd| cmd.name == "setup").unwrap();
        assert!(setup.checks.is_empty());
        let claim = commands.iter().find(|cmd| cmd.name == "claim").unwrap();
        assert_eq!(claim.checks.len(), 1);
        assert!(claim.create_as_slash_command().is_some());

        for name in ["setup", "addrole", "rmrole", "importbans"] {
            let cmd = commands.iter().find(|cmd| cmd.name == name).unwrap();
            assert!(cmd.checks.is_empty(), "{name}");
            assert!(
                cmd.required_permissions.contains(serenity::Permissions::MANAGE_GUILD),
                "{name}"
            );
        }

        let queue = commands.iter().find(|cmd| cmd.name == "queue").unwrap();
        let params: Vec<&str> = queue.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(params, vec!["resolve", "ticket"]);
        assert!(queue.parameters.iter().all(|p| !p.required));
    }

    #[test]
    fn test_staff_allowed() {
        let staff = serenity::RoleId::new(1);
        let other = serenity::RoleId::new(2);
        let manage = serenity::Permissions::MANAGE_GUILD | serenity::Permissions::SEND_MESSAGES;

        assert!(staff_allowed(&[other, staff], staff, None));
        assert!(staff_allowed(&[], staff, Some(manage)));
        assert!(!staff_allowed(&[other], staff, Some(serenity::Permissions::SEND_MESSAGES)));
        assert!(!staff_allowed(&[other], staff, None));
    }
}
