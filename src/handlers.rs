use std::collections::HashSet;

use poise::serenity_prelude::{self as serenity, FullEvent, GuildId, Member, RoleId};
use tracing::{debug, info, warn};

use crate::{Data, EVENT_TARGET, Error};

/// Route gateway events to the ticket service
///
/// Moderation events only tell us that something happened; the audit log is
/// the source of truth, so each of them just asks for a reconciliation pass.
///
/// # Errors
/// Never fails; the signature is what poise expects.
pub async fn event_handler(
    ctx: &serenity::Context,
    event: &FullEvent,
    _framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    match event {
        FullEvent::Ready { data_about_bot } => {
            let user_name = &data_about_bot.user.name;
            let shard_id = ctx.shard_id;
            info!(target: EVENT_TARGET, "Connected as {user_name}, shard {shard_id}");
        }
        FullEvent::CacheReady { guilds } => {
            let guild_count_cache = ctx.cache.guild_count();
            let guild_count = guilds.len();
            if guild_count != guild_count_cache {
                warn!(
                    target: EVENT_TARGET,
                    "Cache guild count mismatch: {guild_count_cache} (cache) vs {guild_count} (actual)"
                );
            }
            info!(target: EVENT_TARGET, "Cache ready! The bot is in {guild_count} guild(s)");
        }
        FullEvent::GuildBanAddition { guild_id, .. }
        | FullEvent::GuildBanRemoval { guild_id, .. }
        | FullEvent::GuildMemberRemoval { guild_id, .. }
        | FullEvent::GuildAuditLogEntryCreate { guild_id, .. } => {
            request_reconcile(data, *guild_id, "moderation event");
        }
        FullEvent::GuildMemberUpdate {
            old_if_available,
            event,
            ..
        } => {
            let Some(guild) = data.tickets().registry.get(event.guild_id.get()) else {
                return Ok(());
            };
            let old = old_if_available.as_ref().map(member_roles);
            let new = role_ids(&event.roles);
            if tracked_roles_changed(old.as_deref(), &new, &guild.active_roles()) {
                request_reconcile(data, event.guild_id, "tracked role change");
            }
        }
        _ => {}
    }
    Ok(())
}

fn request_reconcile(data: &Data, guild_id: GuildId, why: &str) {
    let guild_id = guild_id.get();
    if data.tickets().registry.get(guild_id).is_none() {
        return;
    }
    debug!(target: EVENT_TARGET, guild_id, why, "Requesting reconciliation");
    data.tickets().notify_reconcile(guild_id);
}

fn role_ids(roles: &[RoleId]) -> Vec<u64> {
    roles.iter().map(|role| role.get()).collect()
}

fn member_roles(member: &Member) -> Vec<u64> {
    role_ids(&member.roles)
}

/// Whether a member update touched any tracked role
///
/// Without the old role list we cannot tell, so any guild with tracked roles
/// gets a pass.
fn tracked_roles_changed(old: Option<&[u64]>, new: &[u64], tracked: &HashSet<u64>) -> bool {
    let Some(old) = old else {
        return !tracked.is_empty();
    };
    let old: HashSet<u64> = old.iter().copied().collect();
    let new: HashSet<u64> = new.iter().copied().collect();
    old.symmetric_difference(&new).any(|role| tracked.contains(role))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_role_change_detection() {
        let tracked: HashSet<u64> = [77].into_iter().collect();
        assert!(tracked_roles_changed(Some(&[1]), &[1, 77], &tracked));
        assert!(tracked_roles_changed(Some(&[1, 77]), &[1], &tracked));
        assert!(!tracked_roles_changed(Some(&[1, 77]), &[77, 1], &tracked));
        assert!(!tracked_roles_changed(Some(&[1]), &[1, 2], &tracked));
    }

    #[test]
    fn test_unknown_old_roles() {
        let tracked: HashSet<u64> = [77].into_iter().collect();
        assert!(tracked_roles_changed(None, &[1], &tracked));
        assert!(!tracked_roles_changed(None, &[1], &HashSet::new()));
    }

    #[test]
    fn test_role_ids() {
        assert_eq!(role_ids(&[RoleId::new(3), RoleId::new(9)]), vec![3, 9]);
    }
}
