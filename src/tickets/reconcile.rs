//! Audit log reconciliation
//!
//! A pass turns the audit log entries a guild produced since its watermark
//! into tickets. Passes for the same guild are serialized by the guild's
//! reconciliation lock, and an entry is turned into tickets at most once no
//! matter how often it is delivered.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::platform::{AuditAction, AuditEntry, Platform, snowflake_at};
use crate::tickets::{
    ActionType, AuditWatermark, GuildRegistry, GuildState, NewTicket, Storage, TicketError,
    TicketKey, TicketResult, TicketStore,
};

/// What a reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub guild_id: u64,
    /// Entries returned by the platform
    pub fetched: usize,
    /// Entries already handled or behind the watermark
    pub skipped: usize,
    /// Tickets created, in creation order
    pub created: Vec<TicketKey>,
    /// Tickets dropped because the notification channel was unreachable
    pub abandoned: usize,
}

/// Turns audit log entries into tickets
pub struct AuditReconciler {
    registry: Arc<GuildRegistry>,
    store: Arc<TicketStore>,
    storage: Arc<dyn Storage>,
    platform: Arc<dyn Platform>,
}

impl std::fmt::Debug for AuditReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditReconciler")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl AuditReconciler {
    #[must_use]
    pub fn new(
        registry: Arc<GuildRegistry>,
        store: Arc<TicketStore>,
        storage: Arc<dyn Storage>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            registry,
            store,
            storage,
            platform,
        }
    }

    /// Run one reconciliation pass for a guild
    ///
    /// The recorded watermark time is advanced to now before the scan, so
    /// entries that appear while the pass runs are picked up by the next one.
    ///
    /// # Errors
    /// Returns `GuildNotRegistered`, or a storage or platform error. The
    /// watermark reached so far is still persisted when the scan fails.
    pub async fn reconcile(&self, guild_id: u64) -> TicketResult<ReconcileReport> {
        self.registry.wait_ready().await;
        let guild = self
            .registry
            .get(guild_id)
            .ok_or(TicketError::GuildNotRegistered(guild_id))?;

        let mut mark = guild.audit.lock().await;
        let (prev_checked, prev_entry) = (mark.last_checked, mark.last_entry);
        let now = Utc::now();
        self.storage.save_watermark(guild_id, now, prev_entry).await?;
        mark.last_checked = now;

        let mut report = ReconcileReport {
            guild_id,
            ..Default::default()
        };
        let scanned = self
            .scan(&guild, &mut mark, prev_checked, prev_entry, &mut report)
            .await;

        mark.prune();
        let saved = self
            .storage
            .save_watermark(guild_id, mark.last_checked, mark.last_entry)
            .await;
        drop(mark);

        match (scanned, saved) {
            (Err(e), saved) => {
                if let Err(save_err) = saved {
                    warn!(guild_id, error = %save_err, "Failed to save watermark after failed pass");
                }
                warn!(guild_id, error = %e, created = report.created.len(), "Reconciliation aborted");
                Err(e)
            }
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => {
                if report.created.is_empty() {
                    debug!(guild_id, fetched = report.fetched, "Reconciliation found nothing new");
                } else {
                    info!(
                        guild_id,
                        fetched = report.fetched,
                        skipped = report.skipped,
                        created = report.created.len(),
                        abandoned = report.abandoned,
                        "Reconciliation pass complete"
                    );
                }
                Ok(report)
            }
        }
    }

    async fn scan(
        &self,
        guild: &GuildState,
        mark: &mut AuditWatermark,
        prev_checked: DateTime<Utc>,
        prev_entry: u64,
        report: &mut ReconcileReport,
    ) -> TicketResult<()> {
        let after = if prev_entry == 0 {
            snowflake_at(prev_checked)
        } else {
            prev_entry
        };
        let mut entries = self.platform.fetch_audit_entries(guild.guild_id, after).await?;
        entries.sort_by_key(|e| e.id);
        report.fetched = entries.len();

        let boundary = AuditWatermark::new(prev_checked, prev_entry);
        for entry in entries {
            if mark.handled.contains_key(&entry.id) || boundary.covers(entry.id, entry.created_at) {
                report.skipped += 1;
                continue;
            }
            mark.handled.insert(entry.id, entry.created_at);
            mark.last_entry = mark.last_entry.max(entry.id);

            for new in tickets_for(guild, &entry) {
                match self.store.create_ticket(new).await {
                    Ok(ticket) => report.created.push(ticket.key()),
                    Err(e) if e.is_delivery_failure() => {
                        warn!(
                            guild_id = guild.guild_id,
                            audit_entry_id = entry.id,
                            error = %e,
                            "Ticket abandoned, notification channel unreachable"
                        );
                        report.abandoned += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

/// Tickets an audit log entry stands for; role updates only count tracked roles
#[must_use]
pub fn tickets_for(guild: &GuildState, entry: &AuditEntry) -> Vec<NewTicket> {
    let ticket = |action| {
        NewTicket::new(guild.guild_id, action, entry.actor_id, entry.target_id)
            .with_reason(entry.reason.clone())
            .from_audit_entry(entry.id, entry.created_at)
    };
    match &entry.action {
        AuditAction::Ban => vec![ticket(ActionType::Ban)],
        AuditAction::Unban => vec![ticket(ActionType::Unban)],
        AuditAction::Kick => vec![ticket(ActionType::Kick)],
        AuditAction::MemberRoleUpdate { before, after } => {
            let tracked = guild.active_roles();
            let added = after
                .iter()
                .filter(|role| tracked.contains(role) && !before.contains(role))
                .map(|&role| ticket(ActionType::RoleAdd).with_role(role));
            let removed = before
                .iter()
                .filter(|role| tracked.contains(role) && !after.contains(role))
                .map(|&role| ticket(ActionType::RoleRemove).with_role(role));
            added.chain(removed).collect()
        }
        AuditAction::Other => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tickets::testing::{GUILD, MODLOG, Outbox, registered};

    const MOD: u64 = 5;
    const TARGET: u64 = 6;
    const MUTED: u64 = 77;

    struct Fixture {
        outbox: Arc<Outbox>,
        registry: Arc<GuildRegistry>,
        storage: Arc<dyn Storage>,
        store: Arc<TicketStore>,
        reconciler: Arc<AuditReconciler>,
    }

    async fn fixture() -> Fixture {
        let outbox = Outbox::new();
        let platform: Arc<dyn Platform> = Arc::new(outbox.platform());
        let (storage, registry) = registered().await;
        registry
            .add_tracked_role(GUILD, MUTED, "MUTED", "UNMUTED")
            .await
            .unwrap();
        let store = Arc::new(TicketStore::new(
            Arc::clone(&storage),
            Arc::clone(&registry),
            Arc::clone(&platform),
        ));
        let reconciler = Arc::new(AuditReconciler::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&storage),
            platform,
        ));
        Fixture {
            outbox,
            registry,
            storage,
            store,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_ban_becomes_one_ticket() {
        let f = fixture().await;
        let entry = f.outbox.audit(1, MOD, TARGET, AuditAction::Ban);

        let report = f.reconciler.reconcile(GUILD).await.unwrap();
        assert_eq!(report.created, vec![TicketKey::new(GUILD, 1)]);

        let ticket = f.store.get_ticket(GUILD, 1).await.unwrap();
        assert_eq!(ticket.action, ActionType::Ban);
        assert_eq!(ticket.moderator_id, MOD);
        assert_eq!(ticket.subject_id, TARGET);
        assert_eq!(ticket.audit_entry_id, Some(entry.id));
        assert_eq!(ticket.created_at, entry.created_at);
        assert!(!ticket.resolved);
        assert!(ticket.reason.is_none());

        let again = f.reconciler.reconcile(GUILD).await.unwrap();
        assert!(again.created.is_empty());
        assert!(f.store.get_ticket(GUILD, 2).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let f = fixture().await;
        let kick = f.outbox.audit(1, MOD, TARGET, AuditAction::Kick);
        f.outbox.push_entry(kick.clone());
        f.outbox.audit(2, MOD, 7, AuditAction::Unban);

        let first = f.reconciler.reconcile(GUILD).await.unwrap();
        assert_eq!(first.fetched, 3);
        assert_eq!(first.skipped, 1);
        assert_eq!(first.created.len(), 2);

        // Redelivered again after the watermark moved
        f.outbox.push_entry(kick);
        for _ in 0..3 {
            assert!(f.reconciler.reconcile(GUILD).await.unwrap().created.is_empty());
        }
        assert_eq!(f.registry.get(GUILD).unwrap().ticket_count().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_passes_are_serialized() {
        let f = fixture().await;
        f.outbox.audit(1, MOD, TARGET, AuditAction::Ban);

        let (a, b) = tokio::join!(f.reconciler.reconcile(GUILD), f.reconciler.reconcile(GUILD));
        let created = a.unwrap().created.len() + b.unwrap().created.len();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_reason_resolves_ticket() {
        let f = fixture().await;
        let mut entry = f.outbox.audit(1, MOD, TARGET, AuditAction::Ban);
        entry.id += 1_000;
        entry.reason = Some("raiding".to_string());
        f.outbox.push_entry(entry);

        let report = f.reconciler.reconcile(GUILD).await.unwrap();
        assert_eq!(report.created.len(), 2);
        let ticket = f.store.get_ticket(GUILD, 2).await.unwrap();
        assert!(ticket.resolved);
        assert_eq!(ticket.reason.as_deref(), Some("raiding"));
    }

    #[tokio::test]
    async fn test_tracked_role_grant_and_revoke() {
        let f = fixture().await;
        f.outbox.audit(
            1,
            MOD,
            TARGET,
            AuditAction::MemberRoleUpdate {
                before: vec![],
                after: vec![MUTED, 999],
            },
        );
        f.outbox.audit(
            2,
            MOD,
            TARGET,
            AuditAction::MemberRoleUpdate {
                before: vec![MUTED],
                after: vec![],
            },
        );

        let report = f.reconciler.reconcile(GUILD).await.unwrap();
        assert_eq!(report.created.len(), 2);

        let granted = f.store.get_ticket(GUILD, 1).await.unwrap();
        let revoked = f.store.get_ticket(GUILD, 2).await.unwrap();
        assert_eq!(granted.action, ActionType::RoleAdd);
        assert_eq!(granted.role_id, Some(MUTED));
        assert_eq!(f.store.action_label(&granted).unwrap(), "MUTED");
        assert_eq!(revoked.action, ActionType::RoleRemove);
        assert_eq!(f.store.action_label(&revoked).unwrap(), "UNMUTED");
    }

    #[tokio::test]
    async fn test_untracked_roles_and_other_actions_ignored() {
        let f = fixture().await;
        f.registry.remove_tracked_role(GUILD, MUTED).await.unwrap();
        f.outbox.audit(
            1,
            MOD,
            TARGET,
            AuditAction::MemberRoleUpdate {
                before: vec![],
                after: vec![MUTED],
            },
        );
        f.outbox.audit(2, MOD, TARGET, AuditAction::Other);

        let report = f.reconciler.reconcile(GUILD).await.unwrap();
        assert_eq!(report.fetched, 2);
        assert!(report.created.is_empty());
        // Both entries still count as handled
        let mark = f.registry.get(GUILD).unwrap();
        assert!(mark.audit.lock().await.last_entry > 0);
    }

    #[tokio::test]
    async fn test_channel_gone_abandons_only_that_ticket() {
        let f = fixture().await;
        f.outbox.delete_channel(MODLOG);
        f.outbox.audit(1, MOD, TARGET, AuditAction::Ban);

        let report = f.reconciler.reconcile(GUILD).await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert!(report.created.is_empty());
        assert_eq!(f.registry.get(GUILD).unwrap().ticket_count().await, 0);

        // The entry is not retried once the channel is back
        f.registry.register_guild(GUILD, 1, MODLOG + 1).await.unwrap();
        assert!(f.reconciler.reconcile(GUILD).await.unwrap().created.is_empty());
    }

    #[tokio::test]
    async fn test_watermark_is_persisted_and_cursor_advances() {
        let f = fixture().await;
        let entry = f.outbox.audit(1, MOD, TARGET, AuditAction::Kick);
        f.reconciler.reconcile(GUILD).await.unwrap();
        f.reconciler.reconcile(GUILD).await.unwrap();

        let fetches = f.outbox.fetches.lock().unwrap().clone();
        assert_eq!(fetches.len(), 2);
        assert!(fetches[0] < entry.id);
        assert_eq!(fetches[1], entry.id);

        let stored = f.storage.load_guilds().await.unwrap();
        assert_eq!(stored[0].last_audit_entry, entry.id);
        assert!(stored[0].last_checked.is_some());
    }

    #[tokio::test]
    async fn test_unregistered_guild() {
        let f = fixture().await;
        assert!(matches!(
            f.reconciler.reconcile(99).await,
            Err(TicketError::GuildNotRegistered(99))
        ));
    }

    #[test]
    fn test_tickets_for_role_diff() {
        let record = crate::tickets::GuildRecord {
            guild_id: GUILD,
            staff_role_id: 1,
            modlog_channel_id: MODLOG,
            created_at: Utc::now(),
            last_checked: None,
            last_audit_entry: 0,
        };
        let guild = GuildState::new(&record, 0);
        for role_id in [MUTED, 78] {
            guild.put_tracked_role(crate::tickets::TrackedRole {
                guild_id: GUILD,
                role_id,
                add_name: "ON".to_string(),
                remove_name: "OFF".to_string(),
                active: true,
            });
        }
        let entry = AuditEntry {
            id: 42,
            created_at: Utc::now(),
            actor_id: MOD,
            target_id: TARGET,
            action: AuditAction::MemberRoleUpdate {
                before: vec![78],
                after: vec![MUTED, 3],
            },
            reason: Some(" ".to_string()),
        };
        let tickets = tickets_for(&guild, &entry);
        assert_eq!(tickets.len(), 2);
        assert_eq!(tickets[0].action, ActionType::RoleAdd);
        assert_eq!(tickets[0].role_id, Some(MUTED));
        assert_eq!(tickets[1].action, ActionType::RoleRemove);
        assert_eq!(tickets[1].role_id, Some(78));
        // A blank reason does not resolve
        assert!(!tickets[0].resolved);
        assert_eq!(tickets[0].audit_entry_id, Some(42));
    }
}
