//! Per-guild state
//!
//! Each registered guild owns two locks: the reconciliation lock, which owns
//! the audit log watermark, and the allocation lock, which owns the ticket
//! counter. Settings and tracked roles are plain shared state.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, watch};

use tracing::{info, warn};

use super::{ActionType, Storage, Ticket, TicketError, TicketResult};

/// Durable guild registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildRecord {
    pub guild_id: u64,
    pub staff_role_id: u64,
    pub modlog_channel_id: u64,
    pub created_at: DateTime<Utc>,
    /// Time of the last reconciliation pass, if any
    pub last_checked: Option<DateTime<Utc>>,
    /// Highest audit log entry id processed
    pub last_audit_entry: u64,
}

/// A role whose grant or removal counts as a moderation action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRole {
    pub guild_id: u64,
    pub role_id: u64,
    /// Action name used when the role is granted, e.g. `MUTED`
    pub add_name: String,
    /// Action name used when the role is revoked, e.g. `UNMUTED`
    pub remove_name: String,
    /// Soft-delete flag; inactive roles are kept for rendering old tickets
    pub active: bool,
}

/// Mutable guild settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuildSettings {
    pub staff_role_id: u64,
    pub modlog_channel_id: u64,
}

/// Audit log watermark, owned by the reconciliation lock
#[derive(Debug, Clone)]
pub struct AuditWatermark {
    pub last_checked: DateTime<Utc>,
    pub last_entry: u64,
    /// Entries already turned into tickets, with their creation time
    pub handled: BTreeMap<u64, DateTime<Utc>>,
}

impl AuditWatermark {
    #[must_use]
    pub fn new(last_checked: DateTime<Utc>, last_entry: u64) -> Self {
        Self {
            last_checked,
            last_entry,
            handled: BTreeMap::new(),
        }
    }

    /// Whether an entry falls at or behind the watermark
    #[must_use]
    pub fn covers(&self, entry_id: u64, created_at: DateTime<Utc>) -> bool {
        created_at <= self.last_checked && entry_id <= self.last_entry
    }

    /// Forget handled entries that the watermark itself now covers
    pub fn prune(&mut self) {
        let (last_checked, last_entry) = (self.last_checked, self.last_entry);
        self.handled
            .retain(|id, created_at| !(*created_at <= last_checked && *id <= last_entry));
    }
}

/// In-memory state of a registered guild
#[derive(Debug)]
pub struct GuildState {
    pub guild_id: u64,
    pub created_at: DateTime<Utc>,
    settings: RwLock<GuildSettings>,
    tracked_roles: DashMap<u64, TrackedRole>,
    /// Reconciliation lock
    pub audit: Mutex<AuditWatermark>,
    /// Ticket number allocation lock, holds the last allocated number
    pub ticket_count: Mutex<u64>,
}

impl GuildState {
    #[must_use]
    pub fn new(record: &GuildRecord, ticket_count: u64) -> Self {
        Self {
            guild_id: record.guild_id,
            created_at: record.created_at,
            settings: RwLock::new(GuildSettings {
                staff_role_id: record.staff_role_id,
                modlog_channel_id: record.modlog_channel_id,
            }),
            tracked_roles: DashMap::new(),
            audit: Mutex::new(AuditWatermark::new(
                record.last_checked.unwrap_or(record.created_at),
                record.last_audit_entry,
            )),
            ticket_count: Mutex::new(ticket_count),
        }
    }

    #[must_use]
    pub fn settings(&self) -> GuildSettings {
        *self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_settings(&self, settings: GuildSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    #[must_use]
    pub fn modlog_channel_id(&self) -> u64 {
        self.settings().modlog_channel_id
    }

    /// Insert or replace a tracked role entry
    pub fn put_tracked_role(&self, role: TrackedRole) {
        self.tracked_roles.insert(role.role_id, role);
    }

    /// Mark a tracked role inactive, returning whether it was active
    pub fn deactivate_role(&self, role_id: u64) -> bool {
        self.tracked_roles
            .get_mut(&role_id)
            .is_some_and(|mut role| std::mem::replace(&mut role.active, false))
    }

    #[must_use]
    pub fn tracked_role(&self, role_id: u64) -> Option<TrackedRole> {
        self.tracked_roles.get(&role_id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn is_tracked(&self, role_id: u64) -> bool {
        self.tracked_roles.get(&role_id).is_some_and(|r| r.active)
    }

    /// Ids of all currently active tracked roles
    #[must_use]
    pub fn active_roles(&self) -> HashSet<u64> {
        self.tracked_roles
            .iter()
            .filter(|r| r.active)
            .map(|r| r.role_id)
            .collect()
    }

    /// Display name of the action a ticket records
    #[must_use]
    pub fn action_label(&self, ticket: &Ticket) -> String {
        let role = ticket.role_id.and_then(|id| self.tracked_role(id));
        match (ticket.action, role) {
            (ActionType::RoleAdd, Some(role)) => role.add_name,
            (ActionType::RoleRemove, Some(role)) => role.remove_name,
            (action, _) => action.to_string(),
        }
    }

    /// Last allocated ticket number
    pub async fn ticket_count(&self) -> u64 {
        *self.ticket_count.lock().await
    }
}

/// Registry of guild states plus the startup readiness gate
pub struct GuildRegistry {
    guilds: DashMap<u64, Arc<GuildState>>,
    storage: Arc<dyn Storage>,
    ready: watch::Sender<bool>,
}

impl std::fmt::Debug for GuildRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuildRegistry")
            .field("guilds", &self.guilds)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl GuildRegistry {
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            guilds: DashMap::new(),
            storage,
            ready,
        }
    }

    /// Load registered guilds and their tracked roles from storage
    ///
    /// # Errors
    /// Returns a storage error.
    pub async fn load(&self) -> TicketResult<usize> {
        for record in self.storage.load_guilds().await? {
            let count = self.storage.ticket_count(record.guild_id).await?;
            self.insert(GuildState::new(&record, count));
        }
        for role in self.storage.load_tracked_roles().await? {
            match self.get(role.guild_id) {
                Some(guild) => guild.put_tracked_role(role),
                None => warn!(
                    guild_id = role.guild_id,
                    role_id = role.role_id,
                    "Tracked role for unregistered guild"
                ),
            }
        }
        Ok(self.guilds.len())
    }

    /// Register a guild, or update the staff role and modlog channel of a registered one
    ///
    /// # Errors
    /// Returns `Invalid` for zero ids, or a storage error.
    pub async fn register_guild(
        &self,
        guild_id: u64,
        staff_role_id: u64,
        modlog_channel_id: u64,
    ) -> TicketResult<Arc<GuildState>> {
        if guild_id == 0 || staff_role_id == 0 || modlog_channel_id == 0 {
            return Err(TicketError::Invalid(
                "guild, staff role, and modlog channel are required".to_string(),
            ));
        }
        let settings = GuildSettings {
            staff_role_id,
            modlog_channel_id,
        };
        let existing = self.get(guild_id);
        let record = GuildRecord {
            guild_id,
            staff_role_id,
            modlog_channel_id,
            created_at: existing.as_ref().map_or_else(Utc::now, |g| g.created_at),
            last_checked: None,
            last_audit_entry: 0,
        };
        self.storage.upsert_guild(&record).await?;

        let state = match existing {
            Some(state) => {
                state.set_settings(settings);
                state
            }
            None => {
                let count = self.storage.ticket_count(guild_id).await?;
                self.insert(GuildState::new(&record, count))
            }
        };
        info!(guild_id, staff_role_id, modlog_channel_id, "Guild registered");
        Ok(state)
    }

    /// Start tracking a role, or rename the actions of a tracked one
    ///
    /// # Errors
    /// Returns `GuildNotRegistered`, `Invalid` for blank action names, or a storage error.
    pub async fn add_tracked_role(
        &self,
        guild_id: u64,
        role_id: u64,
        add_name: &str,
        remove_name: &str,
    ) -> TicketResult<TrackedRole> {
        let guild = self
            .get(guild_id)
            .ok_or(TicketError::GuildNotRegistered(guild_id))?;
        let (add_name, remove_name) = (add_name.trim(), remove_name.trim());
        if add_name.is_empty() || remove_name.is_empty() {
            return Err(TicketError::Invalid(
                "both action names must be given".to_string(),
            ));
        }
        let role = TrackedRole {
            guild_id,
            role_id,
            add_name: add_name.to_string(),
            remove_name: remove_name.to_string(),
            active: true,
        };
        self.storage.upsert_tracked_role(&role).await?;
        guild.put_tracked_role(role.clone());
        info!(guild_id, role_id, add_name, remove_name, "Tracked role added");
        Ok(role)
    }

    /// Stop tracking a role. The role entry is kept, inactive.
    ///
    /// # Errors
    /// Returns `GuildNotRegistered`, `NotFound` if the role is not tracked, or a storage error.
    pub async fn remove_tracked_role(&self, guild_id: u64, role_id: u64) -> TicketResult<()> {
        let guild = self
            .get(guild_id)
            .ok_or(TicketError::GuildNotRegistered(guild_id))?;
        if !guild.is_tracked(role_id) {
            return Err(TicketError::NotFound(format!(
                "role {role_id} is not being tracked"
            )));
        }
        self.storage.deactivate_tracked_role(guild_id, role_id).await?;
        guild.deactivate_role(role_id);
        info!(guild_id, role_id, "Tracked role removed");
        Ok(())
    }

    #[must_use]
    pub fn get(&self, guild_id: u64) -> Option<Arc<GuildState>> {
        self.guilds.get(&guild_id).map(|g| Arc::clone(g.value()))
    }

    pub fn insert(&self, state: GuildState) -> Arc<GuildState> {
        let state = Arc::new(state);
        self.guilds.insert(state.guild_id, Arc::clone(&state));
        state
    }

    #[must_use]
    pub fn guild_ids(&self) -> Vec<u64> {
        self.guilds.iter().map(|g| *g.key()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.guilds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guilds.is_empty()
    }

    /// Open the readiness gate
    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until startup loading has finished
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as the registry, so this cannot fail
        let _ = rx.wait_for(|ready| *ready).await;
    }
}
