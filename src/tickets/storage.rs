//! Durable storage for guilds, tracked roles, tickets, and ticket history
//!
//! [`MemoryStorage`] keeps everything in `DashMap`s. [`YamlStorage`] wraps it
//! and rewrites the affected YAML file under the data directory after every
//! write, so the whole state can be reloaded on the next start.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{GuildRecord, Ticket, TicketError, TicketKey, TicketResult, TrackedRole};

/// Operations the ticket system needs from durable storage
#[async_trait]
pub trait Storage: Send + Sync {
    async fn load_guilds(&self) -> TicketResult<Vec<GuildRecord>>;

    /// Insert a guild, or update the staff role and modlog channel of an existing one
    async fn upsert_guild(&self, guild: &GuildRecord) -> TicketResult<()>;

    /// Record the reconciliation watermark of a guild
    async fn save_watermark(
        &self,
        guild_id: u64,
        last_checked: DateTime<Utc>,
        last_audit_entry: u64,
    ) -> TicketResult<()>;

    async fn load_tracked_roles(&self) -> TicketResult<Vec<TrackedRole>>;

    async fn upsert_tracked_role(&self, role: &TrackedRole) -> TicketResult<()>;

    async fn deactivate_tracked_role(&self, guild_id: u64, role_id: u64) -> TicketResult<()>;

    /// Highest ticket number stored for a guild, 0 if none
    async fn ticket_count(&self, guild_id: u64) -> TicketResult<u64>;

    /// Insert a new ticket along with its creation history row
    async fn insert_ticket(&self, ticket: &Ticket) -> TicketResult<()>;

    /// Overwrite a ticket and append a history row with its new state
    async fn update_ticket(&self, ticket: &Ticket) -> TicketResult<()>;

    /// Set the notification message without recording history
    async fn set_notification_message(
        &self,
        key: TicketKey,
        channel_id: u64,
        message_id: u64,
    ) -> TicketResult<()>;

    async fn get_ticket(&self, key: TicketKey) -> TicketResult<Option<Ticket>>;

    /// Snapshots of a ticket, oldest first
    async fn ticket_history(&self, key: TicketKey) -> TicketResult<Vec<Ticket>>;

    /// Tickets against a user, ordered by modification time
    async fn tickets_for_subject(&self, guild_id: u64, subject_id: u64) -> TicketResult<Vec<Ticket>>;

    /// All unresolved tickets, ordered by creation time
    async fn unresolved_tickets(&self) -> TicketResult<Vec<Ticket>>;
}

/// In-memory storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    guilds: DashMap<u64, GuildRecord>,
    roles: DashMap<(u64, u64), TrackedRole>,
    tickets: DashMap<TicketKey, Ticket>,
    history: DashMap<TicketKey, Vec<Ticket>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted<T: Clone, K: Ord>(map: &DashMap<K, T>) -> Vec<T>
    where
        K: std::hash::Hash + Eq + Clone,
    {
        let mut entries: Vec<(K, T)> = map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, v)| v).collect()
    }

    fn all_history(&self) -> Vec<Ticket> {
        Self::sorted(&self.history).into_iter().flatten().collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_guilds(&self) -> TicketResult<Vec<GuildRecord>> {
        Ok(Self::sorted(&self.guilds))
    }

    async fn upsert_guild(&self, guild: &GuildRecord) -> TicketResult<()> {
        self.guilds
            .entry(guild.guild_id)
            .and_modify(|existing| {
                existing.staff_role_id = guild.staff_role_id;
                existing.modlog_channel_id = guild.modlog_channel_id;
            })
            .or_insert_with(|| guild.clone());
        Ok(())
    }

    async fn save_watermark(
        &self,
        guild_id: u64,
        last_checked: DateTime<Utc>,
        last_audit_entry: u64,
    ) -> TicketResult<()> {
        let mut guild = self
            .guilds
            .get_mut(&guild_id)
            .ok_or(TicketError::GuildNotRegistered(guild_id))?;
        guild.last_checked = Some(last_checked);
        guild.last_audit_entry = last_audit_entry;
        Ok(())
    }

    async fn load_tracked_roles(&self) -> TicketResult<Vec<TrackedRole>> {
        Ok(Self::sorted(&self.roles))
    }

    async fn upsert_tracked_role(&self, role: &TrackedRole) -> TicketResult<()> {
        self.roles.insert((role.guild_id, role.role_id), role.clone());
        Ok(())
    }

    async fn deactivate_tracked_role(&self, guild_id: u64, role_id: u64) -> TicketResult<()> {
        let mut role = self
            .roles
            .get_mut(&(guild_id, role_id))
            .ok_or_else(|| TicketError::NotFound(format!("tracked role {role_id}")))?;
        role.active = false;
        Ok(())
    }

    async fn ticket_count(&self, guild_id: u64) -> TicketResult<u64> {
        Ok(self
            .tickets
            .iter()
            .filter(|t| t.key().guild_id == guild_id)
            .map(|t| t.key().number)
            .max()
            .unwrap_or(0))
    }

    async fn insert_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        let key = ticket.key();
        match self.tickets.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TicketError::Conflict(format!("ticket {key} already exists")));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ticket.clone());
            }
        }
        self.history.insert(key, vec![ticket.clone()]);
        Ok(())
    }

    async fn update_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        let key = ticket.key();
        let mut stored = self
            .tickets
            .get_mut(&key)
            .ok_or_else(|| TicketError::NotFound(format!("ticket {key}")))?;
        *stored = ticket.clone();
        drop(stored);
        self.history.entry(key).or_default().push(ticket.clone());
        Ok(())
    }

    async fn set_notification_message(
        &self,
        key: TicketKey,
        channel_id: u64,
        message_id: u64,
    ) -> TicketResult<()> {
        let mut stored = self
            .tickets
            .get_mut(&key)
            .ok_or_else(|| TicketError::NotFound(format!("ticket {key}")))?;
        stored.notification_message_id = Some(message_id);
        stored.notification_channel_id = Some(channel_id);
        drop(stored);
        if let Some(mut rows) = self.history.get_mut(&key) {
            for row in rows.iter_mut() {
                row.notification_message_id = Some(message_id);
                row.notification_channel_id = Some(channel_id);
            }
        }
        Ok(())
    }

    async fn get_ticket(&self, key: TicketKey) -> TicketResult<Option<Ticket>> {
        Ok(self.tickets.get(&key).map(|t| t.value().clone()))
    }

    async fn ticket_history(&self, key: TicketKey) -> TicketResult<Vec<Ticket>> {
        Ok(self
            .history
            .get(&key)
            .map(|rows| rows.value().clone())
            .unwrap_or_default())
    }

    async fn tickets_for_subject(&self, guild_id: u64, subject_id: u64) -> TicketResult<Vec<Ticket>> {
        let mut tickets: Vec<Ticket> = self
            .tickets
            .iter()
            .filter(|t| t.guild_id == guild_id && t.subject_id == subject_id)
            .map(|t| t.value().clone())
            .collect();
        tickets.sort_by_key(|t| (t.modified_at, t.number));
        Ok(tickets)
    }

    async fn unresolved_tickets(&self) -> TicketResult<Vec<Ticket>> {
        let mut tickets: Vec<Ticket> = self
            .tickets
            .iter()
            .filter(|t| !t.resolved)
            .map(|t| t.value().clone())
            .collect();
        tickets.sort_by_key(|t| (t.created_at, t.guild_id, t.number));
        Ok(tickets)
    }
}

const GUILDS_FILE: &str = "guilds.yaml";
const ROLES_FILE: &str = "tracked_roles.yaml";
const TICKETS_FILE: &str = "tickets.yaml";
const HISTORY_FILE: &str = "ticket_history.yaml";

/// YAML-file backed storage
#[derive(Debug)]
pub struct YamlStorage {
    dir: PathBuf,
    inner: MemoryStorage,
    /// Serializes file rewrites
    write_lock: Mutex<()>,
}

impl YamlStorage {
    /// Load storage from a data directory, creating it if needed
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or a file
    /// exists but cannot be read or parsed.
    pub async fn open(dir: impl AsRef<Path>) -> TicketResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let inner = MemoryStorage::new();
        for guild in read_yaml::<GuildRecord>(&dir.join(GUILDS_FILE)).await? {
            inner.guilds.insert(guild.guild_id, guild);
        }
        for role in read_yaml::<TrackedRole>(&dir.join(ROLES_FILE)).await? {
            inner.roles.insert((role.guild_id, role.role_id), role);
        }
        for ticket in read_yaml::<Ticket>(&dir.join(TICKETS_FILE)).await? {
            inner.tickets.insert(ticket.key(), ticket);
        }
        for row in read_yaml::<Ticket>(&dir.join(HISTORY_FILE)).await? {
            inner.history.entry(row.key()).or_default().push(row);
        }

        info!(
            path = %dir.display(),
            guilds = inner.guilds.len(),
            tickets = inner.tickets.len(),
            "Loaded ticket storage"
        );

        Ok(Self {
            dir,
            inner,
            write_lock: Mutex::new(()),
        })
    }

    async fn flush_guilds(&self) -> TicketResult<()> {
        let _guard = self.write_lock.lock().await;
        write_yaml(&self.dir.join(GUILDS_FILE), &MemoryStorage::sorted(&self.inner.guilds)).await
    }

    async fn flush_roles(&self) -> TicketResult<()> {
        let _guard = self.write_lock.lock().await;
        write_yaml(&self.dir.join(ROLES_FILE), &MemoryStorage::sorted(&self.inner.roles)).await
    }

    async fn flush_tickets(&self) -> TicketResult<()> {
        let _guard = self.write_lock.lock().await;
        write_yaml(&self.dir.join(TICKETS_FILE), &MemoryStorage::sorted(&self.inner.tickets)).await?;
        write_yaml(&self.dir.join(HISTORY_FILE), &self.inner.all_history()).await
    }
}

async fn read_yaml<T: DeserializeOwned>(path: &Path) -> TicketResult<Vec<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(serde_yaml::from_str::<Option<Vec<T>>>(&content)?.unwrap_or_default()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temporary file so a crash never leaves a truncated file
async fn write_yaml<T: Serialize>(path: &Path, rows: &[T]) -> TicketResult<()> {
    let yaml = serde_yaml::to_string(rows)?;
    let tmp = path.with_extension("yaml.tmp");
    tokio::fs::write(&tmp, yaml).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), rows = rows.len(), "Flushed storage file");
    Ok(())
}

#[async_trait]
impl Storage for YamlStorage {
    async fn load_guilds(&self) -> TicketResult<Vec<GuildRecord>> {
        self.inner.load_guilds().await
    }

    async fn upsert_guild(&self, guild: &GuildRecord) -> TicketResult<()> {
        self.inner.upsert_guild(guild).await?;
        self.flush_guilds().await
    }

    async fn save_watermark(
        &self,
        guild_id: u64,
        last_checked: DateTime<Utc>,
        last_audit_entry: u64,
    ) -> TicketResult<()> {
        self.inner
            .save_watermark(guild_id, last_checked, last_audit_entry)
            .await?;
        self.flush_guilds().await
    }

    async fn load_tracked_roles(&self) -> TicketResult<Vec<TrackedRole>> {
        self.inner.load_tracked_roles().await
    }

    async fn upsert_tracked_role(&self, role: &TrackedRole) -> TicketResult<()> {
        self.inner.upsert_tracked_role(role).await?;
        self.flush_roles().await
    }

    async fn deactivate_tracked_role(&self, guild_id: u64, role_id: u64) -> TicketResult<()> {
        self.inner.deactivate_tracked_role(guild_id, role_id).await?;
        self.flush_roles().await
    }

    async fn ticket_count(&self, guild_id: u64) -> TicketResult<u64> {
        self.inner.ticket_count(guild_id).await
    }

    async fn insert_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        self.inner.insert_ticket(ticket).await?;
        self.flush_tickets().await
    }

    async fn update_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        self.inner.update_ticket(ticket).await?;
        self.flush_tickets().await
    }

    async fn set_notification_message(
        &self,
        key: TicketKey,
        channel_id: u64,
        message_id: u64,
    ) -> TicketResult<()> {
        self.inner
            .set_notification_message(key, channel_id, message_id)
            .await?;
        self.flush_tickets().await
    }

    async fn get_ticket(&self, key: TicketKey) -> TicketResult<Option<Ticket>> {
        self.inner.get_ticket(key).await
    }

    async fn ticket_history(&self, key: TicketKey) -> TicketResult<Vec<Ticket>> {
        self.inner.ticket_history(key).await
    }

    async fn tickets_for_subject(&self, guild_id: u64, subject_id: u64) -> TicketResult<Vec<Ticket>> {
        self.inner.tickets_for_subject(guild_id, subject_id).await
    }

    async fn unresolved_tickets(&self) -> TicketResult<Vec<Ticket>> {
        self.inner.unresolved_tickets().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tickets::TicketChanges;
    use crate::tickets::record::tests::sample_ticket;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guild(guild_id: u64) -> GuildRecord {
        GuildRecord {
            guild_id,
            staff_role_id: 1,
            modlog_channel_id: 2,
            created_at: Utc::now(),
            last_checked: None,
            last_audit_entry: 0,
        }
    }

    fn temp_dir() -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        std::env::temp_dir().join(format!(
            "ticket-warden-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ))
    }

    #[tokio::test]
    async fn test_upsert_guild_keeps_watermark() {
        let storage = MemoryStorage::new();
        storage.upsert_guild(&guild(10)).await.unwrap();
        let now = Utc::now();
        storage.save_watermark(10, now, 555).await.unwrap();

        let mut updated = guild(10);
        updated.staff_role_id = 9;
        storage.upsert_guild(&updated).await.unwrap();

        let guilds = storage.load_guilds().await.unwrap();
        assert_eq!(guilds.len(), 1);
        assert_eq!(guilds[0].staff_role_id, 9);
        assert_eq!(guilds[0].last_audit_entry, 555);
        assert_eq!(guilds[0].last_checked, Some(now));
    }

    #[tokio::test]
    async fn test_watermark_unknown_guild() {
        let storage = MemoryStorage::new();
        let result = storage.save_watermark(1, Utc::now(), 1).await;
        assert!(matches!(result, Err(TicketError::GuildNotRegistered(1))));
    }

    #[tokio::test]
    async fn test_insert_conflict() {
        let storage = MemoryStorage::new();
        let ticket = sample_ticket(1, 5);
        storage.insert_ticket(&ticket).await.unwrap();
        assert!(matches!(
            storage.insert_ticket(&ticket).await,
            Err(TicketError::Conflict(_))
        ));
        assert_eq!(storage.ticket_count(10).await.unwrap(), 1);
        assert_eq!(storage.ticket_count(11).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_history_rows() {
        let storage = MemoryStorage::new();
        let ticket = sample_ticket(1, 5);
        storage.insert_ticket(&ticket).await.unwrap();
        storage
            .set_notification_message(ticket.key(), 20, 999)
            .await
            .unwrap();

        let resolved = ticket.apply(&TicketChanges::resolve("spam"), 5, Utc::now());
        storage.update_ticket(&resolved).await.unwrap();

        let history = storage.ticket_history(ticket.key()).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].resolved);
        assert_eq!(history[0].notification_message_id, Some(999));
        assert_eq!(history[0].notification_channel_id, Some(20));
        assert_eq!(history[1].reason.as_deref(), Some("spam"));

        let stored = storage.get_ticket(ticket.key()).await.unwrap().unwrap();
        assert!(stored.resolved);
    }

    #[tokio::test]
    async fn test_update_missing_ticket() {
        let storage = MemoryStorage::new();
        let result = storage.update_ticket(&sample_ticket(3, 5)).await;
        assert!(matches!(result, Err(TicketError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unresolved_and_subject_queries() {
        let storage = MemoryStorage::new();
        let first = sample_ticket(1, 5);
        let second = sample_ticket(2, 5);
        let mut third = sample_ticket(3, 6);
        third.subject_id = first.subject_id;
        storage.insert_ticket(&third).await.unwrap();
        storage.insert_ticket(&first).await.unwrap();
        storage.insert_ticket(&second).await.unwrap();
        storage
            .update_ticket(&second.apply(&TicketChanges::resolve("ok"), 5, Utc::now()))
            .await
            .unwrap();

        let open: Vec<u64> = storage
            .unresolved_tickets()
            .await
            .unwrap()
            .iter()
            .map(|t| t.number)
            .collect();
        assert_eq!(open, vec![1, 3]);

        let subject: Vec<u64> = storage
            .tickets_for_subject(10, first.subject_id)
            .await
            .unwrap()
            .iter()
            .map(|t| t.number)
            .collect();
        assert_eq!(subject, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_tracked_role_soft_delete() {
        let storage = MemoryStorage::new();
        let role = TrackedRole {
            guild_id: 10,
            role_id: 77,
            add_name: "MUTED".to_string(),
            remove_name: "UNMUTED".to_string(),
            active: true,
        };
        storage.upsert_tracked_role(&role).await.unwrap();
        storage.deactivate_tracked_role(10, 77).await.unwrap();
        let roles = storage.load_tracked_roles().await.unwrap();
        assert_eq!(roles.len(), 1);
        assert!(!roles[0].active);
        assert!(storage.deactivate_tracked_role(10, 78).await.is_err());
    }

    #[tokio::test]
    async fn test_yaml_storage_reload() {
        let dir = temp_dir();
        {
            let storage = YamlStorage::open(&dir).await.unwrap();
            storage.upsert_guild(&guild(10)).await.unwrap();
            storage.save_watermark(10, Utc::now(), 42).await.unwrap();
            let ticket = sample_ticket(1, 5);
            storage.insert_ticket(&ticket).await.unwrap();
            storage
                .update_ticket(&ticket.apply(&TicketChanges::reassign(6), 5, Utc::now()))
                .await
                .unwrap();
        }

        let reloaded = YamlStorage::open(&dir).await.unwrap();
        let guilds = reloaded.load_guilds().await.unwrap();
        assert_eq!(guilds[0].last_audit_entry, 42);
        let ticket = reloaded
            .get_ticket(TicketKey::new(10, 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticket.moderator_id, 6);
        assert_eq!(
            reloaded.ticket_history(ticket.key()).await.unwrap().len(),
            2
        );
        assert_eq!(reloaded.ticket_count(10).await.unwrap(), 1);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
