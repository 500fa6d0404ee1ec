//! Ticket service
//!
//! Wires the guild registry, ticket store, moderator queues, and audit
//! reconciler together, and runs the background loop that serves
//! reconciliation requests and the periodic reminder sweep.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::platform::Platform;
use crate::tasks::TaskSupervisor;
use crate::tickets::{
    ActionType, AuditReconciler, GuildRegistry, GuildState, NewTicket, PromptOutcome,
    QueueManager, QueueSettings, ReconcileReport, Storage, Ticket, TicketChanges, TicketError,
    TicketKey, TicketResult, TicketStore, TrackedRole,
};

/// Requests served by the background loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRequest {
    /// Reconcile a guild's audit log
    Reconcile { guild_id: u64 },
    /// Run a reminder sweep now
    SweepReminders,
    /// Stop the loop
    Shutdown,
}

/// Timing of the ticket service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    pub queue: QueueSettings,
    /// Period of the reminder sweep
    pub reminder_interval: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            queue: QueueSettings::default(),
            reminder_interval: Duration::from_secs(300),
        }
    }
}

/// What startup loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupReport {
    pub guilds: usize,
    pub queued: usize,
}

/// Entry point for everything ticket related
pub struct TicketService {
    pub registry: Arc<GuildRegistry>,
    pub store: Arc<TicketStore>,
    pub queues: Arc<QueueManager>,
    pub reconciler: Arc<AuditReconciler>,
    tasks: TaskSupervisor,
    settings: ServiceSettings,
    tx: Sender<ServiceRequest>,
    rx: Mutex<Option<Receiver<ServiceRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TicketService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketService")
            .field("registry", &self.registry)
            .field("queues", &self.queues)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl TicketService {
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        platform: Arc<dyn Platform>,
        settings: ServiceSettings,
    ) -> Arc<Self> {
        let tasks = TaskSupervisor::new();
        let registry = Arc::new(GuildRegistry::new(Arc::clone(&storage)));
        let store = Arc::new(TicketStore::new(
            Arc::clone(&storage),
            Arc::clone(&registry),
            Arc::clone(&platform),
        ));
        let queues = QueueManager::new(
            Arc::clone(&store),
            Arc::clone(&platform),
            tasks.clone(),
            settings.queue,
        );
        let reconciler = Arc::new(AuditReconciler::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            storage,
            platform,
        ));
        let (tx, rx) = mpsc::channel(100);
        Arc::new(Self {
            registry,
            store,
            queues,
            reconciler,
            tasks,
            settings,
            tx,
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        })
    }

    /// Load state, open the readiness gate, start catch-up, and spawn the background loop
    ///
    /// # Errors
    /// Returns a storage error if loading fails; the gate stays closed.
    pub async fn start(self: &Arc<Self>) -> TicketResult<StartupReport> {
        let guilds = self.registry.load().await?;
        let unresolved = self.store.unresolved_tickets().await?;
        let queued = self.queues.restore_queues(unresolved).await;
        self.registry.mark_ready();
        info!(guilds, queued, "Ticket service ready");

        for guild_id in self.registry.guild_ids() {
            self.spawn_reconcile(guild_id);
        }

        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match rx {
            Some(rx) => {
                let service = Arc::clone(self);
                let handle = tokio::spawn(async move { service.run(rx).await });
                *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            None => warn!("Ticket service already started"),
        }
        Ok(StartupReport { guilds, queued })
    }

    async fn run(&self, mut rx: Receiver<ServiceRequest>) {
        info!(
            interval_secs = self.settings.reminder_interval.as_secs(),
            "Starting ticket service loop"
        );
        let mut interval = tokio::time::interval(self.settings.reminder_interval);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                Some(request) = rx.recv() => match request {
                    ServiceRequest::Reconcile { guild_id } => self.spawn_reconcile(guild_id),
                    ServiceRequest::SweepReminders => {
                        self.queues.sweep_reminders();
                    }
                    ServiceRequest::Shutdown => {
                        info!("Ticket service loop stopping");
                        break;
                    }
                },
                _ = interval.tick() => {
                    self.queues.sweep_reminders();
                }
            }
        }
    }

    fn spawn_reconcile(&self, guild_id: u64) {
        let reconciler = Arc::clone(&self.reconciler);
        self.tasks.spawn(async move {
            if let Err(e) = reconciler.reconcile(guild_id).await {
                error!(guild_id, error = %e, "Reconciliation failed");
            }
        });
    }

    /// Ask the background loop to reconcile a guild
    pub fn notify_reconcile(&self, guild_id: u64) {
        self.send(ServiceRequest::Reconcile { guild_id });
    }

    /// Ask the background loop for an immediate reminder sweep
    pub fn notify_sweep(&self) {
        self.send(ServiceRequest::SweepReminders);
    }

    fn send(&self, request: ServiceRequest) {
        match self.tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                warn!(?request, "Ticket service queue full, dropping request");
            }
            Err(TrySendError::Closed(request)) => {
                warn!(?request, "Ticket service stopped, dropping request");
            }
        }
    }

    /// Stop the loop and abort outstanding prompts and reminders
    pub async fn shutdown(&self) {
        self.send(ServiceRequest::Shutdown);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Ticket service loop failed");
            }
        }
        self.tasks.shutdown().await;
        info!("Ticket service stopped");
    }

    /// Wait for background work (catch-up, prompts, reminders) to finish
    pub async fn drain(&self) {
        self.tasks.drain().await;
    }

    /// Run a reconciliation pass now
    ///
    /// # Errors
    /// See [`AuditReconciler::reconcile`].
    pub async fn reconcile(&self, guild_id: u64) -> TicketResult<ReconcileReport> {
        self.reconciler.reconcile(guild_id).await
    }

    /// # Errors
    /// See [`GuildRegistry::register_guild`].
    pub async fn register_guild(
        &self,
        guild_id: u64,
        staff_role_id: u64,
        modlog_channel_id: u64,
    ) -> TicketResult<Arc<GuildState>> {
        self.registry
            .register_guild(guild_id, staff_role_id, modlog_channel_id)
            .await
    }

    /// # Errors
    /// See [`GuildRegistry::add_tracked_role`].
    pub async fn add_tracked_role(
        &self,
        guild_id: u64,
        role_id: u64,
        add_name: &str,
        remove_name: &str,
    ) -> TicketResult<TrackedRole> {
        self.registry
            .add_tracked_role(guild_id, role_id, add_name, remove_name)
            .await
    }

    /// # Errors
    /// See [`GuildRegistry::remove_tracked_role`].
    pub async fn remove_tracked_role(&self, guild_id: u64, role_id: u64) -> TicketResult<()> {
        self.registry.remove_tracked_role(guild_id, role_id).await
    }

    /// # Errors
    /// See [`TicketStore::create_ticket`].
    pub async fn create_ticket(&self, new: NewTicket) -> TicketResult<Ticket> {
        self.store.create_ticket(new).await
    }

    /// # Errors
    /// Returns `NotFound` for an unknown ticket.
    pub async fn get_ticket(&self, guild_id: u64, number: u64) -> TicketResult<Ticket> {
        self.store.get_ticket(guild_id, number).await
    }

    /// # Errors
    /// Returns `NotFound` for an unknown ticket.
    pub async fn get_history(&self, guild_id: u64, number: u64) -> TicketResult<Vec<Ticket>> {
        self.store.get_history(guild_id, number).await
    }

    /// # Errors
    /// Returns a storage error.
    pub async fn get_tickets_for_subject(
        &self,
        guild_id: u64,
        subject_id: u64,
    ) -> TicketResult<Vec<Ticket>> {
        self.store.get_tickets_for_subject(guild_id, subject_id).await
    }

    /// # Errors
    /// See [`TicketStore::update_ticket`].
    pub async fn update_ticket(
        &self,
        key: TicketKey,
        changes: TicketChanges,
        modified_by: u64,
    ) -> TicketResult<Ticket> {
        self.store.update_ticket(key, changes, modified_by).await
    }

    /// Apply the same changes to several tickets, after checking that all of them exist
    ///
    /// # Errors
    /// Returns `Invalid` or `NotFound` before anything is modified, or the
    /// first error hit while updating.
    pub async fn update_tickets(
        &self,
        guild_id: u64,
        numbers: &[u64],
        changes: TicketChanges,
        modified_by: u64,
    ) -> TicketResult<Vec<Ticket>> {
        changes.validate()?;
        self.check_ticket_numbers(guild_id, numbers).await?;
        let mut updated = Vec::with_capacity(numbers.len());
        for &number in numbers {
            updated.push(
                self.store
                    .update_ticket(TicketKey::new(guild_id, number), changes.clone(), modified_by)
                    .await?,
            );
        }
        Ok(updated)
    }

    /// Check that every number names an existing ticket of the guild
    ///
    /// # Errors
    /// Returns `Invalid` for an empty list, `GuildNotRegistered`, or
    /// `NotFound` naming the numbers past the guild's last ticket.
    pub async fn check_ticket_numbers(&self, guild_id: u64, numbers: &[u64]) -> TicketResult<()> {
        if numbers.is_empty() {
            return Err(TicketError::Invalid("no ticket numbers given".to_string()));
        }
        let guild = self
            .registry
            .get(guild_id)
            .ok_or(TicketError::GuildNotRegistered(guild_id))?;
        let count = guild.ticket_count().await;
        let missing: Vec<String> = numbers
            .iter()
            .filter(|&&n| n == 0 || n > count)
            .map(|n| format!("#{n}"))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(TicketError::NotFound(format!(
                "tickets {} do not exist",
                missing.join(", ")
            )))
        }
    }

    /// Record existing bans as resolved tickets with no known moderator
    ///
    /// Users who already have a ban ticket are skipped. Returns the created tickets.
    ///
    /// # Errors
    /// Returns `GuildNotRegistered`, or the first creation error.
    pub async fn import_bans(
        &self,
        guild_id: u64,
        bans: Vec<(u64, Option<String>)>,
    ) -> TicketResult<Vec<Ticket>> {
        if self.registry.get(guild_id).is_none() {
            return Err(TicketError::GuildNotRegistered(guild_id));
        }
        let mut created = Vec::new();
        for (user_id, reason) in bans {
            let existing = self.store.get_tickets_for_subject(guild_id, user_id).await?;
            if existing.iter().any(|t| t.action == ActionType::Ban) {
                continue;
            }
            let mut new = NewTicket::new(guild_id, ActionType::Ban, 0, user_id).with_reason(reason);
            new.resolved = true;
            created.push(self.store.create_ticket(new).await?);
        }
        info!(guild_id, imported = created.len(), "Bans imported");
        Ok(created)
    }

    #[must_use]
    pub fn current_queue_for(&self, moderator_id: u64) -> Vec<Ticket> {
        self.queues.current_queue_for(moderator_id)
    }

    /// # Errors
    /// See [`QueueManager::prompt_resolution`].
    pub async fn resolve_next(&self, moderator_id: u64) -> TicketResult<PromptOutcome> {
        self.queues.resolve_next(moderator_id).await
    }

    /// # Errors
    /// See [`QueueManager::prompt_resolution`].
    pub async fn prompt_resolution(
        &self,
        moderator_id: u64,
        key: TicketKey,
    ) -> TicketResult<PromptOutcome> {
        self.queues.prompt_resolution(moderator_id, Some(key)).await
    }
}
