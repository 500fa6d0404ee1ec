//! Moderator queues
//!
//! Every moderator with unresolved tickets has a queue ordered by ticket
//! creation time. The manager keeps the queues in line with the ticket store
//! through [`TicketObserver`] notifications and never writes ticket fields
//! itself; resolving a ticket goes through [`TicketStore::update_ticket`].
//!
//! Queue contents are only read and written inside synchronous sections that
//! hold a `DashMap` guard, and no guard is held across an await.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::platform::{MessageContent, MessageHandle, Platform};
use crate::tasks::TaskSupervisor;
use crate::tickets::{Ticket, TicketChanges, TicketError, TicketKey, TicketObserver, TicketResult, TicketStore};

pub const PROMPT_TEXT: &str =
    "Please enter a reason for the moderation action below, or `c` to cancel this prompt.";
pub const TIMED_OUT_TEXT: &str = "Timed out waiting for a reason.";
pub const CANCELLED_TEXT: &str = "Cancelled reason entry, ticket returned to your queue.";
pub const EMPTY_REASON_TEXT: &str = "A reason cannot be empty, ticket returned to your queue.";
pub const STALE_TEXT: &str =
    "This ticket was handled by someone else while you were answering, your reason was not saved.";

/// Reply that cancels a prompt
const CANCEL_REPLY: &str = "c";

/// Timing of prompts and reminders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// How long to wait for a reply to a prompt
    pub prompt_timeout: Duration,
    /// Minimum time since the last reminder before a sweep pokes again
    pub reminder_min_age: Duration,
    /// Minimum time between "new ticket" notices
    pub new_ticket_cooldown: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            prompt_timeout: Duration::from_secs(300),
            reminder_min_age: Duration::from_secs(60),
            new_ticket_cooldown: Duration::from_secs(300),
        }
    }
}

/// Ordering key of a queued ticket: creation time, then ticket key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueKey {
    pub created_at: DateTime<Utc>,
    pub guild_id: u64,
    pub number: u64,
}

impl QueueKey {
    #[must_use]
    pub fn of(ticket: &Ticket) -> Self {
        Self {
            created_at: ticket.created_at,
            guild_id: ticket.guild_id,
            number: ticket.number,
        }
    }

    #[must_use]
    pub fn ticket_key(&self) -> TicketKey {
        TicketKey::new(self.guild_id, self.number)
    }
}

/// Unresolved tickets of one moderator, oldest first
#[derive(Debug)]
pub struct ModeratorQueue {
    pub moderator_id: u64,
    tickets: BTreeMap<QueueKey, Ticket>,
    last_reminder: Option<Instant>,
    prompting: bool,
    /// An automatic prompt was skipped because another one was open
    prompt_pending: bool,
}

impl ModeratorQueue {
    #[must_use]
    pub fn new(moderator_id: u64) -> Self {
        Self {
            moderator_id,
            tickets: BTreeMap::new(),
            last_reminder: None,
            prompting: false,
            prompt_pending: false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    /// Insert or refresh a ticket, returning whether it was new
    pub fn insert(&mut self, ticket: Ticket) -> bool {
        self.tickets.insert(QueueKey::of(&ticket), ticket).is_none()
    }

    pub fn remove(&mut self, key: TicketKey) -> Option<Ticket> {
        let queue_key = self.find(key)?;
        self.tickets.remove(&queue_key)
    }

    fn find(&self, key: TicketKey) -> Option<QueueKey> {
        self.tickets.keys().find(|k| k.ticket_key() == key).copied()
    }

    #[must_use]
    pub fn contains(&self, key: TicketKey) -> bool {
        self.find(key).is_some()
    }

    /// Most recently created ticket
    #[must_use]
    pub fn newest(&self) -> Option<&Ticket> {
        self.tickets.values().next_back()
    }

    /// Tickets in creation order
    pub fn tickets(&self) -> impl Iterator<Item = &Ticket> {
        self.tickets.values()
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_reminder = Some(now);
    }

    /// Whether more than `min_age` has passed since the last reminder
    #[must_use]
    pub fn reminder_due(&self, now: Instant, min_age: Duration) -> bool {
        self.last_reminder
            .is_none_or(|last| now.saturating_duration_since(last) > min_age)
    }
}

/// Result of asking a moderator for a reason
#[derive(Debug, Clone, PartialEq)]
pub enum PromptOutcome {
    /// The moderator gave a reason and the ticket was resolved
    Resolved(Ticket),
    /// The moderator cancelled; the ticket stays queued
    Cancelled,
    /// No reply in time; the ticket stays queued
    TimedOut,
    /// Direct messages to the moderator failed; nothing was asked
    Unreachable,
    /// Another prompt for this moderator is in progress
    Busy,
    /// Nothing to prompt for
    Empty,
    /// The queued ticket had already been resolved or reassigned and was dropped
    Stale,
}

/// What enqueueing asked of the moderator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The ticket was not queued: resolved, or moderator unreachable or a bot
    Skipped,
    /// Queued and a prompt was started
    Prompted,
    /// Queued and a "new ticket" notice was sent
    Notified,
    /// Queued quietly
    Queued,
}

/// Owner of every moderator queue
pub struct QueueManager {
    me: Weak<Self>,
    queues: DashMap<u64, ModeratorQueue>,
    store: Arc<TicketStore>,
    platform: Arc<dyn Platform>,
    tasks: TaskSupervisor,
    settings: QueueSettings,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("queues", &self.queues.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Clears the prompting flag of a queue when a prompt ends, however it ends,
/// and starts a prompt that was deferred while this one was open
struct PromptGuard<'a> {
    manager: &'a QueueManager,
    moderator_id: u64,
}

impl Drop for PromptGuard<'_> {
    fn drop(&mut self) {
        let deferred = self
            .manager
            .queues
            .get_mut(&self.moderator_id)
            .is_some_and(|mut queue| {
                queue.prompting = false;
                std::mem::take(&mut queue.prompt_pending) && !queue.is_empty()
            });
        if deferred {
            self.manager.spawn_prompt(self.moderator_id, None);
        }
    }
}

impl QueueManager {
    /// Create the manager and register it as the store's observer
    #[must_use]
    pub fn new(
        store: Arc<TicketStore>,
        platform: Arc<dyn Platform>,
        tasks: TaskSupervisor,
        settings: QueueSettings,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            queues: DashMap::new(),
            store,
            platform,
            tasks,
            settings,
        });
        let observer: Arc<dyn TicketObserver> = manager.clone();
        manager.store.set_observer(Arc::downgrade(&observer));
        manager
    }

    #[must_use]
    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    /// Whether a user can receive prompts
    async fn is_reachable(&self, user_id: u64) -> bool {
        self.platform
            .lookup_user(user_id)
            .await
            .is_some_and(|user| !user.bot)
    }

    /// Route an unresolved ticket to its moderator's queue
    pub async fn enqueue(&self, ticket: Ticket) -> Enqueued {
        if ticket.resolved {
            return Enqueued::Skipped;
        }
        let moderator_id = ticket.moderator_id;
        if !self.queues.contains_key(&moderator_id) && !self.is_reachable(moderator_id).await {
            debug!(
                moderator_id,
                guild_id = ticket.guild_id,
                ticket = ticket.number,
                "Moderator unreachable or a bot, ticket left unqueued"
            );
            return Enqueued::Skipped;
        }

        let now = Instant::now();
        let (outcome, len) = {
            let mut queue = self
                .queues
                .entry(moderator_id)
                .or_insert_with(|| ModeratorQueue::new(moderator_id));
            queue.insert(ticket.clone());
            let outcome = if queue.len() == 1 {
                queue.touch(now);
                Enqueued::Prompted
            } else if queue.reminder_due(now, self.settings.new_ticket_cooldown) {
                queue.touch(now);
                Enqueued::Notified
            } else {
                Enqueued::Queued
            };
            (outcome, queue.len())
        };
        debug!(
            moderator_id,
            guild_id = ticket.guild_id,
            ticket = ticket.number,
            queued = len,
            outcome = ?outcome,
            "Ticket queued"
        );

        match outcome {
            Enqueued::Prompted => self.spawn_prompt(moderator_id, None),
            Enqueued::Notified => self.spawn_notice(
                moderator_id,
                format!("<@{moderator_id}>, you have a new ticket in your queue!"),
            ),
            Enqueued::Queued | Enqueued::Skipped => {}
        }
        outcome
    }

    /// Remove a ticket from its moderator's queue, returning whether it was queued
    pub fn dequeue(&self, ticket: &Ticket) -> bool {
        let removed = self
            .queues
            .get_mut(&ticket.moderator_id)
            .and_then(|mut queue| queue.remove(ticket.key()))
            .is_some();
        if removed {
            debug!(
                moderator_id = ticket.moderator_id,
                guild_id = ticket.guild_id,
                ticket = ticket.number,
                "Ticket dequeued"
            );
        }
        removed
    }

    /// Replace the queued snapshot of a ticket, if it is queued
    fn refresh(&self, ticket: &Ticket) {
        if let Some(mut queue) = self.queues.get_mut(&ticket.moderator_id) {
            if queue.contains(ticket.key()) {
                queue.insert(ticket.clone());
            }
        }
    }

    /// Unresolved tickets queued for a moderator, oldest first
    #[must_use]
    pub fn current_queue_for(&self, moderator_id: u64) -> Vec<Ticket> {
        self.queues
            .get(&moderator_id)
            .map(|queue| queue.tickets().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of moderators with at least one queued ticket
    #[must_use]
    pub fn moderators(&self) -> Vec<u64> {
        self.queues
            .iter()
            .filter(|q| !q.is_empty())
            .map(|q| q.moderator_id)
            .collect()
    }

    /// Prompt a moderator for the reason of their most recent ticket
    ///
    /// # Errors
    /// See [`QueueManager::prompt_resolution`].
    pub async fn resolve_next(&self, moderator_id: u64) -> TicketResult<PromptOutcome> {
        self.prompt_resolution(moderator_id, None).await
    }

    /// Ask a moderator over direct message for the reason of a queued ticket
    ///
    /// Without a key the most recently created ticket in the queue is used.
    ///
    /// # Errors
    /// Returns `NotFound` if the given ticket is not in the moderator's
    /// queue, or a storage or platform error other than a delivery failure.
    pub async fn prompt_resolution(
        &self,
        moderator_id: u64,
        key: Option<TicketKey>,
    ) -> TicketResult<PromptOutcome> {
        self.prompt(moderator_id, key, false).await
    }

    /// With `defer_if_busy`, a prompt that finds another one open is
    /// started again once that one ends
    async fn prompt(
        &self,
        moderator_id: u64,
        key: Option<TicketKey>,
        defer_if_busy: bool,
    ) -> TicketResult<PromptOutcome> {
        let queued = {
            let Some(mut queue) = self.queues.get_mut(&moderator_id) else {
                return Ok(PromptOutcome::Empty);
            };
            if queue.is_empty() {
                return Ok(PromptOutcome::Empty);
            }
            if queue.prompting {
                if defer_if_busy {
                    queue.prompt_pending = true;
                }
                return Ok(PromptOutcome::Busy);
            }
            let ticket = match key {
                Some(key) => {
                    let Some(queue_key) = queue.find(key) else {
                        return Err(TicketError::NotFound(format!(
                            "ticket {key} is not in your queue"
                        )));
                    };
                    queue.tickets.get(&queue_key).cloned()
                }
                None => queue.newest().cloned(),
            };
            let Some(ticket) = ticket else {
                return Ok(PromptOutcome::Empty);
            };
            queue.touch(Instant::now());
            queue.prompting = true;
            ticket
        };
        let _guard = PromptGuard {
            manager: self,
            moderator_id,
        };

        let ticket = self.store.get_ticket(queued.guild_id, queued.number).await?;
        if self.is_stale(&ticket, moderator_id) {
            return Ok(PromptOutcome::Stale);
        }

        let card = self.store.render(&ticket)?;
        let handle = match self
            .platform
            .send_direct_message(moderator_id, &card.clone().with_text(PROMPT_TEXT))
            .await
        {
            Ok(handle) => handle,
            Err(e) if e.is_delivery_failure() => {
                info!(moderator_id, error = %e, "Cannot prompt moderator");
                return Ok(PromptOutcome::Unreachable);
            }
            Err(e) => return Err(e),
        };

        let timeout = self.settings.prompt_timeout;
        let reply = tokio::time::timeout(
            timeout,
            self.platform.wait_for_direct_reply(moderator_id, timeout),
        )
        .await
        .unwrap_or(Err(TicketError::TimedOut));

        let reply = match reply {
            Ok(reply) => reply,
            Err(TicketError::TimedOut) => {
                self.edit_prompt(handle, card.with_text(TIMED_OUT_TEXT)).await;
                return Ok(PromptOutcome::TimedOut);
            }
            Err(e) if e.is_delivery_failure() => return Ok(PromptOutcome::Unreachable),
            Err(e) => return Err(e),
        };

        let reason = reply.trim();
        if reason.eq_ignore_ascii_case(CANCEL_REPLY) {
            self.edit_prompt(handle, card.with_text(CANCELLED_TEXT)).await;
            return Ok(PromptOutcome::Cancelled);
        }
        if reason.is_empty() {
            self.edit_prompt(handle, card.with_text(EMPTY_REASON_TEXT)).await;
            return Ok(PromptOutcome::Cancelled);
        }

        // The ticket may have been resolved or handed over during the wait
        let current = self.store.get_ticket(ticket.guild_id, ticket.number).await?;
        if self.is_stale(&current, moderator_id) {
            self.edit_prompt(handle, self.store.render(&current)?.with_text(STALE_TEXT))
                .await;
            return Ok(PromptOutcome::Stale);
        }

        let resolved = self
            .store
            .update_ticket(ticket.key(), TicketChanges::resolve(reason), moderator_id)
            .await?;
        self.edit_prompt(handle, self.store.render(&resolved)?).await;
        info!(
            moderator_id,
            guild_id = resolved.guild_id,
            ticket = resolved.number,
            "Ticket resolved from prompt"
        );
        Ok(PromptOutcome::Resolved(resolved))
    }

    /// Whether a ticket no longer belongs in the moderator's queue; drops it if so
    fn is_stale(&self, ticket: &Ticket, moderator_id: u64) -> bool {
        if !ticket.resolved && ticket.moderator_id == moderator_id {
            return false;
        }
        if let Some(mut queue) = self.queues.get_mut(&moderator_id) {
            queue.remove(ticket.key());
        }
        debug!(
            moderator_id,
            guild_id = ticket.guild_id,
            ticket = ticket.number,
            "Dropped stale queue entry"
        );
        true
    }

    async fn edit_prompt(&self, handle: MessageHandle, content: MessageContent) {
        if let Err(e) = self.platform.edit_message(handle, &content).await {
            debug!(channel_id = handle.channel_id, error = %e, "Failed to edit prompt");
        }
    }

    /// Poke every moderator with queued tickets who has not been reminded recently
    ///
    /// Returns the number of reminders started. Sends run as background tasks.
    pub fn sweep_reminders(&self) -> usize {
        let now = Instant::now();
        let mut due = Vec::new();
        for mut queue in self.queues.iter_mut() {
            if !queue.is_empty() && queue.reminder_due(now, self.settings.reminder_min_age) {
                queue.touch(now);
                due.push((queue.moderator_id, queue.len()));
            }
        }
        for &(moderator_id, count) in &due {
            self.spawn_notice(
                moderator_id,
                format!("<@{moderator_id}>, you have {count} tickets in your queue awaiting reasons!"),
            );
        }
        if !due.is_empty() {
            info!(reminders = due.len(), "Reminder sweep");
        }
        due.len()
    }

    /// Load unresolved tickets into their queues without prompting
    pub async fn restore_queues(&self, tickets: Vec<Ticket>) -> usize {
        let mut reachable: HashMap<u64, bool> = HashMap::new();
        let mut restored = 0;
        for ticket in tickets.into_iter().filter(|t| !t.resolved) {
            let moderator_id = ticket.moderator_id;
            let ok = match reachable.get(&moderator_id) {
                Some(ok) => *ok,
                None => {
                    let ok = self.is_reachable(moderator_id).await;
                    reachable.insert(moderator_id, ok);
                    ok
                }
            };
            if !ok {
                continue;
            }
            self.queues
                .entry(moderator_id)
                .or_insert_with(|| ModeratorQueue::new(moderator_id))
                .insert(ticket);
            restored += 1;
        }
        info!(restored, moderators = self.queues.len(), "Moderator queues restored");
        restored
    }

    fn spawn_prompt(&self, moderator_id: u64, key: Option<TicketKey>) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        self.tasks.spawn(async move {
            if let Err(e) = me.prompt(moderator_id, key, true).await {
                warn!(moderator_id, error = %e, "Prompt failed");
            }
        });
    }

    fn spawn_notice(&self, moderator_id: u64, text: String) {
        let platform = Arc::clone(&self.platform);
        self.tasks.spawn(async move {
            if let Err(e) = platform
                .send_direct_message(moderator_id, &MessageContent::text(text))
                .await
            {
                debug!(moderator_id, error = %e, "Failed to send reminder");
            }
        });
    }

    fn spawn_enqueue(&self, ticket: Ticket) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        self.tasks.spawn(async move {
            me.enqueue(ticket).await;
        });
    }
}

#[async_trait]
impl TicketObserver for QueueManager {
    async fn ticket_created(&self, ticket: &Ticket) {
        self.enqueue(ticket.clone()).await;
    }

    async fn ticket_changed(&self, before: &Ticket, after: &Ticket) {
        let reassigned = before.moderator_id != after.moderator_id;
        if after.resolved || reassigned {
            self.dequeue(before);
        }
        if after.resolved {
            return;
        }
        if reassigned || before.resolved {
            self.spawn_enqueue(after.clone());
        } else {
            self.refresh(after);
        }
    }
}
