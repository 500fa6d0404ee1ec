//! Moderation tickets
//!
//! Moderation actions are recorded as tickets. Tickets are created from the
//! guild audit log or by moderator commands, mirrored to the guild's
//! notification channel, and routed to the responsible moderator until they
//! give a reason.

mod action;
mod error;
mod guild;
mod queue;
mod reconcile;
mod record;
pub mod render;
mod service;
mod storage;
mod store;
#[cfg(test)]
mod testing;

pub use action::ActionType;
pub use error::{TicketError, TicketResult};
pub use guild::{AuditWatermark, GuildRecord, GuildRegistry, GuildSettings, GuildState, TrackedRole};
pub use queue::{
    CANCELLED_TEXT, EMPTY_REASON_TEXT, Enqueued, ModeratorQueue, PROMPT_TEXT, PromptOutcome,
    QueueKey, QueueManager, QueueSettings, STALE_TEXT, TIMED_OUT_TEXT,
};
pub use reconcile::{AuditReconciler, ReconcileReport, tickets_for};
pub use record::{NewTicket, Ticket, TicketChanges, TicketKey};
pub use service::{ServiceRequest, ServiceSettings, StartupReport, TicketService};
pub use storage::{MemoryStorage, Storage, YamlStorage};
pub use store::{TicketObserver, TicketStore};
