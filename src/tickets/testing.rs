//! Scripted platform and fixtures shared by the ticket tests

use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::platform::{
    AuditAction, AuditEntry, MessageContent, MessageHandle, MockPlatform, PlatformUser,
    snowflake_at, snowflake_time,
};
use crate::tickets::{GuildRegistry, MemoryStorage, Storage, TicketError};

pub(crate) const GUILD: u64 = 10;
pub(crate) const STAFF: u64 = 1;
pub(crate) const MODLOG: u64 = 20;

/// Everything the mock platform was asked to do, plus scripted answers
#[derive(Default)]
pub(crate) struct Outbox {
    pub dms: Mutex<Vec<(u64, MessageContent)>>,
    pub posts: Mutex<Vec<(u64, MessageContent)>>,
    pub edits: Mutex<Vec<(MessageHandle, MessageContent)>>,
    /// Cursors passed to audit log fetches
    pub fetches: Mutex<Vec<u64>>,
    audit: Mutex<Vec<AuditEntry>>,
    /// Per-user reply script; `None` times out. An empty script times out.
    replies: Mutex<HashMap<u64, VecDeque<Option<String>>>>,
    unreachable: Mutex<HashSet<u64>>,
    hidden: Mutex<HashSet<u64>>,
    bots: Mutex<HashSet<u64>>,
    gone: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
    next_entry: AtomicU64,
}

impl Outbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1000),
            ..Default::default()
        })
    }

    pub fn reply(&self, user_id: u64, text: &str) {
        self.script(user_id, Some(text.to_string()));
    }

    pub fn time_out(&self, user_id: u64) {
        self.script(user_id, None);
    }

    fn script(&self, user_id: u64, reply: Option<String>) {
        self.replies
            .lock()
            .unwrap()
            .entry(user_id)
            .or_default()
            .push_back(reply);
    }

    pub fn block_dms(&self, user_id: u64) {
        self.unreachable.lock().unwrap().insert(user_id);
    }

    pub fn hide_user(&self, user_id: u64) {
        self.hidden.lock().unwrap().insert(user_id);
    }

    pub fn mark_bot(&self, user_id: u64) {
        self.bots.lock().unwrap().insert(user_id);
    }

    pub fn delete_channel(&self, channel_id: u64) {
        self.gone.lock().unwrap().insert(channel_id);
    }

    /// Append an audit log entry created `secs` seconds from now
    pub fn audit(&self, secs: i64, actor_id: u64, target_id: u64, action: AuditAction) -> AuditEntry {
        let seq = self.next_entry.fetch_add(1, Ordering::SeqCst) + 1;
        let id = snowflake_at(Utc::now() + Duration::seconds(secs)) + seq;
        let entry = AuditEntry {
            id,
            created_at: snowflake_time(id),
            actor_id,
            target_id,
            action,
            reason: None,
        };
        self.audit.lock().unwrap().push(entry.clone());
        entry
    }

    pub fn push_entry(&self, entry: AuditEntry) {
        self.audit.lock().unwrap().push(entry);
    }

    /// Direct message texts sent to a user
    pub fn dm_texts(&self, user_id: u64) -> Vec<String> {
        self.dms
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| *to == user_id)
            .filter_map(|(_, content)| content.text.clone())
            .collect()
    }

    fn handle(&self, channel_id: u64) -> MessageHandle {
        MessageHandle {
            channel_id,
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// A mock platform backed by this outbox
    pub fn platform(self: &Arc<Self>) -> MockPlatform {
        let mut platform = MockPlatform::new();

        let outbox = Arc::clone(self);
        platform
            .expect_fetch_audit_entries()
            .returning(move |_, after| {
                outbox.fetches.lock().unwrap().push(after);
                Ok(outbox
                    .audit
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|e| e.id > after)
                    .cloned()
                    .collect())
            });

        let outbox = Arc::clone(self);
        platform.expect_lookup_user().returning(move |user_id| {
            if outbox.hidden.lock().unwrap().contains(&user_id) {
                return None;
            }
            Some(PlatformUser {
                id: user_id,
                name: format!("user{user_id}"),
                bot: outbox.bots.lock().unwrap().contains(&user_id),
            })
        });

        let outbox = Arc::clone(self);
        platform
            .expect_send_direct_message()
            .returning(move |user_id, content| {
                if outbox.unreachable.lock().unwrap().contains(&user_id) {
                    return Err(TicketError::Unreachable(user_id));
                }
                outbox.dms.lock().unwrap().push((user_id, content.clone()));
                Ok(outbox.handle(user_id))
            });

        let outbox = Arc::clone(self);
        platform.expect_edit_message().returning(move |handle, content| {
            if outbox.gone.lock().unwrap().contains(&handle.channel_id) {
                return Err(TicketError::ChannelGone(handle.channel_id));
            }
            outbox.edits.lock().unwrap().push((handle, content.clone()));
            Ok(())
        });

        let outbox = Arc::clone(self);
        platform
            .expect_post_to_channel()
            .returning(move |channel_id, content| {
                if outbox.gone.lock().unwrap().contains(&channel_id) {
                    return Err(TicketError::ChannelGone(channel_id));
                }
                outbox.posts.lock().unwrap().push((channel_id, content.clone()));
                Ok(outbox.handle(channel_id))
            });

        let outbox = Arc::clone(self);
        platform
            .expect_wait_for_direct_reply()
            .returning(move |user_id, _| {
                outbox
                    .replies
                    .lock()
                    .unwrap()
                    .get_mut(&user_id)
                    .and_then(VecDeque::pop_front)
                    .flatten()
                    .ok_or(TicketError::TimedOut)
            });

        platform
    }
}

/// Storage and a ready registry with [`GUILD`] registered
pub(crate) async fn registered() -> (Arc<dyn Storage>, Arc<GuildRegistry>) {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let registry = Arc::new(GuildRegistry::new(Arc::clone(&storage)));
    registry.register_guild(GUILD, STAFF, MODLOG).await.unwrap();
    registry.mark_ready();
    (storage, registry)
}
