//! Chat operations shared by the HTTP API and the WebSocket transport.
//!
//! Every write goes capability check -> persist -> live fan-out -> push
//! fallback. Writes to one conversation are serialized by an async mutex held
//! across persist and emit, so live recipients observe events in persistence
//! order. The locked section runs on its own task: a caller that goes away
//! mid-write cannot leave a persisted event without its fan-out.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use parley_shared::{ConnectionId, ConversationRef, GroupId, MessageId, RoomId, UserId};
use parley_store::{AccessPolicy, Group, Message, NewMessage, PushSubscription, ReactionSet};

use crate::error::ServerError;
use crate::fanout::{Delivery, FanoutEngine};
use crate::registry::{ConnectionHandle, ConnectionRegistry, EventSender};
use crate::rooms::RoomManager;
use crate::storage::{with_db, SharedDatabase};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

/// A persisted message and what fan-out did with it.
#[derive(Debug)]
pub struct Sent {
    pub message: Message,
    pub delivery: Delivery,
}

#[derive(Debug)]
pub struct Reacted {
    pub reactions: ReactionSet,
    pub delivery: Delivery,
}

#[derive(Clone)]
pub struct ChatService {
    db: SharedDatabase,
    registry: ConnectionRegistry,
    rooms: RoomManager,
    fanout: FanoutEngine,
    locks: ConversationLocks,
}

type LockTable = Arc<DashMap<ConversationRef, Arc<Mutex<()>>>>;

impl ChatService {
    pub fn new(
        db: SharedDatabase,
        registry: ConnectionRegistry,
        rooms: RoomManager,
        fanout: FanoutEngine,
    ) -> Self {
        Self {
            db,
            registry,
            rooms,
            fanout,
            locks: ConversationLocks::default(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Register a new live connection for `user`.
    pub fn connect(&self, user: UserId, tx: EventSender) -> ConnectionHandle {
        let handle = ConnectionHandle::new(user, tx);
        self.registry.register(handle.clone());
        handle
    }

    /// Tear down a connection: leave every room, then drop it from the
    /// registry. Synchronous so nothing is delivered to it afterwards.
    pub fn disconnect(&self, connection: &ConnectionId) {
        let left = self.rooms.leave_all(connection);
        if let Some(handle) = self.registry.unregister(connection) {
            info!(
                user = %handle.user_id(),
                connection = %connection,
                rooms = left,
                duration_secs = (chrono::Utc::now() - handle.connected_at()).num_seconds(),
                "User disconnected"
            );
        }
    }

    /// Join a group room. Only current members may join.
    pub async fn join_room(
        &self,
        user: UserId,
        connection: ConnectionId,
        room: RoomId,
    ) -> Result<(), ServerError> {
        let conversation = ConversationRef::group(room.group_id());
        let is_member = self
            .serialized(conversation, move |chat| async move {
                let is_member =
                    with_db(&chat.db, move |db| db.may_address(&user, &conversation)).await?;
                if is_member {
                    chat.rooms.join(connection, room);
                }
                Ok(is_member)
            })
            .await?;

        if !is_member {
            return Err(ServerError::Unauthorized(
                "only group members may join the room".into(),
            ));
        }
        Ok(())
    }

    pub fn leave_room(&self, connection: &ConnectionId, room: &RoomId) {
        self.rooms.leave(connection, room);
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub async fn send_message(
        &self,
        sender: UserId,
        conversation: ConversationRef,
        content: NewMessage,
    ) -> Result<Sent, ServerError> {
        self.serialized(conversation, move |chat| async move {
            let (message, members) = with_db(&chat.db, move |db| {
                let message = db.append_message(&conversation, &sender, &content)?;
                let members = member_ids(db, &conversation)?;
                Ok((message, members))
            })
            .await?;

            debug!(
                message = %message.id,
                conversation = %conversation,
                sender = %sender,
                "Message persisted"
            );

            let delivery = chat.fanout.message(&message, &members);
            Ok(Sent { message, delivery })
        })
        .await
    }

    /// Messages of a conversation the caller takes part in, oldest first.
    pub async fn history(
        &self,
        caller: UserId,
        conversation: ConversationRef,
        after: Option<MessageId>,
        limit: Option<u32>,
    ) -> Result<Vec<Message>, ServerError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        with_db(&self.db, move |db| {
            if let ConversationRef::Group { group_id } = &conversation {
                db.get_group(group_id)?;
            }
            if !db.is_participant(&caller, &conversation)? {
                return Err(parley_store::StoreError::Unauthorized(
                    "not a participant of this conversation".into(),
                ));
            }
            db.list_messages(&conversation, after.as_ref(), limit)
        })
        .await
    }

    pub async fn react(
        &self,
        user: UserId,
        message_id: MessageId,
        emoji: String,
    ) -> Result<Reacted, ServerError> {
        let conversation =
            with_db(&self.db, move |db| db.message_conversation(&message_id)).await?;

        self.serialized(conversation, move |chat| async move {
            let (reactions, members) = with_db(&chat.db, move |db| {
                let reactions = db.add_reaction(&message_id, &user, &emoji)?;
                let members = member_ids(db, &reactions.conversation)?;
                Ok((reactions, members))
            })
            .await?;

            let delivery = chat.fanout.reaction(&reactions, user, &members);
            Ok(Reacted {
                reactions,
                delivery,
            })
        })
        .await
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    pub async fn create_group(
        &self,
        creator: UserId,
        name: String,
        members: Vec<UserId>,
    ) -> Result<Group, ServerError> {
        let group =
            with_db(&self.db, move |db| db.create_group(&name, &creator, &members)).await?;
        info!(group = %group.id, creator = %creator, "Group created");
        Ok(group)
    }

    /// Add `user` to a group. Only admins may add members.
    pub async fn add_member(
        &self,
        actor: UserId,
        group: GroupId,
        user: UserId,
    ) -> Result<bool, ServerError> {
        let added = with_db(&self.db, move |db| {
            db.get_group(&group)?;
            if !db.is_group_admin(&group, &actor)? {
                return Err(parley_store::StoreError::Unauthorized(
                    "only group admins may add members".into(),
                ));
            }
            db.add_group_member(&group, &user, false)
        })
        .await?;

        if added {
            info!(group = %group, user = %user, by = %actor, "Member added");
        }
        Ok(added)
    }

    /// Remove `user` from a group and evict their connections from its room.
    /// Admins may remove anyone but the creator; members may remove
    /// themselves.
    pub async fn remove_member(
        &self,
        actor: UserId,
        group: GroupId,
        user: UserId,
    ) -> Result<bool, ServerError> {
        let conversation = ConversationRef::group(group);
        let (removed, evicted) = self
            .serialized(conversation, move |chat| async move {
                let removed = with_db(&chat.db, move |db| {
                    db.get_group(&group)?;
                    if actor != user && !db.is_group_admin(&group, &actor)? {
                        return Err(parley_store::StoreError::Unauthorized(
                            "only group admins may remove members".into(),
                        ));
                    }
                    db.remove_group_member(&group, &user)
                })
                .await?;

                let evicted = chat.rooms.evict_user(&RoomId::for_group(group), &user);
                Ok((removed, evicted))
            })
            .await?;

        if removed {
            info!(group = %group, user = %user, by = %actor, evicted, "Member removed");
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Push
    // ------------------------------------------------------------------

    pub async fn add_push_subscription(
        &self,
        user: UserId,
        endpoint: String,
    ) -> Result<PushSubscription, ServerError> {
        with_db(&self.db, move |db| db.add_push_subscription(&user, &endpoint)).await
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Run `f` on its own task while holding the lock of `conversation`.
    /// Dropping the returned future does not cancel the task.
    async fn serialized<T, F, Fut>(
        &self,
        conversation: ConversationRef,
        f: F,
    ) -> Result<T, ServerError>
    where
        F: FnOnce(ChatService) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ServerError>> + Send + 'static,
        T: Send + 'static,
    {
        let chat = self.clone();
        tokio::spawn(async move {
            let _guard = chat.locks.acquire(conversation).await;
            f(chat).await
        })
        .await?
    }
}

/// Per-conversation async mutexes, created on demand and dropped from the
/// table once nobody holds or waits on them.
#[derive(Clone, Default)]
struct ConversationLocks {
    table: LockTable,
}

impl ConversationLocks {
    async fn acquire(&self, conversation: ConversationRef) -> ConversationGuard {
        let lock = self
            .table
            .entry(conversation)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        // Registered before waiting so an abandoned wait still cleans up.
        let entry = LockEntry {
            table: Arc::clone(&self.table),
            conversation,
            lock: Some(Arc::clone(&lock)),
        };
        ConversationGuard {
            _held: lock.lock_owned().await,
            _entry: entry,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Field order matters: the mutex guard is released before the entry is
/// considered for removal.
struct ConversationGuard {
    _held: OwnedMutexGuard<()>,
    _entry: LockEntry,
}

struct LockEntry {
    table: LockTable,
    conversation: ConversationRef,
    lock: Option<Arc<Mutex<()>>>,
}

impl Drop for LockEntry {
    fn drop(&mut self) {
        drop(self.lock.take());
        self.table
            .remove_if(&self.conversation, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn member_ids(
    db: &parley_store::Database,
    conversation: &ConversationRef,
) -> parley_store::Result<Vec<UserId>> {
    match conversation {
        ConversationRef::Group { group_id } => Ok(db
            .group_members(group_id)?
            .into_iter()
            .map(|member| member.user_id)
            .collect()),
        ConversationRef::Direct { .. } => Ok(Vec::new()),
    }
}
