//! Live delivery of persisted messages and reactions.
//!
//! Direct conversations resolve both participants through the registry; group
//! conversations broadcast to the group's room. Whoever did not get a live
//! copy is handed to the notification fallback.

use std::collections::HashSet;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use parley_shared::protocol::{MessagePayload, ReactionEvent, ServerEvent};
use parley_shared::{ConversationRef, RoomId, UserId};
use parley_store::{Message, ReactionSet};

use crate::push::{NotificationFallback, PushNotification, PushReport};
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomManager;

/// What happened to one fanned-out event.
#[derive(Debug, Default)]
pub struct Delivery {
    /// Users that received the event on a live connection.
    pub live: HashSet<UserId>,
    /// Users handed to the push fallback.
    pub pushed: Vec<UserId>,
    /// Resolves when the background push attempts finish.
    pub push_task: Option<JoinHandle<PushReport>>,
}

#[derive(Clone)]
pub struct FanoutEngine {
    registry: ConnectionRegistry,
    rooms: RoomManager,
    push: NotificationFallback,
}

impl FanoutEngine {
    pub fn new(registry: ConnectionRegistry, rooms: RoomManager, push: NotificationFallback) -> Self {
        Self {
            registry,
            rooms,
            push,
        }
    }

    /// Fan out a freshly persisted message. `group_members` is only consulted
    /// for group conversations.
    pub fn message(&self, message: &Message, group_members: &[UserId]) -> Delivery {
        let payload: MessagePayload = message.into();
        let event = if message.conversation.is_group() {
            ServerEvent::NewGroupMessage(payload)
        } else {
            ServerEvent::NewMessage(payload)
        };

        self.publish(
            &message.conversation,
            message.sender_id,
            event,
            group_members,
            PushNotification::for_message(message),
        )
    }

    /// Fan out the reaction `user` just placed on a message.
    pub fn reaction(&self, reactions: &ReactionSet, user: UserId, group_members: &[UserId]) -> Delivery {
        let Some(reaction) = reactions.for_user(&user) else {
            warn!(message = %reactions.message_id, user = %user, "Reaction missing from set");
            return Delivery::default();
        };

        let update = ReactionEvent {
            message_id: reactions.message_id,
            emoji: reaction.emoji.clone(),
            user_id: user,
        };
        let event = if reactions.conversation.is_group() {
            ServerEvent::GroupMessageReaction(update)
        } else {
            ServerEvent::MessageReaction(update)
        };

        self.publish(
            &reactions.conversation,
            user,
            event,
            group_members,
            PushNotification::for_reaction(
                reactions.conversation,
                reactions.message_id,
                user,
                &reaction.emoji,
            ),
        )
    }

    fn publish(
        &self,
        conversation: &ConversationRef,
        sender: UserId,
        event: ServerEvent,
        group_members: &[UserId],
        notification: PushNotification,
    ) -> Delivery {
        let mut delivery = Delivery::default();

        match conversation {
            ConversationRef::Direct { participants } => {
                let Some(recipient) = participants.other(&sender) else {
                    warn!(conversation = %conversation, sender = %sender, "Sender is not a participant");
                    return delivery;
                };

                if self.emit_to_user(&recipient, &event) {
                    delivery.live.insert(recipient);
                } else {
                    delivery.pushed.push(recipient);
                }

                // Echo to the sender's own routed connection.
                if recipient != sender && self.emit_to_user(&sender, &event) {
                    delivery.live.insert(sender);
                }
            }
            ConversationRef::Group { group_id } => {
                let room = RoomId::for_group(*group_id);
                delivery.live = self.rooms.broadcast(&room, &event, None);

                delivery.pushed = group_members
                    .iter()
                    .filter(|member| **member != sender && !delivery.live.contains(*member))
                    .copied()
                    .collect();
            }
        }

        debug!(
            event = event.name(),
            conversation = %conversation,
            live = delivery.live.len(),
            pushed = delivery.pushed.len(),
            "Fanned out event"
        );

        if !delivery.pushed.is_empty() {
            delivery.push_task = Some(self.push.dispatch(delivery.pushed.clone(), notification));
        }

        delivery
    }

    fn emit_to_user(&self, user: &UserId, event: &ServerEvent) -> bool {
        let Some(handle) = self.registry.lookup(user) else {
            return false;
        };

        match handle.emit(event.clone()) {
            Ok(()) => true,
            Err(warning) => {
                warn!(warning = %warning, event = event.name(), "Live delivery failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use tokio::sync::mpsc;

    use parley_shared::{GroupId, MessageId};
    use parley_store::{Database, Reaction};

    use super::*;
    use crate::push::testing::RecordingGateway;
    use crate::registry::ConnectionHandle;
    use crate::storage::shared;

    struct Harness {
        registry: ConnectionRegistry,
        rooms: RoomManager,
        fanout: FanoutEngine,
        gateway: Arc<RecordingGateway>,
    }

    fn harness() -> Harness {
        let registry = ConnectionRegistry::new();
        let rooms = RoomManager::new(registry.clone());
        let gateway = Arc::new(RecordingGateway::default());
        let db = shared(Database::open_in_memory().unwrap());
        let push = NotificationFallback::new(db, gateway.clone());
        let fanout = FanoutEngine::new(registry.clone(), rooms.clone(), push);
        Harness {
            registry,
            rooms,
            fanout,
            gateway,
        }
    }

    fn connect(
        registry: &ConnectionRegistry,
        user: UserId,
    ) -> (parley_shared::ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(user, tx);
        let id = handle.id();
        registry.register(handle);
        (id, rx)
    }

    fn events(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if !matches!(event, ServerEvent::GetOnlineUsers(_)) {
                names.push(event.name());
            }
        }
        names
    }

    fn message(conversation: ConversationRef, sender: UserId) -> Message {
        Message {
            id: MessageId::new(),
            conversation,
            sender_id: sender,
            text: Some("hello".into()),
            image: None,
            reply_to: None,
            reply_preview: None,
            reactions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_direct_message_reaches_recipient_and_echoes() {
        let h = harness();
        let (alice, bob) = (UserId::new(), UserId::new());
        let (_, mut alice_rx) = connect(&h.registry, alice);
        let (_, mut bob_rx) = connect(&h.registry, bob);

        let delivery = h
            .fanout
            .message(&message(ConversationRef::direct(alice, bob), alice), &[]);

        assert_eq!(delivery.live, HashSet::from([alice, bob]));
        assert!(delivery.pushed.is_empty());
        assert!(delivery.push_task.is_none());
        assert_eq!(events(&mut bob_rx), vec!["newMessage"]);
        assert_eq!(events(&mut alice_rx), vec!["newMessage"]);
    }

    #[tokio::test]
    async fn test_offline_direct_recipient_falls_back_to_push() {
        let h = harness();
        let (alice, bob) = (UserId::new(), UserId::new());
        let (_, _alice_rx) = connect(&h.registry, alice);

        let delivery = h
            .fanout
            .message(&message(ConversationRef::direct(alice, bob), alice), &[]);

        assert_eq!(delivery.pushed, vec![bob]);
        let report = delivery.push_task.unwrap().await.unwrap();
        // Bob has no subscriptions, so nothing is attempted.
        assert_eq!(report, PushReport::default());
        assert!(h.gateway.endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_group_message_pushes_to_unjoined_members() {
        let h = harness();
        let group = GroupId::new();
        let room = RoomId::for_group(group);
        let (alice, bob, carol, dave) = (UserId::new(), UserId::new(), UserId::new(), UserId::new());

        let (alice_conn, mut alice_rx) = connect(&h.registry, alice);
        let (bob_conn, mut bob_rx) = connect(&h.registry, bob);
        // Carol is online but never joined the room; Dave is offline.
        let (_, mut carol_rx) = connect(&h.registry, carol);
        h.rooms.join(alice_conn, room);
        h.rooms.join(bob_conn, room);

        let delivery = h.fanout.message(
            &message(ConversationRef::group(group), alice),
            &[alice, bob, carol, dave],
        );

        assert_eq!(delivery.live, HashSet::from([alice, bob]));
        let mut pushed = delivery.pushed.clone();
        pushed.sort();
        let mut expected = vec![carol, dave];
        expected.sort();
        assert_eq!(pushed, expected);

        assert_eq!(events(&mut alice_rx), vec!["newGroupMessage"]);
        assert_eq!(events(&mut bob_rx), vec!["newGroupMessage"]);
        assert!(events(&mut carol_rx).is_empty());
    }

    #[tokio::test]
    async fn test_reaction_event_matches_conversation_kind() {
        let h = harness();
        let group = GroupId::new();
        let (alice, bob) = (UserId::new(), UserId::new());
        let (alice_conn, mut alice_rx) = connect(&h.registry, alice);
        h.rooms.join(alice_conn, RoomId::for_group(group));
        let (_, mut bob_rx) = connect(&h.registry, bob);

        let message_id = MessageId::new();
        let reaction = |conversation| ReactionSet {
            message_id,
            conversation,
            reactions: vec![Reaction {
                message_id,
                user_id: bob,
                emoji: "👍".into(),
                created_at: Utc::now(),
            }],
        };

        h.fanout
            .reaction(&reaction(ConversationRef::group(group)), bob, &[alice, bob]);
        assert_eq!(events(&mut alice_rx), vec!["groupMessageReaction"]);

        h.fanout
            .reaction(&reaction(ConversationRef::direct(alice, bob)), bob, &[]);
        assert_eq!(events(&mut alice_rx), vec!["messageReaction"]);
        assert_eq!(events(&mut bob_rx), vec!["messageReaction"]);
    }
}
