use crate::conversations::{get_conversation, list_conversations_for_user};
use crate::db::{with_read_conn, DbPool};
use crate::error::ChatError;
use crate::messages::list_messages;
use crate::model::{Conversation, Message};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Key a live subscription either to one conversation's message log or to
/// one participant's conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Conversation(String),
    Inbox(String),
}

impl Topic {
    pub fn conversation(id: &str) -> Self {
        Self::Conversation(id.to_string())
    }

    pub fn inbox(user_id: &str) -> Self {
        Self::Inbox(user_id.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum ChatEvent {
    Message(Message),
    Conversation(Conversation),
}

/// Why a live stream ended. `Lagged` means the subscriber fell behind the
/// channel buffer and must resubscribe for a fresh snapshot-then-delta
/// handshake.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEnd {
    Lagged,
    Closed,
}

/// Topic-keyed fan-out registry. Each topic is an independent broadcast
/// channel: subscribers get isolated receivers and one slow consumer lags
/// on its own without holding anyone else up.
pub struct Hub {
    capacity: usize,
    channels: Mutex<HashMap<Topic, broadcast::Sender<ChatEvent>>>,
    send_order: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Mutex::new(HashMap::new()),
            send_order: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<ChatEvent> {
        let mut channels = self.channels.lock();
        channels
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    fn publish(&self, topic: &Topic, event: ChatEvent) {
        let mut channels = self.channels.lock();
        if let Some(tx) = channels.get(topic) {
            if tx.send(event).is_err() {
                // nobody listening anymore, tear the channel down
                channels.remove(topic);
            }
        }
    }

    pub fn publish_message(&self, message: &Message) {
        self.publish(
            &Topic::conversation(&message.conversation_id),
            ChatEvent::Message(message.clone()),
        );
    }

    /// Deliver a conversation update to both participants' inbox streams.
    pub fn publish_conversation(&self, conversation: &Conversation) {
        for user in [&conversation.participant_a, &conversation.participant_b] {
            self.publish(
                &Topic::inbox(user),
                ChatEvent::Conversation(conversation.clone()),
            );
        }
    }

    /// Per-conversation lock serializing commit+publish on the send path,
    /// so fan-out order always matches storage order. Entries are pruned
    /// once no send holds them.
    pub fn order_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.send_order.lock();
        locks.retain(|_, l| Arc::strong_count(l) > 1);
        locks
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Snapshot-then-delta stream over one conversation's message log.
///
/// The receiver attaches before the snapshot is read, and deltas at or
/// below the snapshot boundary are dropped, so a late joiner sees the full
/// backlog followed by every later message exactly once, in order.
pub struct MessageSubscription {
    snapshot: Vec<Message>,
    boundary: i64,
    rx: broadcast::Receiver<ChatEvent>,
}

impl MessageSubscription {
    pub fn snapshot(&self) -> &[Message] {
        &self.snapshot
    }

    pub fn take_snapshot(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.snapshot)
    }

    /// Next live message past the snapshot.
    pub async fn recv(&mut self) -> Result<Message, StreamEnd> {
        loop {
            match self.rx.recv().await {
                Ok(ChatEvent::Message(m)) if m.sent_at > self.boundary => return Ok(m),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => return Err(StreamEnd::Lagged),
                Err(broadcast::error::RecvError::Closed) => return Err(StreamEnd::Closed),
            }
        }
    }
}

/// Snapshot-then-delta stream over one participant's conversation list.
/// Deltas are admitted on strictly newer `updated_at` per conversation
/// (storage keeps that column strictly increasing), which both suppresses
/// duplicates around the snapshot boundary and keeps stale states from
/// arriving after fresh ones.
pub struct InboxSubscription {
    snapshot: Vec<Conversation>,
    seen: HashMap<String, i64>,
    rx: broadcast::Receiver<ChatEvent>,
}

impl InboxSubscription {
    pub fn snapshot(&self) -> &[Conversation] {
        &self.snapshot
    }

    pub fn take_snapshot(&mut self) -> Vec<Conversation> {
        std::mem::take(&mut self.snapshot)
    }

    pub async fn recv(&mut self) -> Result<Conversation, StreamEnd> {
        loop {
            match self.rx.recv().await {
                Ok(ChatEvent::Conversation(c)) => {
                    let last = self.seen.get(&c.id).copied().unwrap_or(i64::MIN);
                    if c.updated_at > last {
                        self.seen.insert(c.id.clone(), c.updated_at);
                        return Ok(c);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => return Err(StreamEnd::Lagged),
                Err(broadcast::error::RecvError::Closed) => return Err(StreamEnd::Closed),
            }
        }
    }
}

/// Open a live view of a conversation: full backlog plus every later
/// message. Dropping the subscription releases it.
pub async fn subscribe_messages(
    hub: &Hub,
    pool: &DbPool,
    deadline: Duration,
    conversation_id: &str,
) -> Result<MessageSubscription, ChatError> {
    let rx = hub.subscribe(&Topic::conversation(conversation_id));
    let id = conversation_id.to_string();
    let snapshot = with_read_conn(pool, deadline, move |conn| {
        if get_conversation(conn, &id)?.is_none() {
            return Err(ChatError::NotFound(format!("conversation: {id}")));
        }
        list_messages(conn, &id)
    })
    .await?;
    let boundary = snapshot.last().map(|m| m.sent_at).unwrap_or(0);
    Ok(MessageSubscription {
        snapshot,
        boundary,
        rx,
    })
}

/// Open a live view of a participant's inbox: current conversations plus
/// every later create/update, each carrying `last_message_at` so the
/// caller can keep its list ordered.
pub async fn subscribe_conversations_for(
    hub: &Hub,
    pool: &DbPool,
    deadline: Duration,
    user_id: &str,
) -> Result<InboxSubscription, ChatError> {
    let rx = hub.subscribe(&Topic::inbox(user_id));
    let uid = user_id.to_string();
    let snapshot = with_read_conn(pool, deadline, move |conn| {
        list_conversations_for_user(conn, &uid)
    })
    .await?;
    let seen = snapshot
        .iter()
        .map(|c| (c.id.clone(), c.updated_at))
        .collect();
    Ok(InboxSubscription { snapshot, seen, rx })
}
