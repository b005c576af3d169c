use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable record of a two-party conversation. Participants are stored in
/// canonical (sorted) order; names and the last-message summary are
/// denormalized for O(1) inbox rendering and may lag the profile store.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub name_a: String,
    pub name_b: String,
    pub last_message: Option<String>,
    pub last_sender: Option<String>,
    pub last_message_at: Option<i64>,
    pub unread_a: i64,
    pub unread_b: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant_a == user_id || self.participant_b == user_id
    }

    pub fn unread_for(&self, user_id: &str) -> i64 {
        if self.participant_a == user_id {
            self.unread_a
        } else if self.participant_b == user_id {
            self.unread_b
        } else {
            0
        }
    }

    /// The other participant's id and display name.
    pub fn peer_of(&self, user_id: &str) -> Option<(&str, &str)> {
        if self.participant_a == user_id {
            Some((&self.participant_b, &self.name_b))
        } else if self.participant_b == user_id {
            Some((&self.participant_a, &self.name_a))
        } else {
            None
        }
    }

    /// Read-only inbox projection for one participant.
    pub fn view_for(&self, user_id: &str) -> Option<ConversationView> {
        let (peer_id, peer_name) = self.peer_of(user_id)?;
        Some(ConversationView {
            conversation_id: self.id.clone(),
            peer_id: peer_id.to_string(),
            peer_name: peer_name.to_string(),
            last_message: self.last_message.clone(),
            last_message_at: self.last_message_at,
            unread_count: self.unread_for(user_id),
        })
    }
}

/// What the inbox screen renders for one conversation row.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ConversationView {
    pub conversation_id: String,
    pub peer_id: String,
    pub peer_name: String,
    pub last_message: Option<String>,
    pub last_message_at: Option<i64>,
    pub unread_count: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: String,
    pub sender_id: String,
    /// Sender display name snapshotted at send time.
    pub sender_name: String,
    pub body: String,
    /// Server-assigned, strictly increasing within a conversation.
    pub sent_at: i64,
    pub read: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv() -> Conversation {
        Conversation {
            id: "alice_bob".into(),
            participant_a: "alice".into(),
            participant_b: "bob".into(),
            name_a: "Alice".into(),
            name_b: "Bob".into(),
            last_message: Some("hi".into()),
            last_sender: Some("alice".into()),
            last_message_at: Some(1000),
            unread_a: 0,
            unread_b: 2,
            created_at: 1,
            updated_at: 1000,
        }
    }

    #[test]
    fn projection_is_from_the_callers_side() {
        let c = conv();
        let bob = c.view_for("bob").unwrap();
        assert_eq!(bob.peer_id, "alice");
        assert_eq!(bob.peer_name, "Alice");
        assert_eq!(bob.unread_count, 2);
        let alice = c.view_for("alice").unwrap();
        assert_eq!(alice.peer_id, "bob");
        assert_eq!(alice.unread_count, 0);
        assert!(c.view_for("carol").is_none());
    }
}
