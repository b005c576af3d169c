use crate::conversations::get_conversation;
use crate::db::now_ms;
use crate::error::ChatError;
use crate::messages::mark_read_up_to;
use crate::model::{Conversation, Message};
use rusqlite::{params, Connection, TransactionBehavior};

/// Mark everything currently in a conversation as read by `reader_id`:
/// flips the read flags up to the newest message visible at call time and
/// resets the reader's unread counter to zero, as one transaction.
///
/// Safe to retry: a second call finds nothing to flip and leaves the
/// counter at zero. Counters are reset, never decremented, so they cannot
/// go negative.
pub fn mark_conversation_read(
    conn: &mut Connection,
    conversation_id: &str,
    reader_id: &str,
) -> Result<Conversation, ChatError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let conv = get_conversation(&tx, conversation_id)?
        .ok_or_else(|| ChatError::NotFound(format!("conversation: {conversation_id}")))?;
    if !conv.is_participant(reader_id) {
        return Err(ChatError::InvalidParticipants(format!(
            "{reader_id} is not in {conversation_id}"
        )));
    }
    let up_to: i64 = tx.query_row(
        "SELECT COALESCE(MAX(sent_at), 0) FROM messages WHERE conversation_id = ?1",
        [conversation_id],
        |row| row.get(0),
    )?;
    let flipped = mark_read_up_to(&tx, conversation_id, reader_id, up_to)?;
    if flipped > 0 || conv.unread_for(reader_id) > 0 {
        tx.execute(
            "UPDATE conversations SET \
               unread_a = CASE WHEN participant_a = ?2 THEN 0 ELSE unread_a END, \
               unread_b = CASE WHEN participant_b = ?2 THEN 0 ELSE unread_b END, \
               updated_at = MAX(?3, updated_at + 1) \
             WHERE id = ?1",
            params![conversation_id, reader_id, now_ms()],
        )?;
    }
    tx.commit()?;
    get_conversation(conn, conversation_id)?
        .ok_or_else(|| ChatError::NotFound(format!("conversation: {conversation_id}")))
}

/// Post-append bookkeeping: bump the recipient's unread counter and rewrite
/// the last-message summary. One atomic statement, no read-then-write, so
/// racing senders can never lose an increment. Only called after the append
/// committed.
pub fn on_message_sent(
    conn: &Connection,
    message: &Message,
) -> Result<Conversation, ChatError> {
    let changed = conn.execute(
        "UPDATE conversations SET \
           unread_a = unread_a + (CASE WHEN participant_a <> ?2 THEN 1 ELSE 0 END), \
           unread_b = unread_b + (CASE WHEN participant_b <> ?2 THEN 1 ELSE 0 END), \
           last_message = ?3, last_sender = ?2, last_message_at = ?4, \
           updated_at = MAX(?4, updated_at + 1) \
         WHERE id = ?1",
        params![
            message.conversation_id,
            message.sender_id,
            message.body,
            message.sent_at
        ],
    )?;
    if changed == 0 {
        return Err(ChatError::NotFound(format!(
            "conversation: {}",
            message.conversation_id
        )));
    }
    get_conversation(conn, &message.conversation_id)?.ok_or_else(|| {
        ChatError::NotFound(format!("conversation: {}", message.conversation_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::ensure_conversation;
    use crate::db;
    use crate::directory::NullDirectory;
    use crate::messages::{append, list_messages};

    fn send(conn: &mut Connection, sender: &str, body: &str) -> Conversation {
        let msg = append(conn, "alice_bob", sender, None, body).unwrap();
        on_message_sent(conn, &msg).unwrap()
    }

    fn setup() -> Connection {
        let mut conn = db::init_db(":memory:").unwrap();
        ensure_conversation(&mut conn, &NullDirectory, "alice", "bob", None, None).unwrap();
        conn
    }

    #[test]
    fn unread_accumulates_for_recipient_only() {
        let mut conn = setup();
        for i in 0..3 {
            let c = send(&mut conn, "alice", &format!("m{i}"));
            assert_eq!(c.unread_for("bob"), i + 1);
            assert_eq!(c.unread_for("alice"), 0);
            assert_eq!(c.last_message.as_deref(), Some(format!("m{i}").as_str()));
            assert_eq!(c.last_sender.as_deref(), Some("alice"));
        }
    }

    #[test]
    fn read_mark_resets_and_is_idempotent() {
        let mut conn = setup();
        send(&mut conn, "alice", "one");
        send(&mut conn, "alice", "two");
        let c = mark_conversation_read(&mut conn, "alice_bob", "bob").unwrap();
        assert_eq!(c.unread_for("bob"), 0);
        assert!(list_messages(&conn, "alice_bob")
            .unwrap()
            .iter()
            .all(|m| m.read));
        // retry is a no-op, never below zero
        let c = mark_conversation_read(&mut conn, "alice_bob", "bob").unwrap();
        assert_eq!(c.unread_for("bob"), 0);
        assert!(c.unread_for("bob") >= 0);
    }

    #[test]
    fn read_mark_does_not_swallow_racing_send() {
        let mut conn = setup();
        send(&mut conn, "alice", "before");
        let boundary: i64 = conn
            .query_row(
                "SELECT MAX(sent_at) FROM messages WHERE conversation_id = 'alice_bob'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        // a new message lands after the boundary was taken
        mark_read_up_to(&conn, "alice_bob", "bob", boundary).unwrap();
        let c = send(&mut conn, "alice", "after");
        let unread: Vec<bool> = list_messages(&conn, "alice_bob")
            .unwrap()
            .iter()
            .map(|m| m.read)
            .collect();
        assert_eq!(unread, vec![true, false]);
        assert!(c.unread_for("bob") >= 1);
    }

    #[test]
    fn scenario_alice_sends_bob_reads() {
        let mut conn = setup();
        let c = send(&mut conn, "alice", "hi");
        assert_eq!(c.unread_for("alice"), 0);
        assert_eq!(c.unread_for("bob"), 1);
        assert_eq!(c.last_message.as_deref(), Some("hi"));
        let c = mark_conversation_read(&mut conn, "alice_bob", "bob").unwrap();
        assert_eq!(c.unread_for("alice"), 0);
        assert_eq!(c.unread_for("bob"), 0);
    }

    #[test]
    fn outsider_cannot_mark() {
        let mut conn = setup();
        assert!(matches!(
            mark_conversation_read(&mut conn, "alice_bob", "carol"),
            Err(ChatError::InvalidParticipants(_))
        ));
    }
}
