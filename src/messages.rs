use crate::db::now_ms;
use crate::error::ChatError;
use crate::model::Message;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap_or_default(),
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        body: row.get(4)?,
        sent_at: row.get(5)?,
        read: row.get::<_, i64>(6)? != 0,
    })
}

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, sender_name, body, sent_at, read";

/// Append a message to a conversation's log.
///
/// The ordering timestamp is assigned here, inside the write transaction:
/// `max(now, last + 1)` keeps it strictly increasing per conversation no
/// matter how fast concurrent senders arrive or how wrong their clocks are.
pub fn append(
    conn: &mut Connection,
    conversation_id: &str,
    sender_id: &str,
    sender_name: Option<&str>,
    body: &str,
) -> Result<Message, ChatError> {
    if body.trim().is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let participants: Option<(String, String, String, String)> = tx
        .query_row(
            "SELECT participant_a, participant_b, name_a, name_b \
             FROM conversations WHERE id = ?1",
            [conversation_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    let Some((pa, pb, name_a, name_b)) = participants else {
        return Err(ChatError::NotFound(format!(
            "conversation: {conversation_id}"
        )));
    };
    let stored_name = if sender_id == pa {
        name_a
    } else if sender_id == pb {
        name_b
    } else {
        return Err(ChatError::InvalidParticipants(format!(
            "{sender_id} is not in {conversation_id}"
        )));
    };
    let sender_name = match sender_name {
        Some(n) if !n.trim().is_empty() => n.trim().to_string(),
        _ => stored_name,
    };

    let last: i64 = tx.query_row(
        "SELECT COALESCE(MAX(sent_at), 0) FROM messages WHERE conversation_id = ?1",
        [conversation_id],
        |row| row.get(0),
    )?;
    let sent_at = now_ms().max(last + 1);
    let id = Uuid::new_v4();
    tx.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, sender_name, body, sent_at, read) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
        params![
            id.to_string(),
            conversation_id,
            sender_id,
            sender_name,
            body,
            sent_at
        ],
    )?;
    tx.commit()?;
    Ok(Message {
        id,
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        sender_name,
        body: body.to_string(),
        sent_at,
        read: false,
    })
}

/// Full log for a conversation in delivery order.
pub fn list_messages(conn: &Connection, conversation_id: &str) -> Result<Vec<Message>, ChatError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages \
         WHERE conversation_id = ?1 ORDER BY sent_at, id"
    ))?;
    let msgs = stmt
        .query_map([conversation_id], row_to_message)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(msgs)
}

/// Flip the read flag on messages addressed to `reader_id` up to and
/// including `up_to_ts`. Bounded so a send racing with the mark is never
/// swallowed. Returns how many flags flipped.
pub fn mark_read_up_to(
    conn: &Connection,
    conversation_id: &str,
    reader_id: &str,
    up_to_ts: i64,
) -> Result<usize, ChatError> {
    let flipped = conn.execute(
        "UPDATE messages SET read = 1 \
         WHERE conversation_id = ?1 AND sender_id <> ?2 AND read = 0 AND sent_at <= ?3",
        params![conversation_id, reader_id, up_to_ts],
    )?;
    Ok(flipped)
}
