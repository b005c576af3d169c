use crate::db::now_ms;
use crate::directory::{resolve_name, ProfileDirectory, PLACEHOLDER_NAME};
use crate::error::ChatError;
use crate::identity;
use crate::model::Conversation;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

pub(crate) fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        participant_a: row.get(1)?,
        participant_b: row.get(2)?,
        name_a: row.get(3)?,
        name_b: row.get(4)?,
        last_message: row.get(5)?,
        last_sender: row.get(6)?,
        last_message_at: row.get(7)?,
        unread_a: row.get(8)?,
        unread_b: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

const CONVERSATION_COLUMNS: &str = "id, participant_a, participant_b, name_a, name_b, \
     last_message, last_sender, last_message_at, unread_a, unread_b, created_at, updated_at";

pub fn get_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>, ChatError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"
    ))?;
    Ok(stmt.query_row([id], row_to_conversation).optional()?)
}

/// All conversations a user participates in, most recent activity first.
pub fn list_conversations_for_user(
    conn: &Connection,
    user_id: &str,
) -> Result<Vec<Conversation>, ChatError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations \
         WHERE participant_a = ?1 OR participant_b = ?1 \
         ORDER BY COALESCE(last_message_at, created_at) DESC, id"
    ))?;
    let rows = stmt
        .query_map([user_id], row_to_conversation)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Create-or-repair a conversation for a pair of users. Idempotent.
///
/// The create is a single conditional write: under a first-contact race
/// exactly one caller inserts the row and the other observes it on the
/// following read. The repair path patches placeholder or stale display
/// names best-effort and never fails the call.
pub fn ensure_conversation(
    conn: &mut Connection,
    directory: &dyn ProfileDirectory,
    a: &str,
    b: &str,
    name_a: Option<&str>,
    name_b: Option<&str>,
) -> Result<Conversation, ChatError> {
    let id = identity::derive_conversation_id(a, b)?;
    let resolved_a = resolve_name(name_a, directory, a);
    let resolved_b = resolve_name(name_b, directory, b);
    let ((first, first_name), (second, second_name)) = if a <= b {
        ((a, resolved_a), (b, resolved_b))
    } else {
        ((b, resolved_b), (a, resolved_a))
    };

    let now = now_ms();
    let inserted = conn
        .execute(
            "INSERT INTO conversations \
               (id, participant_a, participant_b, name_a, name_b, \
                unread_a, unread_b, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, ?6) \
             ON CONFLICT(id) DO NOTHING",
            params![id, first, second, first_name, second_name, now],
        )
        .map_err(|e| ChatError::InitializationFailed(e.to_string()))?;

    if inserted == 0 {
        repair_names(conn, &id, &first_name, &second_name, now);
    }

    get_conversation(conn, &id)
        .map_err(|e| ChatError::InitializationFailed(e.to_string()))?
        .ok_or_else(|| ChatError::InitializationFailed(format!("{id} absent after create")))
}

// Only overwrites with names that resolved to something real; losing this
// update is acceptable, the next chat-open repairs again.
fn repair_names(conn: &Connection, id: &str, name_a: &str, name_b: &str, now: i64) {
    let res = conn.execute(
        "UPDATE conversations SET \
           name_a = CASE WHEN ?2 <> ?4 THEN ?2 ELSE name_a END, \
           name_b = CASE WHEN ?3 <> ?4 THEN ?3 ELSE name_b END, \
           updated_at = MAX(?5, updated_at + 1) \
         WHERE id = ?1 \
           AND ((?2 <> ?4 AND name_a <> ?2) OR (?3 <> ?4 AND name_b <> ?3))",
        params![id, name_a, name_b, PLACEHOLDER_NAME, now],
    );
    if let Err(e) = res {
        warn!(id, error = %e, "conversation name repair failed");
    }
}
