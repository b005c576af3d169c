use crate::api::AppState;
use crate::conversations::get_conversation;
use crate::db::{self, now_ms};
use crate::error::ChatError;
use crate::model::Conversation;
use rusqlite::{params, Connection, TransactionBehavior};
use tokio::time::interval;
use tracing::{info, warn};

/// Recompute every participant's true unread count from the message read
/// flags and overwrite drifted counters. The flags are the ground truth;
/// the denormalized counters on the conversation row are only there for
/// O(1) inbox rendering. Returns the repaired conversations.
pub fn reconcile_unread(conn: &mut Connection) -> Result<Vec<Conversation>, ChatError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let drifted: Vec<(String, i64, i64)> = {
        let mut stmt = tx.prepare(
            "SELECT id, true_a, true_b FROM ( \
               SELECT c.id AS id, c.unread_a AS unread_a, c.unread_b AS unread_b, \
                      (SELECT COUNT(*) FROM messages m \
                        WHERE m.conversation_id = c.id AND m.read = 0 \
                          AND m.sender_id <> c.participant_a) AS true_a, \
                      (SELECT COUNT(*) FROM messages m \
                        WHERE m.conversation_id = c.id AND m.read = 0 \
                          AND m.sender_id <> c.participant_b) AS true_b \
               FROM conversations c) \
             WHERE true_a <> unread_a OR true_b <> unread_b",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    let now = now_ms();
    let mut repaired = Vec::with_capacity(drifted.len());
    for (id, true_a, true_b) in drifted {
        tx.execute(
            "UPDATE conversations SET unread_a = ?2, unread_b = ?3, \
               updated_at = MAX(?4, updated_at + 1) WHERE id = ?1",
            params![id, true_a, true_b, now],
        )?;
        if let Some(conv) = get_conversation(&tx, &id)? {
            repaired.push(conv);
        }
    }
    tx.commit()?;
    Ok(repaired)
}

/// Periodically close the gap between message read flags and the
/// denormalized unread counters, pushing repaired rows to live inboxes.
pub fn run_housekeeping(state: AppState) {
    let Some(every) = state.config.reconcile_interval() else {
        return;
    };
    tokio::spawn(async move {
        let mut tick = interval(every);
        loop {
            tick.tick().await;
            match db::with_conn(&state.pool, state.config.op_timeout(), reconcile_unread).await {
                Ok(repaired) => {
                    if !repaired.is_empty() {
                        info!(count = repaired.len(), "repaired drifted unread counters");
                        for conv in &repaired {
                            state.hub.publish_conversation(conv);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "unread reconciliation failed"),
            }
        }
    });
}
