use crate::error::ChatError;
use once_cell::sync::Lazy;
use regex::Regex;

// No underscore: the separator must never occur inside an id, otherwise two
// different pairs could collapse onto the same conversation id.
static PARTICIPANT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.-]*$").unwrap());

const SEPARATOR: char = '_';

pub fn valid_participant(id: &str) -> bool {
    PARTICIPANT_RE.is_match(id)
}

/// The two ids in canonical (sorted) order.
pub fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Derive the canonical conversation id for an unordered pair of users.
///
/// Pure and commutative, so either party can compute it offline and both
/// arrive at the same record. `derive_conversation_id("alice", "bob")`
/// and `derive_conversation_id("bob", "alice")` are both `"alice_bob"`.
pub fn derive_conversation_id(a: &str, b: &str) -> Result<String, ChatError> {
    if !valid_participant(a) {
        return Err(ChatError::InvalidParticipants(format!("bad id: {a:?}")));
    }
    if !valid_participant(b) {
        return Err(ChatError::InvalidParticipants(format!("bad id: {b:?}")));
    }
    if a == b {
        return Err(ChatError::InvalidParticipants(format!(
            "self-chat not allowed: {a}"
        )));
    }
    let (min, max) = ordered_pair(a, b);
    Ok(format!("{min}{SEPARATOR}{max}"))
}

/// Recover the participant pair from a canonical conversation id. The
/// separator cannot occur inside a participant id, so the split is
/// unambiguous.
pub fn split_conversation_id(id: &str) -> Option<(&str, &str)> {
    let (a, b) = id.split_once(SEPARATOR)?;
    (valid_participant(a) && valid_participant(b)).then_some((a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commutative_and_canonical() {
        assert_eq!(derive_conversation_id("alice", "bob").unwrap(), "alice_bob");
        assert_eq!(derive_conversation_id("bob", "alice").unwrap(), "alice_bob");
        assert_ne!(
            derive_conversation_id("alice", "carol").unwrap(),
            derive_conversation_id("alice", "bob").unwrap()
        );
    }

    #[test]
    fn self_chat_rejected() {
        assert!(matches!(
            derive_conversation_id("alice", "alice"),
            Err(ChatError::InvalidParticipants(_))
        ));
    }

    #[test]
    fn malformed_ids_rejected() {
        for bad in ["", "alice_bob", "a b", ".alice", "bób"] {
            assert!(
                matches!(
                    derive_conversation_id(bad, "bob"),
                    Err(ChatError::InvalidParticipants(_))
                ),
                "expected rejection for {bad:?}"
            );
        }
        assert!(derive_conversation_id("alice.w", "bob-2").is_ok());
    }

    #[test]
    fn split_inverts_derive() {
        let id = derive_conversation_id("bob-2", "alice.w").unwrap();
        assert_eq!(split_conversation_id(&id), Some(("alice.w", "bob-2")));
        assert_eq!(split_conversation_id("no-separator"), None);
    }
}
