use tracing::debug;

/// Abstraction over the external presence/notification service. Events are
/// fire-and-forget: the send path never waits on delivery.
pub trait Notifier: Send + Sync {
    fn message_sent(&self, conversation_id: &str, sender_id: &str, recipient_id: &str);
}

/// Drops every event. Default when no notification service is wired up.
#[derive(Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn message_sent(&self, conversation_id: &str, sender_id: &str, recipient_id: &str) {
        debug!(conversation_id, sender_id, recipient_id, "message_sent event dropped");
    }
}
