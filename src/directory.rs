use crate::error::ChatError;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Display name used when neither the caller nor the profile service can
/// name a participant. Repaired lazily once a real name shows up.
pub const PLACEHOLDER_NAME: &str = "Unknown";

/// Abstraction over the external identity/profile service.
pub trait ProfileDirectory: Send + Sync {
    /// Err(NotFound) on a profile miss; callers fall back to a placeholder.
    fn display_name(&self, user_id: &str) -> Result<String, ChatError>;
}

/// Directory that knows nobody. Used when running without a profile service.
#[derive(Default)]
pub struct NullDirectory;

impl ProfileDirectory for NullDirectory {
    fn display_name(&self, user_id: &str) -> Result<String, ChatError> {
        Err(ChatError::NotFound(format!("profile: {user_id}")))
    }
}

/// In-memory directory for tests and standalone deployments.
#[derive(Default)]
pub struct StaticDirectory {
    names: RwLock<HashMap<String, String>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: &str, name: &str) {
        self.names
            .write()
            .insert(user_id.to_string(), name.to_string());
    }
}

impl ProfileDirectory for StaticDirectory {
    fn display_name(&self, user_id: &str) -> Result<String, ChatError> {
        self.names
            .read()
            .get(user_id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("profile: {user_id}")))
    }
}

/// Resolve a display name: caller-provided value, then the profile
/// service, then the placeholder. Never fails.
pub fn resolve_name(
    provided: Option<&str>,
    directory: &dyn ProfileDirectory,
    user_id: &str,
) -> String {
    if let Some(name) = provided {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    directory
        .display_name(user_id)
        .unwrap_or_else(|_| PLACEHOLDER_NAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_chain() {
        let dir = StaticDirectory::new();
        dir.insert("alice", "Alice W");
        assert_eq!(resolve_name(Some("Ally"), &dir, "alice"), "Ally");
        assert_eq!(resolve_name(None, &dir, "alice"), "Alice W");
        assert_eq!(resolve_name(Some("  "), &dir, "alice"), "Alice W");
        assert_eq!(resolve_name(None, &dir, "bob"), PLACEHOLDER_NAME);
        assert_eq!(resolve_name(None, &NullDirectory, "bob"), PLACEHOLDER_NAME);
    }
}
