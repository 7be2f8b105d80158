use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::store::Store;
use crate::types::Notification;

/// Delivers a message to a user. Delivery is fire-and-forget: failures are
/// logged and never surface to the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, user_id: &str, message: &str);
}

/// Persists notifications in the catalog database, where
/// `GET /api/v1/notifications` reads them back.
pub struct StoreNotifier {
    store: Arc<dyn Store>,
}

impl StoreNotifier {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

impl Notifier for StoreNotifier {
    fn notify(&self, user_id: &str, message: &str) {
        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.create_notification(&notification) {
            tracing::warn!(user_id, "Failed to store notification: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    #[test]
    fn test_store_notifier_persists() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.initialize().unwrap();
        let notifier = StoreNotifier::new(store.clone());

        notifier.notify("alice", "Tileset generation completed for dataset 'dem'.");

        let listed = store.list_notifications("alice").unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].message.contains("'dem'"));
        assert!(store.list_notifications("bob").unwrap().is_empty());
    }
}
