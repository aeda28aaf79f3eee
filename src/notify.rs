//! Notifications
//! Mission: tell users about settlement outcomes without ever blocking it
//!
//! Delivery is strictly best-effort. A failed notification is logged and
//! dropped; it never rolls back or delays money movement.

use serde::{Deserialize, Serialize};
use tracing::info;

/// What a settlement event looks like to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: String,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
}

impl Notification {
    pub fn new(kind: &str, title: &str, message: &str, link: Option<String>) -> Self {
        Self {
            kind: kind.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            link,
        }
    }
}

/// Delivery seam for settlement events. Implementations must not assume
/// they are called at most once per event.
pub trait NotificationSink: Send + Sync {
    /// Fire-and-forget delivery. Implementations swallow their own errors.
    fn notify(&self, user_id: i64, notification: Notification);
}

/// Default sink: structured log lines only.
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, user_id: i64, notification: Notification) {
        info!(
            user_id,
            kind = %notification.kind,
            title = %notification.title,
            message = %notification.message,
            "notification"
        );
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every delivery for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<(i64, Notification)>>,
    }

    impl NotificationSink for RecordingNotifier {
        fn notify(&self, user_id: i64, notification: Notification) {
            self.sent.lock().unwrap().push((user_id, notification));
        }
    }
}
