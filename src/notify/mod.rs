// ABOUTME: Fire-and-forget deployment notifications.
// ABOUTME: The default notifier writes them to the tracing log.

use serde::Serialize;

use crate::types::ApplicationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub app_id: ApplicationId,
    pub app_name: String,
    pub kind: NotificationKind,
}

/// Delivery must not block or fail the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Notifier that logs each notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        match notification.kind {
            NotificationKind::Success => tracing::info!(
                app = %notification.app_name,
                "{}: {}",
                notification.title,
                notification.message
            ),
            NotificationKind::Failure => tracing::error!(
                app = %notification.app_name,
                "{}: {}",
                notification.title,
                notification.message
            ),
        }
    }
}
