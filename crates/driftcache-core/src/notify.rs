//! UI-facing collaborators.
//!
//! The engine's only user-visible output is the notification surface; page
//! reloads after an update are the only other page-level side effect. Both
//! are injected at construction so the engine never reaches into ambient UI
//! state.

use std::time::Duration;

use tracing::{error, info, warn};

/// Notification severity, mapped to banner styling by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// A user-facing message. The message may carry inline markup for an action
/// control (e.g. an "update now" button).
#[derive(Debug, Clone)]
pub struct Notification {
    pub message: String,
    pub severity: Severity,
    /// Auto-dismiss after this long; `None` keeps the banner until acted on.
    pub timeout: Option<Duration>,
}

impl Notification {
    pub fn new(message: impl Into<String>, severity: Severity) -> Self {
        Self {
            message: message.into(),
            severity,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Where user-facing notifications go. Treated as an external collaborator;
/// implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Requests a full page reload so a newly controlling worker serves the page.
pub trait PageReload: Send + Sync {
    fn reload(&self);
}

/// Notifier that writes to the tracing log. Default collaborator for
/// headless use.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        match notification.severity {
            Severity::Info | Severity::Success => info!(message = %notification.message, "notification"),
            Severity::Warning => warn!(message = %notification.message, "notification"),
            Severity::Error => error!(message = %notification.message, "notification"),
        }
    }
}

/// Reload collaborator for contexts without a page to reload.
pub struct LogReload;

impl PageReload for LogReload {
    fn reload(&self) {
        info!("Page reload requested");
    }
}
