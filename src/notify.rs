//! Desktop notifications for user-visible notices.

use notify_rust::Notification;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber, error};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::{APP_NAME, APP_NAME_PRETTY};

/// Send a desktop notification with a summary and body.
pub fn notify(summary: &str, body: &str) {
    Notification::new()
        .appname(APP_NAME)
        .summary(&format!("{} - {}", APP_NAME_PRETTY, summary))
        .body(body)
        .show()
        .map_err(|e| error!("Failed to send notification: {}", e))
        .ok();
}

/// Pulls the message and the optional `notice` category out of an event.
#[derive(Debug, Default)]
struct NoticeVisitor {
    message: Option<String>,
    notice: Option<String>,
}

impl Visit for NoticeVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "notice" => self.notice = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => self.message = Some(format!("{:?}", value)),
            "notice" => self.notice = Some(format!("{:?}", value)),
            _ => {}
        }
    }
}

/// Tracing layer that raises a desktop notification for warnings and
/// errors. Events logged with a `notice` field use it as the summary.
#[derive(Debug, Default)]
pub struct NotificationLayer {}

impl NotificationLayer {
    pub fn new() -> Self {
        Self {}
    }
}

fn default_summary(level: Level) -> Option<&'static str> {
    match level {
        Level::ERROR => Some("Error"),
        Level::WARN => Some("Warning"),
        _ => None,
    }
}

impl<S: Subscriber> Layer<S> for NotificationLayer {
    fn on_event(&self, event: &Event<'_>, _: Context<'_, S>) {
        let Some(fallback) = default_summary(*event.metadata().level()) else {
            return;
        };

        let mut visitor = NoticeVisitor::default();
        event.record(&mut visitor);

        if let Some(message) = visitor.message {
            let summary = visitor.notice.as_deref().unwrap_or(fallback);
            notify(summary, &message);
        }
    }
}
