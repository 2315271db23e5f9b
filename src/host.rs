//! Host facilities the workspace relies on
//!
//! There is no editor process here: notifications, clipboard writes and
//! settings requests are forwarded to the connected views, and the active
//! editor file is whatever the views last reported.

use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::broadcast::{StateBroadcaster, ViewId};
use crate::error::WorkspaceError;
use crate::protocol::{InboundMessage, NotifyAction, NotifyLevel};

/// A user-visible message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub level: NotifyLevel,
    pub message: String,
    pub action: Option<NotifyAction>,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NotifyLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(NotifyLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NotifyLevel::Error, message)
    }

    fn new(level: NotifyLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            action: None,
        }
    }

    pub fn with_action(mut self, action: NotifyAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Advisory errors become warnings; everything else is an error with a
    /// "show log" action
    pub fn from_error(err: &WorkspaceError) -> Self {
        if err.is_advisory() {
            return Self::warning(err.to_string());
        }
        let action = match err {
            WorkspaceError::Settings { .. } => NotifyAction::OpenSettings,
            _ => NotifyAction::ShowLog,
        };
        Self::error(error_chain(err)).with_action(action)
    }
}

impl From<Notification> for InboundMessage {
    fn from(n: Notification) -> Self {
        InboundMessage::Notify {
            level: n.level,
            message: n.message,
            action: n.action,
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[derive(Debug, Default)]
pub struct Host {
    active_editor: Option<PathBuf>,
}

impl Host {
    pub fn active_editor(&self) -> Option<&Path> {
        self.active_editor.as_deref()
    }

    pub fn set_active_editor(&mut self, path: Option<PathBuf>) {
        self.active_editor = path;
    }

    /// Log and show a notification on every ready view
    pub fn notify(&self, views: &mut StateBroadcaster, notification: Notification) {
        match notification.level {
            NotifyLevel::Info => info!(message = %notification.message, "Notify"),
            NotifyLevel::Warning => warn!(message = %notification.message, "Notify"),
            NotifyLevel::Error => error!(message = %notification.message, "Notify"),
        }
        views.broadcast(&notification.into());
    }

    pub fn report(&self, views: &mut StateBroadcaster, err: &WorkspaceError) {
        self.notify(views, Notification::from_error(err));
    }

    /// Ask the requesting view to put `text` on its clipboard
    pub fn write_clipboard(&self, views: &mut StateBroadcaster, view: ViewId, text: String) {
        info!(view, text = %text, "Copy to clipboard");
        views.send_to(view, &InboundMessage::Clipboard { text });
    }

    /// Point the user at the workspace settings file
    pub fn open_settings(&self, views: &mut StateBroadcaster, settings: &Path, id: Option<&str>) {
        let message = match id {
            Some(id) => format!("Set objdiff.{id} in {}", settings.display()),
            None => format!("Settings file: {}", settings.display()),
        };
        self.notify(
            views,
            Notification::info(message).with_action(NotifyAction::OpenSettings),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::tests::RecordingSink;
    use crate::error::Precondition;

    #[test]
    fn test_precondition_becomes_warning() {
        let n = Notification::from_error(&Precondition::NoUnitSelected.into());
        assert_eq!(n, Notification::warning("No unit selected"));
    }

    #[test]
    fn test_error_includes_cause_and_show_log() {
        let err = WorkspaceError::ArtifactRead {
            path: PathBuf::from("b/a.o"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        let n = Notification::from_error(&err);
        assert_eq!(n.level, NotifyLevel::Error);
        assert_eq!(n.action, Some(NotifyAction::ShowLog));
        assert!(n.message.ends_with(": missing"), "{}", n.message);
    }

    #[test]
    fn test_notify_reaches_ready_views() {
        let mut views = StateBroadcaster::default();
        let sink = RecordingSink::default();
        views.attach(1, Box::new(sink.clone()));
        views.ready(1);
        sink.take();

        Host::default().notify(&mut views, Notification::info("hello"));
        assert_eq!(
            sink.take(),
            vec![InboundMessage::Notify {
                level: NotifyLevel::Info,
                message: "hello".to_string(),
                action: None,
            }]
        );
    }

    #[test]
    fn test_active_editor_tracking() {
        let mut host = Host::default();
        assert!(host.active_editor().is_none());
        host.set_active_editor(Some(PathBuf::from("/w/src/a.c")));
        assert_eq!(host.active_editor(), Some(Path::new("/w/src/a.c")));
    }
}
