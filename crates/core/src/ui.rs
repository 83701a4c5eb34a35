//! User-facing notification surface consumed by the coordinator.

/// Sink for user-visible connection notifications.
///
/// Implemented by the embedding UI and only ever called by the
/// coordinator. `spinner_start` may be called while the spinner is already
/// running and should be idempotent.
pub trait Notifier: Send + Sync {
    /// Shows a prominent error notification.
    fn show_error(&self, title: &str, detail: &str);

    /// Clears any visible error notification.
    fn clear_error(&self) {}

    /// Starts the busy spinner with `text`.
    fn spinner_start(&self, text: &str);

    /// Updates the spinner text without restarting it.
    fn spinner_update(&self, text: &str) {
        let _ = text;
    }

    /// Stops the busy spinner.
    fn spinner_stop(&self);
}

/// Notifier that drops everything, for embedders without a UI.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn show_error(&self, _title: &str, _detail: &str) {}

    fn spinner_start(&self, _text: &str) {}

    fn spinner_stop(&self) {}
}
