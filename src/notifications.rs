//! Desktop notifications for timer alerts.

use crate::timer::Notice;
use notify_rust::Notification;
use std::thread::{self, JoinHandle};
use tracing::warn;

/// Shows a desktop notification.
/// Runs in a background thread to avoid blocking; join the handle to wait
/// for delivery before the process exits.
pub fn show_notice(notice: &Notice) -> JoinHandle<()> {
    let Notice { summary, body } = notice.clone();
    thread::spawn(move || {
        if let Err(e) = Notification::new()
            .summary(&summary)
            .body(&body)
            .appname("Time Tracker")
            .show()
        {
            warn!(error = %e, "Failed to show notification");
        }
    })
}
