use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::cache::CachedRecord;

pub trait Notifier: Send + Sync {
    /// Show a notification. Resolves to true if the user clicked it.
    fn notify(&self, title: &str, body: &str) -> BoxFuture<'static, bool>;
}

/// Freedesktop/macOS/Windows notifications through notify-rust.
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopNotifier;

impl Notifier for DesktopNotifier {
    fn notify(&self, title: &str, body: &str) -> BoxFuture<'static, bool> {
        let title = title.to_string();
        let body = body.to_string();
        async move {
            tokio::task::spawn_blocking(move || show(&title, &body))
                .await
                .unwrap_or_else(|e| {
                    log::warn!("Notification task failed: {e}");
                    false
                })
        }
        .boxed()
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
fn show(title: &str, body: &str) -> bool {
    let shown = notify_rust::Notification::new()
        .summary(title)
        .body(body)
        .icon("dialog-information")
        .action("default", "Open")
        .show();
    match shown {
        Ok(handle) => {
            let mut clicked = false;
            handle.wait_for_action(|action| clicked = action == "default");
            clicked
        }
        Err(e) => {
            log::warn!("Failed to show notification: {e}");
            false
        }
    }
}

#[cfg(not(all(unix, not(target_os = "macos"))))]
fn show(title: &str, body: &str) -> bool {
    if let Err(e) = notify_rust::Notification::new()
        .summary(title)
        .body(body)
        .timeout(5000)
        .show()
    {
        log::warn!("Failed to show notification: {e}");
    }
    false
}

/// Title and body for the unread notification, or None when nothing is unread.
/// The body lists up to three records, most recently changed first.
pub fn unread_summary(records: &[Arc<CachedRecord>]) -> Option<(String, String)> {
    let mut unread: Vec<&Arc<CachedRecord>> = records.iter().filter(|r| r.unread()).collect();
    if unread.is_empty() {
        return None;
    }
    unread.sort_by_key(|r| std::cmp::Reverse(r.last_change_time()));

    let title = match unread.len() {
        1 => "You have 1 unread bug".to_string(),
        n => format!("You have {n} unread bugs"),
    };
    let body = unread
        .iter()
        .take(3)
        .map(|r| format!("{} - {}", r.id(), r.summary()))
        .collect::<Vec<_>>()
        .join("\n");
    Some((title, body))
}

/// Title and body announcing `count` bugs in the requests folder.
pub fn requests_summary(count: usize) -> Option<(String, String)> {
    match count {
        0 => None,
        1 => Some((
            "You have 1 request".to_string(),
            "Select the Requests folder to browse the bug.".to_string(),
        )),
        n => Some((
            format!("You have {n} requests"),
            "Select the Requests folder to browse those bugs.".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::fixtures::{at, record};
    use crate::core::models::Annotation;

    fn cached(id: u64, minute: u32, unread: bool) -> Arc<CachedRecord> {
        let mut r = record(id, &format!("bug {id}"));
        r.last_change_time = at(minute);
        Arc::new(CachedRecord::new(
            r,
            Annotation {
                unread,
                ..Default::default()
            },
        ))
    }

    #[test]
    fn nothing_unread_means_no_notification() {
        assert!(unread_summary(&[cached(1, 0, false)]).is_none());
    }

    #[test]
    fn lists_three_newest_unread() {
        let records = vec![
            cached(1, 1, true),
            cached(2, 5, true),
            cached(3, 3, false),
            cached(4, 9, true),
            cached(5, 2, true),
        ];
        let (title, body) = unread_summary(&records).unwrap();
        assert_eq!(title, "You have 4 unread bugs");
        assert_eq!(body, "4 - bug 4\n2 - bug 2\n5 - bug 5");
    }

    #[test]
    fn singular_title() {
        let (title, body) = unread_summary(&[cached(8, 0, true)]).unwrap();
        assert_eq!(title, "You have 1 unread bug");
        assert_eq!(body, "8 - bug 8");
    }

    #[test]
    fn requests_wording() {
        assert!(requests_summary(0).is_none());
        assert_eq!(
            requests_summary(1).unwrap(),
            (
                "You have 1 request".to_string(),
                "Select the Requests folder to browse the bug.".to_string()
            )
        );
        assert_eq!(requests_summary(5).unwrap().0, "You have 5 requests");
    }
}
