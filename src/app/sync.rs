use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::notify::{requests_summary, unread_summary, Notifier};
use super::router::Route;
use super::{DataSource, LocationBar};
use crate::bus::{Event, EventBus};
use crate::cache::{AnnotationOverlay, RecordCache};
use crate::core::connectivity::Connectivity;
use crate::core::error::FetchError;
use crate::core::models::{Record, RecordId};
use crate::core::store::SUBSCRIPTIONS;

/// Subscription set holding the bugs that await the user's attention.
const REQUESTS: &str = "requests";

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub fetched: usize,
    pub changed: usize,
    pub newly_unread: usize,
    pub unread: usize,
}

pub struct SyncSettings {
    pub interval: Duration,
    pub subscriptions: Vec<String>,
    pub show_desktop_notifications: bool,
}

struct SyncInner {
    cache: RecordCache,
    overlay: AnnotationOverlay,
    source: Arc<dyn DataSource>,
    bus: EventBus,
    connectivity: Connectivity,
    notifier: Arc<dyn Notifier>,
    location: Arc<dyn LocationBar>,
    settings: SyncSettings,
    first_run_done: AtomicBool,
    notifications: Mutex<Vec<JoinHandle<()>>>,
}

/// Periodically refreshes the subscribed record sets, plus once right away
/// whenever connectivity comes back.
pub struct SyncScheduler {
    inner: Arc<SyncInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: RecordCache,
        overlay: AnnotationOverlay,
        source: Arc<dyn DataSource>,
        bus: EventBus,
        connectivity: Connectivity,
        notifier: Arc<dyn Notifier>,
        location: Arc<dyn LocationBar>,
        settings: SyncSettings,
    ) -> Self {
        SyncScheduler {
            inner: Arc::new(SyncInner {
                cache,
                overlay,
                source,
                bus,
                connectivity,
                notifier,
                location,
                settings,
                first_run_done: AtomicBool::new(false),
                notifications: Mutex::new(Vec::new()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Start the timer loop. The first tick fires immediately.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut online = inner.connectivity.watch();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let now_online = *online.borrow_and_update();
                        if !now_online {
                            continue;
                        }
                        log::info!("Back online, syncing now");
                        ticker.reset();
                    }
                }

                match inner.run_once().await {
                    Ok(_) | Err(FetchError::Offline) => {}
                    Err(e) => log::warn!(
                        "Sync failed, retrying in {}s: {e}",
                        inner.settings.interval.as_secs()
                    ),
                }
            }
        }));
        log::info!(
            "Sync scheduled every {}s for {:?}",
            self.inner.settings.interval.as_secs(),
            self.inner.settings.subscriptions
        );
    }

    /// Stop the timer loop and drop outstanding notifications.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            log::info!("Sync stopped");
        }
        for pending in self.inner.notifications.lock().drain(..) {
            pending.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    pub async fn run_once(&self) -> Result<SyncReport, FetchError> {
        self.inner.run_once().await
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SyncInner {
    async fn run_once(&self) -> Result<SyncReport, FetchError> {
        if !self.connectivity.is_online() {
            log::debug!("Offline, skipping sync");
            return Err(FetchError::Offline);
        }

        let mut sets: Vec<(String, Vec<RecordId>)> = Vec::new();
        let mut newest: HashMap<RecordId, Record> = HashMap::new();
        for name in &self.settings.subscriptions {
            let records = self.source.fetch_subscribed(name).await?;
            log::debug!("Subscription {name:?}: {} records", records.len());
            sets.push((name.clone(), records.iter().map(|r| r.id).collect()));
            for record in records {
                match newest.get(&record.id) {
                    Some(seen) if seen.last_change_time >= record.last_change_time => {}
                    _ => {
                        newest.insert(record.id, record);
                    }
                }
            }
        }

        let fetched = newest.len();
        let mut records: Vec<Record> = newest.into_values().collect();
        records.sort_by_key(|r| r.id);
        // Flag first: a record must never reach the store without its unread
        // mark, or the next run would see it as unchanged
        let incoming = self.cache.pending_changes(&records);
        let newly_unread = self.overlay.mark_unread_many(&incoming).await?;
        let report = self.cache.put_many(records).await?;
        self.cache.store().write_many(SUBSCRIPTIONS, &sets).await?;

        let unread = self.cache.unread_count();
        self.bus.publish(Event::UnreadCountChanged { unread });
        log::info!(
            "Sync done: {fetched} fetched, {} changed, {newly_unread} newly unread, {unread} unread",
            report.changed.len()
        );

        if !self.first_run_done.swap(true, Ordering::SeqCst) {
            self.notify_unread();
            let requests = sets
                .iter()
                .find(|(name, _)| name == REQUESTS)
                .map_or(0, |(_, ids)| ids.len());
            self.notify_requests(requests);
        }

        Ok(SyncReport {
            fetched,
            changed: report.changed.len(),
            newly_unread,
            unread,
        })
    }

    fn notify_unread(&self) {
        if let Some((title, body)) = unread_summary(&self.cache.all()) {
            self.notify(title, body, Route::inbox());
        }
    }

    fn notify_requests(&self, count: usize) {
        if let Some((title, body)) = requests_summary(count) {
            self.notify(title, body, Route::home(REQUESTS));
        }
    }

    /// Show a notification; clicking it moves the location bar to `target`.
    fn notify(&self, title: String, body: String, target: Route) {
        if !self.settings.show_desktop_notifications {
            return;
        }
        let notifier = self.notifier.clone();
        let location = self.location.clone();
        let pending = tokio::spawn(async move {
            if notifier.notify(&title, &body).await {
                location.push(&target.path(), &target.params());
            }
        });

        let mut notifications = self.notifications.lock();
        notifications.retain(|n| !n.is_finished());
        notifications.push(pending);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::future::BoxFuture;
    use futures::FutureExt;

    use super::*;
    use crate::bus::Topic;
    use crate::core::models::fixtures::{at, record};
    use crate::core::models::AnnotationPatch;
    use crate::core::error::StoreError;
    use crate::core::store::{
        account_upgrade, SchemaUpgrade, StoreHandle, ACCOUNT_SCHEMA_VERSION, RECORDS,
    };

    struct SetSource {
        sets: Mutex<HashMap<String, Vec<Record>>>,
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    impl DataSource for SetSource {
        fn fetch_record(&self, _id: RecordId) -> BoxFuture<'static, Result<Record, FetchError>> {
            async { Err(FetchError::NotFound) }.boxed()
        }

        fn fetch_subscribed(&self, set: &str) -> BoxFuture<'static, Result<Vec<Record>, FetchError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = if self.fail.load(Ordering::SeqCst) {
                Err(FetchError::Transport("timed out".into()))
            } else {
                Ok(self.sets.lock().get(set).cloned().unwrap_or_default())
            };
            async move { result }.boxed()
        }
    }

    struct ClickingNotifier {
        shown: Mutex<Vec<(String, String)>>,
    }

    impl Notifier for ClickingNotifier {
        fn notify(&self, title: &str, body: &str) -> BoxFuture<'static, bool> {
            self.shown.lock().push((title.to_string(), body.to_string()));
            async { true }.boxed()
        }
    }

    #[derive(Default)]
    struct Location {
        pushed: Mutex<Vec<String>>,
    }

    impl LocationBar for Location {
        fn push(&self, path: &str, _params: &[(String, String)]) {
            self.pushed.lock().push(path.to_string());
        }
    }

    struct Harness {
        sync: SyncScheduler,
        cache: RecordCache,
        overlay: AnnotationOverlay,
        source: Arc<SetSource>,
        notifier: Arc<ClickingNotifier>,
        location: Arc<Location>,
        connectivity: Connectivity,
        unread_events: Arc<Mutex<Vec<usize>>>,
    }

    fn harness(notifications: bool, interval: Duration) -> Harness {
        harness_with(notifications, interval, &["cc", "assigned"], account_upgrade)
    }

    fn harness_with(
        notifications: bool,
        interval: Duration,
        subscriptions: &[&str],
        upgrade: fn(&SchemaUpgrade<'_>) -> Result<(), StoreError>,
    ) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = StoreHandle::open_in_memory(ACCOUNT_SCHEMA_VERSION, upgrade).unwrap();
        let bus = EventBus::new();
        let connectivity = Connectivity::new(true);
        let cache = RecordCache::new(store, bus.clone(), connectivity.clone());
        let overlay = AnnotationOverlay::new(cache.clone());
        let source = Arc::new(SetSource {
            sets: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        });
        let notifier = Arc::new(ClickingNotifier {
            shown: Mutex::new(Vec::new()),
        });
        let location = Arc::new(Location::default());

        let unread_events = Arc::new(Mutex::new(Vec::new()));
        let sink = unread_events.clone();
        let owner = bus.register_owner();
        bus.subscribe(owner, Topic::UnreadCountChanged, move |e| {
            if let Event::UnreadCountChanged { unread } = e {
                sink.lock().push(*unread);
            }
        });

        let sync = SyncScheduler::new(
            cache.clone(),
            overlay.clone(),
            source.clone(),
            bus,
            connectivity.clone(),
            notifier.clone(),
            location.clone(),
            SyncSettings {
                interval,
                subscriptions: subscriptions.iter().map(|s| s.to_string()).collect(),
                show_desktop_notifications: notifications,
            },
        );
        Harness {
            sync,
            cache,
            overlay,
            source,
            notifier,
            location,
            connectivity,
            unread_events,
        }
    }

    fn set(h: &Harness, name: &str, records: Vec<Record>) {
        h.source.sets.lock().insert(name.to_string(), records);
    }

    #[tokio::test]
    async fn run_marks_new_and_changed_unread_once() {
        let h = harness(false, Duration::from_secs(600));
        set(&h, "cc", vec![record(1, "one"), record(2, "two")]);
        set(&h, "assigned", vec![record(2, "two")]);

        let report = h.sync.run_once().await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.unread, 2);
        assert_eq!(*h.unread_events.lock(), vec![2]);

        h.overlay.set(1, AnnotationPatch::unread(false)).await.unwrap();
        h.overlay.set(2, AnnotationPatch::unread(false)).await.unwrap();

        let mut changed = record(2, "two, updated");
        changed.last_change_time = at(20);
        set(&h, "cc", vec![record(1, "one"), changed]);
        let report = h.sync.run_once().await.unwrap();
        assert_eq!(report.changed, 1);
        assert_eq!(report.newly_unread, 1);
        assert!(!h.cache.get(1).unwrap().unread());
        assert!(h.cache.get(2).unwrap().unread());
    }

    #[tokio::test]
    async fn subscription_sets_are_saved() {
        let h = harness(false, Duration::from_secs(600));
        set(&h, "cc", vec![record(4, "four"), record(5, "five")]);
        h.sync.run_once().await.unwrap();
        let ids: Option<Vec<RecordId>> = h.cache.store().read(SUBSCRIPTIONS, "cc").await.unwrap();
        assert_eq!(ids, Some(vec![4, 5]));
    }

    #[tokio::test]
    async fn failure_leaves_cache_untouched() {
        let h = harness(false, Duration::from_secs(600));
        h.cache.put(record(1, "one")).await.unwrap();
        h.source.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            h.sync.run_once().await,
            Err(FetchError::Transport(_))
        ));
        assert_eq!(h.cache.len(), 1);
        assert!(h.unread_events.lock().is_empty());
    }

    #[tokio::test]
    async fn records_are_not_stored_when_unread_flags_fail() {
        fn without_annotations(up: &SchemaUpgrade<'_>) -> Result<(), StoreError> {
            up.create_table(RECORDS)?;
            up.create_table(SUBSCRIPTIONS)
        }
        let h = harness_with(false, Duration::from_secs(600), &["cc"], without_annotations);
        set(&h, "cc", vec![record(1, "one")]);

        assert!(matches!(h.sync.run_once().await, Err(FetchError::Storage(_))));
        assert!(h.cache.is_empty());
        let stored: Option<Record> = h.cache.store().read(RECORDS, "1").await.unwrap();
        assert!(stored.is_none());
        assert!(h.unread_events.lock().is_empty());
    }

    #[tokio::test]
    async fn first_run_announces_requests() {
        let h = harness_with(true, Duration::from_secs(600), &["cc", "requests"], account_upgrade);
        set(&h, "requests", vec![record(3, "three"), record(4, "four")]);
        h.sync.run_once().await.unwrap();

        while h.location.pushed.lock().len() < 2 {
            tokio::task::yield_now().await;
        }
        let shown = h.notifier.shown.lock().clone();
        assert!(shown.contains(&(
            "You have 2 requests".to_string(),
            "Select the Requests folder to browse those bugs.".to_string()
        )));
        assert!(shown.contains(&(
            "You have 2 unread bugs".to_string(),
            "3 - three\n4 - four".to_string()
        )));
        let mut pushed = h.location.pushed.lock().clone();
        pushed.sort();
        assert_eq!(pushed, vec!["/home/inbox".to_string(), "/home/requests".to_string()]);
    }

    #[tokio::test]
    async fn offline_skips_without_fetching() {
        let h = harness(false, Duration::from_secs(600));
        h.connectivity.set_online(false);
        assert_eq!(h.sync.run_once().await, Err(FetchError::Offline));
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn first_run_notifies_and_click_opens_inbox() {
        let h = harness(true, Duration::from_secs(600));
        set(&h, "cc", vec![record(1, "one")]);
        h.sync.run_once().await.unwrap();
        h.sync.run_once().await.unwrap();

        while h.location.pushed.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            *h.notifier.shown.lock(),
            vec![("You have 1 unread bug".to_string(), "1 - one".to_string())]
        );
        assert_eq!(*h.location.pushed.lock(), vec!["/home/inbox".to_string()]);
    }

    #[tokio::test]
    async fn notifications_can_be_disabled() {
        let h = harness(false, Duration::from_secs(600));
        set(&h, "cc", vec![record(1, "one")]);
        h.sync.run_once().await.unwrap();
        assert!(h.notifier.shown.lock().is_empty());
    }

    async fn wait_for_calls(source: &SetSource, n: usize) {
        while source.calls.load(Ordering::SeqCst) < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_runs_immediately_and_on_reconnect() {
        let h = harness(false, Duration::from_secs(600));
        h.sync.start();
        assert!(h.sync.is_running());

        // Two subscriptions per run
        wait_for_calls(&h.source, 2).await;

        h.connectivity.set_online(false);
        h.connectivity.set_online(true);
        wait_for_calls(&h.source, 4).await;

        tokio::time::sleep(Duration::from_secs(601)).await;
        wait_for_calls(&h.source, 6).await;
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 6);

        h.sync.stop();
        assert!(!h.sync.is_running());
        tokio::time::sleep(Duration::from_secs(1200)).await;
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 6);
    }
}
