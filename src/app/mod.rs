//! Session wiring: collaborator traits, the tab navigator, presenters and
//! background sync, composed per logged-in account.

pub mod navigation;
pub mod notify;
pub mod presenter;
pub mod router;
pub mod sync;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::bus::{Event, EventBus, OwnerId, SubscriptionId, Topic};
use crate::cache::{AnnotationOverlay, RecordCache};
use crate::config::Config;
use crate::core::connectivity::Connectivity;
use crate::core::error::{FetchError, SessionError, StoreError};
use crate::core::models::{AnnotationKind, AnnotationPatch, Record, RecordId};
use crate::core::store::{account_upgrade, StoreHandle, ACCOUNT_SCHEMA_VERSION};

use navigation::{NavError, OpenContext, TabId, TabNavigator};
use notify::Notifier;
use presenter::{LifecycleEvent, Presenter, RecordPresenter};
use sync::{SyncReport, SyncScheduler, SyncSettings};

/// Remote tracker access.
pub trait DataSource: Send + Sync {
    fn fetch_record(&self, id: RecordId) -> BoxFuture<'static, Result<Record, FetchError>>;

    /// Records of a named subscription set ("cc", "assigned", ...).
    fn fetch_subscribed(&self, set: &str) -> BoxFuture<'static, Result<Vec<Record>, FetchError>>;
}

/// Renders one tab. Fed the lifecycle events of the tab's presenter.
pub trait View: Send + Sync {
    fn on_lifecycle(&self, event: &LifecycleEvent);
}

/// The URL surface. Navigation pushes here; external changes come back via
/// [`TabNavigator::on_location_changed`].
pub trait LocationBar: Send + Sync {
    fn push(&self, path: &str, params: &[(String, String)]);
}

/// Everything that lives between login and logout.
pub struct Session {
    config: Config,
    bus: EventBus,
    owner: OwnerId,
    connectivity: Connectivity,
    cache: RecordCache,
    overlay: AnnotationOverlay,
    navigator: TabNavigator,
    sync: SyncScheduler,
}

impl Session {
    /// Open the account database under the data dir and bring the session up.
    pub async fn start(
        config: Config,
        source: Arc<dyn DataSource>,
        notifier: Arc<dyn Notifier>,
        location: Arc<dyn LocationBar>,
    ) -> Result<Self, SessionError> {
        let dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bugdeck");
        Self::start_in(&dir, config, source, notifier, location).await
    }

    /// Same as [`Session::start`] with the database kept in `dir`.
    pub async fn start_in(
        dir: &Path,
        config: Config,
        source: Arc<dyn DataSource>,
        notifier: Arc<dyn Notifier>,
        location: Arc<dyn LocationBar>,
    ) -> Result<Self, SessionError> {
        if config.server.is_empty() || config.username.is_empty() {
            return Err(SessionError::Config("server and username are required".into()));
        }

        let store = StoreHandle::open_in(
            dir,
            &config.account_name(),
            ACCOUNT_SCHEMA_VERSION,
            account_upgrade,
        )
        .map_err(|e| {
            log::error!("Cannot open account database: {e}");
            SessionError::StorageUnavailable(e)
        })?;

        let bus = EventBus::new();
        let connectivity = Connectivity::new(true);
        let cache = RecordCache::new(store, bus.clone(), connectivity.clone());
        cache.hydrate().await.map_err(SessionError::StorageUnavailable)?;
        let overlay = AnnotationOverlay::new(cache.clone());

        let owner = bus.register_owner();
        {
            let cache = cache.clone();
            let republish = bus.clone();
            bus.subscribe(owner, Topic::AnnotationUpdated, move |event| {
                if let Event::AnnotationUpdated {
                    kind: AnnotationKind::Unread,
                    ..
                } = event
                {
                    republish.publish(Event::UnreadCountChanged {
                        unread: cache.unread_count(),
                    });
                }
            });
        }

        let navigator = {
            let bus = bus.clone();
            let cache = cache.clone();
            let source = source.clone();
            TabNavigator::new(
                bus.clone(),
                location.clone(),
                Box::new(move || {
                    Arc::new(RecordPresenter::new(bus.clone(), cache.clone(), source.clone()))
                        as Arc<dyn Presenter>
                }),
            )
        };

        let sync = SyncScheduler::new(
            cache.clone(),
            overlay.clone(),
            source,
            bus.clone(),
            connectivity.clone(),
            notifier,
            location,
            SyncSettings {
                interval: config.sync_interval,
                subscriptions: config.subscriptions.clone(),
                show_desktop_notifications: config.show_desktop_notifications,
            },
        );
        sync.start();

        log::info!("Session started for {}", config.account_name());
        Ok(Session {
            config,
            bus,
            owner,
            connectivity,
            cache,
            overlay,
            navigator,
            sync,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    pub fn overlay(&self) -> &AnnotationOverlay {
        &self.overlay
    }

    pub fn navigator(&self) -> &TabNavigator {
        &self.navigator
    }

    pub fn unread_count(&self) -> usize {
        self.cache.unread_count()
    }

    pub async fn open_record(&self, ctx: OpenContext) -> TabId {
        self.navigator.open(ctx).await
    }

    pub fn close_tab(&self, tab: TabId) -> bool {
        self.navigator.close(tab)
    }

    /// Route the lifecycle events of `tab`'s presenter to `view`. The
    /// subscription lapses on its own once the view is dropped.
    pub fn attach_view(&self, tab: TabId, view: &Arc<dyn View>) -> Result<SubscriptionId, NavError> {
        let presenter = self.navigator.presenter(tab).ok_or(NavError::UnknownTab)?;
        Ok(self.bus.subscribe_safe(
            presenter.owner(),
            Topic::Presenter(presenter.owner()),
            view,
            |view, event| {
                if let Event::Lifecycle { event, .. } = event {
                    view.on_lifecycle(event);
                }
            },
        ))
    }

    pub async fn mark_read(&self, id: RecordId, read: bool) -> Result<(), StoreError> {
        self.overlay.set(id, AnnotationPatch::unread(!read)).await.map(|_| ())
    }

    pub async fn set_starred(&self, id: RecordId, starred: bool) -> Result<(), StoreError> {
        self.overlay
            .set(id, AnnotationPatch::starred(starred))
            .await
            .map(|_| ())
    }

    /// Record a connectivity change. Coming back online triggers a sync.
    pub fn set_online(&self, online: bool) {
        if self.connectivity.set_online(online) {
            log::info!("Connectivity changed: {}", if online { "online" } else { "offline" });
            self.bus.publish(Event::ConnectivityChanged { online });
        }
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub async fn sync_now(&self) -> Result<SyncReport, FetchError> {
        self.sync.run_once().await
    }

    /// Stop background work, close every tab and forget private annotations.
    pub async fn logout(self) -> Result<(), StoreError> {
        self.sync.stop();
        self.navigator.close_all();
        let cleared = self.overlay.clear_all().await;
        self.bus.unsubscribe_all(self.owner);
        log::info!("Logged out of {}", self.config.account_name());
        cleared
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.sync.stop();
        self.navigator.close_all();
        // The unread hook holds a clone of the bus
        self.bus.unsubscribe_all(self.owner);
    }
}
