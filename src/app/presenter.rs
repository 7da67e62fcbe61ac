use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;

use super::DataSource;
use crate::bus::{Event, EventBus, OwnerId, Topic};
use crate::cache::{CachedRecord, RecordCache};
use crate::core::error::FetchError;
use crate::core::models::RecordId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    NotFound,
    Offline,
}

/// Events a presenter publishes on `Topic::Presenter(owner)`.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    LoadingStarted { id: RecordId },
    Available { record: Arc<CachedRecord> },
    Unavailable { id: RecordId, reason: UnavailableReason },
    Error { id: RecordId, message: String },
    /// Always follows the single terminal event of an activation.
    LoadingComplete,
    /// The displayed record changed after it became available (remote
    /// update or annotation change).
    Updated { record: Arc<CachedRecord> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterState {
    Idle,
    Loading,
    Available,
    Unavailable,
    Error,
}

/// Drives one view: loads a record, reports the outcome over the bus, and
/// forwards later changes of that record.
pub trait Presenter: Send + Sync {
    fn owner(&self) -> OwnerId;

    fn state(&self) -> PresenterState;

    /// Record of the current activation, if any.
    fn record_id(&self) -> Option<RecordId>;

    /// Start loading `id`. The returned future resolves to the terminal state
    /// once `LoadingComplete` has been published.
    fn activate(&self, id: RecordId) -> BoxFuture<'static, PresenterState>;

    /// Drop every subscription. Results still in flight are ignored.
    fn teardown(&self);
}

struct Activation {
    generation: u64,
    torn_down: bool,
    state: PresenterState,
    record_id: Option<RecordId>,
    // Owns the RecordUpdated/AnnotationUpdated subscriptions of the current record
    record_owner: Option<OwnerId>,
}

struct PresenterInner {
    owner: OwnerId,
    bus: EventBus,
    cache: RecordCache,
    source: Arc<dyn DataSource>,
    activation: Mutex<Activation>,
}

#[derive(Clone)]
pub struct RecordPresenter {
    inner: Arc<PresenterInner>,
}

impl RecordPresenter {
    pub fn new(bus: EventBus, cache: RecordCache, source: Arc<dyn DataSource>) -> Self {
        let owner = bus.register_owner();
        RecordPresenter {
            inner: Arc::new(PresenterInner {
                owner,
                bus,
                cache,
                source,
                activation: Mutex::new(Activation {
                    generation: 0,
                    torn_down: false,
                    state: PresenterState::Idle,
                    record_id: None,
                    record_owner: None,
                }),
            }),
        }
    }
}

impl PresenterInner {
    fn emit(&self, event: LifecycleEvent) {
        self.bus.publish(Event::Lifecycle {
            presenter: self.owner,
            event,
        });
    }

    /// Forward changes of `id` while this activation stays current.
    fn watch_record(self: &Arc<Self>, id: RecordId, generation: u64) -> OwnerId {
        let record_owner = self.bus.register_owner();

        self.bus.subscribe_safe(
            record_owner,
            Topic::RecordUpdated,
            self,
            move |this: &PresenterInner, event| {
                if let Event::RecordUpdated { record } = event {
                    if record.id() == id && this.is_current(generation) {
                        this.emit(LifecycleEvent::Updated {
                            record: record.clone(),
                        });
                    }
                }
            },
        );

        self.bus.subscribe_safe(
            record_owner,
            Topic::AnnotationUpdated,
            self,
            move |this: &PresenterInner, event| {
                if let Event::AnnotationUpdated { id: changed, .. } = event {
                    if *changed != id || !this.is_current(generation) {
                        return;
                    }
                    if let Some(record) = this.cache.get(id) {
                        this.emit(LifecycleEvent::Updated { record });
                    }
                }
            },
        );

        record_owner
    }

    fn is_current(&self, generation: u64) -> bool {
        let a = self.activation.lock();
        !a.torn_down && a.generation == generation
    }

    async fn run(self: Arc<Self>, id: RecordId) -> PresenterState {
        let generation = {
            let mut a = self.activation.lock();
            if a.torn_down {
                log::debug!("Presenter {:?} is torn down, not loading bug {id}", self.owner);
                return PresenterState::Idle;
            }
            a.generation += 1;
            if let Some(previous) = a.record_owner.take() {
                self.bus.unsubscribe_all(previous);
            }
            a.state = PresenterState::Loading;
            a.record_id = Some(id);
            a.generation
        };
        self.emit(LifecycleEvent::LoadingStarted { id });

        let source = self.source.clone();
        let result = self
            .cache
            .get_or_fetch(id, move |id| source.fetch_record(id))
            .await;

        let (state, terminal) = match result {
            Ok(record) => (PresenterState::Available, LifecycleEvent::Available { record }),
            Err(FetchError::NotFound) => (
                PresenterState::Unavailable,
                LifecycleEvent::Unavailable {
                    id,
                    reason: UnavailableReason::NotFound,
                },
            ),
            Err(FetchError::Offline) => (
                PresenterState::Unavailable,
                LifecycleEvent::Unavailable {
                    id,
                    reason: UnavailableReason::Offline,
                },
            ),
            Err(e) => {
                log::warn!("Loading bug {id} failed: {e}");
                (
                    PresenterState::Error,
                    LifecycleEvent::Error {
                        id,
                        message: e.to_string(),
                    },
                )
            }
        };

        {
            let mut a = self.activation.lock();
            if a.torn_down || a.generation != generation {
                log::debug!("Discarding late result for bug {id}");
                return a.state;
            }
            a.state = state;
            if state == PresenterState::Available {
                a.record_owner = Some(self.watch_record(id, generation));
            }
        }

        self.emit(terminal);
        self.emit(LifecycleEvent::LoadingComplete);
        state
    }
}

impl Presenter for RecordPresenter {
    fn owner(&self) -> OwnerId {
        self.inner.owner
    }

    fn state(&self) -> PresenterState {
        self.inner.activation.lock().state
    }

    fn record_id(&self) -> Option<RecordId> {
        self.inner.activation.lock().record_id
    }

    fn activate(&self, id: RecordId) -> BoxFuture<'static, PresenterState> {
        self.inner.clone().run(id).boxed()
    }

    fn teardown(&self) {
        let record_owner = {
            let mut a = self.inner.activation.lock();
            a.torn_down = true;
            a.state = PresenterState::Idle;
            a.record_owner.take()
        };
        if let Some(record_owner) = record_owner {
            self.inner.bus.unsubscribe_all(record_owner);
        }
        self.inner.bus.unsubscribe_all(self.inner.owner);
    }
}
