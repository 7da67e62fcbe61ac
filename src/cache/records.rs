use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;

use super::CachedRecord;
use crate::bus::{Event, EventBus};
use crate::core::connectivity::Connectivity;
use crate::core::error::{FetchError, StoreError};
use crate::core::models::{Annotation, Record, RecordId};
use crate::core::store::{StoreHandle, ANNOTATIONS, RECORDS};

type PendingFetch = Shared<BoxFuture<'static, Result<Arc<CachedRecord>, FetchError>>>;

/// Both maps live behind one lock so a put and an annotation change on the
/// same ID can never interleave into a stale merge.
#[derive(Default)]
struct CacheState {
    entries: HashMap<RecordId, Arc<CachedRecord>>,
    annotations: HashMap<RecordId, Annotation>,
}

struct CacheInner {
    state: Mutex<CacheState>,
    in_flight: Mutex<HashMap<RecordId, PendingFetch>>,
    // Held from the freshness check until the row is written and merged, so
    // store rows land in the same order as the in-memory state changes
    persist: tokio::sync::Mutex<()>,
    store: StoreHandle,
    bus: EventBus,
    connectivity: Connectivity,
}

/// Result of a bulk put.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PutReport {
    /// New records plus records whose remote fields changed.
    pub changed: Vec<RecordId>,
    pub unchanged: usize,
    /// Incoming copies older than what is cached; ignored.
    pub stale: usize,
}

enum Merge {
    Inserted(Arc<CachedRecord>),
    Changed(Arc<CachedRecord>),
    Unchanged(Arc<CachedRecord>),
    Stale(Arc<CachedRecord>),
}

#[derive(Clone)]
pub struct RecordCache {
    inner: Arc<CacheInner>,
}

impl RecordCache {
    pub fn new(store: StoreHandle, bus: EventBus, connectivity: Connectivity) -> Self {
        RecordCache {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState::default()),
                in_flight: Mutex::new(HashMap::new()),
                persist: tokio::sync::Mutex::new(()),
                store,
                bus,
                connectivity,
            }),
        }
    }

    /// Load persisted records and annotations into memory. Called once at
    /// session start, before any tab asks for data.
    pub async fn hydrate(&self) -> Result<usize, StoreError> {
        let records: Vec<(String, Record)> = self.inner.store.read_all(RECORDS).await?;
        let annotations: Vec<(String, Annotation)> =
            self.inner.store.read_all(ANNOTATIONS).await?;

        let mut state = self.inner.state.lock();
        for (key, annotation) in annotations {
            match key.parse::<RecordId>() {
                Ok(id) => {
                    state.annotations.insert(id, annotation);
                }
                Err(_) => log::warn!("Ignoring annotation with bad key {key:?}"),
            }
        }
        let count = records.len();
        for (_, record) in records {
            let annotation = state
                .annotations
                .get(&record.id)
                .cloned()
                .unwrap_or_default();
            state
                .entries
                .insert(record.id, Arc::new(CachedRecord::new(record, annotation)));
        }
        log::info!(
            "Cache hydrated: {} records, {} annotations",
            count,
            state.annotations.len()
        );
        Ok(count)
    }

    pub fn get(&self, id: RecordId) -> Option<Arc<CachedRecord>> {
        self.inner.state.lock().entries.get(&id).cloned()
    }

    /// Snapshot of every cached record, ordered by ID.
    pub fn all(&self) -> Vec<Arc<CachedRecord>> {
        let mut all: Vec<_> = self.inner.state.lock().entries.values().cloned().collect();
        all.sort_by_key(|r| r.id());
        all
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unread_count(&self) -> usize {
        self.all().iter().filter(|r| r.unread()).count()
    }

    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    /// Cached instance if present, otherwise fetch it. Concurrent callers for
    /// the same ID share one fetch and receive the same `Arc`.
    ///
    /// `fetch` is called with the cache's in-flight lock held; it must only
    /// build the future, not touch the cache.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        id: RecordId,
        fetch: F,
    ) -> Result<Arc<CachedRecord>, FetchError>
    where
        F: FnOnce(RecordId) -> Fut,
        Fut: Future<Output = Result<Record, FetchError>> + Send + 'static,
    {
        if let Some(hit) = self.get(id) {
            log::debug!("Cache hit for bug {id}");
            return Ok(hit);
        }

        let pending = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&id) {
                Some(pending) => {
                    log::debug!("Joining in-flight fetch for bug {id}");
                    pending.clone()
                }
                None => {
                    // A fetch may have landed between the first lookup and the lock
                    if let Some(hit) = self.get(id) {
                        return Ok(hit);
                    }
                    if !self.is_online() {
                        log::debug!("Offline, not fetching bug {id}");
                        return Err(FetchError::Offline);
                    }
                    log::debug!("Cache miss for bug {id}, fetching");
                    let pending = self.spawn_fetch(id, fetch(id));
                    in_flight.insert(id, pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    /// Drive the fetch on its own task so it completes (and lands in the cache)
    /// even if every waiter goes away.
    fn spawn_fetch<Fut>(&self, id: RecordId, fut: Fut) -> PendingFetch
    where
        Fut: Future<Output = Result<Record, FetchError>> + Send + 'static,
    {
        let cache = self.clone();
        let handle = tokio::spawn(async move {
            let result = match fut.await {
                Ok(record) => cache.put(record).await.map_err(FetchError::from),
                Err(e) => {
                    log::warn!("Fetch of bug {id} failed: {e}");
                    Err(e)
                }
            };
            cache.inner.in_flight.lock().remove(&id);
            result
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(FetchError::Transport(format!("fetch task failed: {e}"))))
        }
        .boxed()
        .shared()
    }

    /// Insert or replace the remote-origin part of a record, persist it, and
    /// publish `RecordUpdated` when something actually changed.
    pub async fn put(&self, record: Record) -> Result<Arc<CachedRecord>, StoreError> {
        let persist = self.inner.persist.lock().await;
        if let Some(existing) = self.get(record.id) {
            if record.last_change_time < existing.last_change_time() {
                log::debug!("Ignoring stale copy of bug {}", record.id);
                return Ok(existing);
            }
            if existing.same_record(&record) {
                return Ok(existing);
            }
        }

        self.inner
            .store
            .write(RECORDS, &record.id.to_string(), &record)
            .await?;

        let merged = self.merge_in(record);
        drop(persist);

        let cached = match merged {
            Merge::Inserted(cached) | Merge::Changed(cached) => {
                self.inner.bus.publish(Event::RecordUpdated {
                    record: cached.clone(),
                });
                cached
            }
            Merge::Unchanged(cached) | Merge::Stale(cached) => cached,
        };
        Ok(cached)
    }

    /// Put a batch in one store transaction. Used by background sync.
    pub async fn put_many(&self, records: Vec<Record>) -> Result<PutReport, StoreError> {
        let persist = self.inner.persist.lock().await;
        let mut report = PutReport::default();
        let mut fresh = Vec::with_capacity(records.len());
        for record in records {
            match self.get(record.id) {
                Some(existing) if record.last_change_time < existing.last_change_time() => {
                    report.stale += 1;
                }
                Some(existing) if existing.same_record(&record) => {
                    report.unchanged += 1;
                }
                _ => fresh.push(record),
            }
        }

        if fresh.is_empty() {
            return Ok(report);
        }

        let rows: Vec<(String, &Record)> = fresh.iter().map(|r| (r.id.to_string(), r)).collect();
        self.inner.store.write_many(RECORDS, &rows).await?;

        let merged: Vec<Merge> = fresh.into_iter().map(|r| self.merge_in(r)).collect();
        drop(persist);

        for merge in merged {
            match merge {
                Merge::Inserted(cached) | Merge::Changed(cached) => {
                    report.changed.push(cached.id());
                    self.inner.bus.publish(Event::RecordUpdated { record: cached });
                }
                Merge::Unchanged(_) => report.unchanged += 1,
                Merge::Stale(_) => report.stale += 1,
            }
        }
        Ok(report)
    }

    /// IDs in `records` that a `put_many` would insert or change right now.
    pub fn pending_changes(&self, records: &[Record]) -> Vec<RecordId> {
        let state = self.inner.state.lock();
        records
            .iter()
            .filter(|record| match state.entries.get(&record.id) {
                Some(existing) => {
                    record.last_change_time >= existing.last_change_time()
                        && !existing.same_record(record)
                }
                None => true,
            })
            .map(|record| record.id)
            .collect()
    }

    fn merge_in(&self, record: Record) -> Merge {
        let mut state = self.inner.state.lock();
        if let Some(existing) = state.entries.get(&record.id) {
            let existing = existing.clone();
            if record.last_change_time < existing.last_change_time() {
                return Merge::Stale(existing);
            }
            return if existing.replace_record(record) {
                Merge::Changed(existing)
            } else {
                Merge::Unchanged(existing)
            };
        }

        let annotation = state
            .annotations
            .get(&record.id)
            .cloned()
            .unwrap_or_default();
        let id = record.id;
        let cached = Arc::new(CachedRecord::new(record, annotation));
        state.entries.insert(id, cached.clone());
        Merge::Inserted(cached)
    }

    // -- overlay access (used by AnnotationOverlay only) ---------------------

    /// Serialises annotation writes with record writes.
    pub(crate) async fn persist_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.persist.lock().await
    }

    pub(crate) fn annotation(&self, id: RecordId) -> Annotation {
        self.inner
            .state
            .lock()
            .annotations
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Apply `f` to the stored annotation of `id` and re-merge the cached
    /// record, atomically with respect to puts. Returns (before, after).
    pub(crate) fn patch_annotation<F>(&self, id: RecordId, f: F) -> (Annotation, Annotation)
    where
        F: FnOnce(&mut Annotation, Option<&Record>),
    {
        let mut state = self.inner.state.lock();
        let entry = state.entries.get(&id).cloned();
        let before = state.annotations.get(&id).cloned().unwrap_or_default();
        let mut after = before.clone();

        match &entry {
            Some(cached) => cached.with(|record, _| f(&mut after, Some(record))),
            None => f(&mut after, None),
        }

        if after != before {
            state.annotations.insert(id, after.clone());
            if let Some(cached) = &entry {
                cached.set_annotation(after.clone());
            }
        }
        (before, after)
    }

    /// Put back the annotation a failed write was about to replace.
    pub(crate) fn restore_annotation(&self, id: RecordId, annotation: Annotation) {
        let mut state = self.inner.state.lock();
        if let Some(cached) = state.entries.get(&id) {
            cached.set_annotation(annotation.clone());
        }
        if annotation == Annotation::default() {
            state.annotations.remove(&id);
        } else {
            state.annotations.insert(id, annotation);
        }
    }

    /// Drop every annotation from memory and reset cached records' overlay.
    pub(crate) fn reset_annotations(&self) {
        let mut state = self.inner.state.lock();
        state.annotations.clear();
        for cached in state.entries.values() {
            cached.set_annotation(Annotation::default());
        }
    }

    pub(crate) fn store(&self) -> &StoreHandle {
        &self.inner.store
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.inner.bus
    }
}
