use super::RecordCache;
use crate::bus::Event;
use crate::core::error::StoreError;
use crate::core::models::{Annotation, AnnotationKind, AnnotationPatch, Record, RecordId};
use crate::core::store::ANNOTATIONS;

/// Private per-user state (unread, starred) kept apart from remote data so a
/// re-fetch never destroys it.
#[derive(Clone)]
pub struct AnnotationOverlay {
    cache: RecordCache,
}

impl AnnotationOverlay {
    pub fn new(cache: RecordCache) -> Self {
        AnnotationOverlay { cache }
    }

    /// Current annotation, or the all-false default if none was ever written.
    pub fn get(&self, id: RecordId) -> Annotation {
        self.cache.annotation(id)
    }

    /// Merge `patch` into the annotation of `id`.
    ///
    /// Starring marks the bug's first comment; unstarring clears every starred
    /// comment of the bug.
    pub async fn set(&self, id: RecordId, patch: AnnotationPatch) -> Result<Annotation, StoreError> {
        self.update(id, |annotation, record| {
            if let Some(unread) = patch.unread {
                annotation.unread = unread;
            }
            match patch.starred {
                Some(true) => match record.and_then(|r| r.first_comment_id()) {
                    Some(comment_id) => {
                        annotation.starred_comments.insert(comment_id);
                    }
                    None => log::debug!("Bug {id} has no comments to star"),
                },
                Some(false) => annotation.starred_comments.clear(),
                None => {}
            }
        })
        .await
    }

    /// Star or unstar a single comment.
    pub async fn set_comment_starred(
        &self,
        id: RecordId,
        comment_id: u64,
        starred: bool,
    ) -> Result<Annotation, StoreError> {
        self.update(id, |annotation, _| {
            if starred {
                annotation.starred_comments.insert(comment_id);
            } else {
                annotation.starred_comments.remove(&comment_id);
            }
        })
        .await
    }

    /// Flag a batch of bugs unread without per-bug events. The caller publishes
    /// one aggregated `UnreadCountChanged` afterwards.
    pub async fn mark_unread_many(&self, ids: &[RecordId]) -> Result<usize, StoreError> {
        let _persist = self.cache.persist_lock().await;
        let mut previous = Vec::new();
        let mut rows = Vec::new();
        for &id in ids {
            let (before, after) = self.cache.patch_annotation(id, |a, _| a.unread = true);
            if before != after {
                previous.push((id, before));
                rows.push((id.to_string(), after));
            }
        }
        if rows.is_empty() {
            return Ok(0);
        }
        if let Err(e) = self.cache.store().write_many(ANNOTATIONS, &rows).await {
            log::error!("Failed to persist unread flags for {} bugs: {e}", rows.len());
            for (id, before) in previous {
                self.cache.restore_annotation(id, before);
            }
            return Err(e);
        }
        Ok(rows.len())
    }

    /// Forget the annotation of one bug (explicit user action).
    pub async fn clear(&self, id: RecordId) -> Result<(), StoreError> {
        let persist = self.cache.persist_lock().await;
        let (before, after) = self.cache.patch_annotation(id, |a, _| *a = Annotation::default());
        if let Err(e) = self.cache.store().delete(ANNOTATIONS, &id.to_string()).await {
            log::error!("Failed to clear annotation of bug {id}: {e}");
            self.cache.restore_annotation(id, before);
            return Err(e);
        }
        drop(persist);
        self.publish_changes(id, &before, &after);
        Ok(())
    }

    /// Drop every annotation. Used at logout.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        let _persist = self.cache.persist_lock().await;
        self.cache.reset_annotations();
        self.cache.store().delete_all(ANNOTATIONS).await
    }

    /// Patch in memory, persist, then publish. A failed write puts the old
    /// annotation back and publishes nothing.
    async fn update<F>(&self, id: RecordId, f: F) -> Result<Annotation, StoreError>
    where
        F: FnOnce(&mut Annotation, Option<&Record>),
    {
        let persist = self.cache.persist_lock().await;
        let (before, after) = self.cache.patch_annotation(id, f);
        if before == after {
            return Ok(after);
        }
        if let Err(e) = self
            .cache
            .store()
            .write(ANNOTATIONS, &id.to_string(), &after)
            .await
        {
            log::error!("Failed to persist annotation for bug {id}: {e}");
            self.cache.restore_annotation(id, before);
            return Err(e);
        }
        drop(persist);
        self.publish_changes(id, &before, &after);
        Ok(after)
    }

    fn publish_changes(&self, id: RecordId, before: &Annotation, after: &Annotation) {
        let bus = self.cache.bus();
        if before.unread != after.unread {
            bus.publish(Event::AnnotationUpdated {
                id,
                kind: AnnotationKind::Unread,
                value: after.unread,
            });
        }
        if before.starred() != after.starred() {
            bus.publish(Event::AnnotationUpdated {
                id,
                kind: AnnotationKind::Starred,
                value: after.starred(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::bus::{EventBus, Topic};
    use crate::core::connectivity::Connectivity;
    use crate::core::models::fixtures::record;
    use crate::core::store::{
        account_upgrade, SchemaUpgrade, StoreHandle, ACCOUNT_SCHEMA_VERSION, RECORDS,
    };

    fn setup() -> (RecordCache, AnnotationOverlay) {
        let store = StoreHandle::open_in_memory(ACCOUNT_SCHEMA_VERSION, account_upgrade).unwrap();
        let cache = RecordCache::new(store, EventBus::new(), Connectivity::new(true));
        let overlay = AnnotationOverlay::new(cache.clone());
        (cache, overlay)
    }

    /// Overlay over a store whose annotation table is missing, so every
    /// annotation write fails.
    fn setup_without_annotation_table() -> (RecordCache, AnnotationOverlay) {
        let store = StoreHandle::open_in_memory(ACCOUNT_SCHEMA_VERSION, |up: &SchemaUpgrade<'_>| {
            up.create_table(RECORDS)
        })
        .unwrap();
        let cache = RecordCache::new(store, EventBus::new(), Connectivity::new(true));
        let overlay = AnnotationOverlay::new(cache.clone());
        (cache, overlay)
    }

    #[tokio::test]
    async fn failed_write_rolls_back_and_stays_quiet() {
        let (cache, overlay) = setup_without_annotation_table();
        cache.put(record(4, "four")).await.unwrap();
        let events = Arc::new(Mutex::new(0usize));
        let e = events.clone();
        let owner = cache.bus().register_owner();
        cache
            .bus()
            .subscribe(owner, Topic::AnnotationUpdated, move |_| *e.lock() += 1);

        assert!(overlay.set(4, AnnotationPatch::unread(true)).await.is_err());
        assert!(overlay.set(4, AnnotationPatch::starred(true)).await.is_err());
        assert!(overlay.mark_unread_many(&[4]).await.is_err());

        let four = cache.get(4).unwrap();
        assert!(!four.unread());
        assert!(!four.starred());
        assert_eq!(overlay.get(4), Annotation::default());
        assert_eq!(cache.unread_count(), 0);
        assert_eq!(*events.lock(), 0);
    }

    #[tokio::test]
    async fn defaults_when_absent() {
        let (_, overlay) = setup();
        let a = overlay.get(404);
        assert!(!a.unread);
        assert!(!a.starred());
    }

    #[tokio::test]
    async fn unstar_clears_every_starred_comment() {
        let (cache, overlay) = setup();
        cache.put(record(9, "nine")).await.unwrap();

        overlay.set(9, AnnotationPatch::starred(true)).await.unwrap();
        assert_eq!(overlay.get(9).starred_comments.len(), 1);
        overlay.set_comment_starred(9, 901, true).await.unwrap();
        overlay.set_comment_starred(9, 902, true).await.unwrap();
        assert_eq!(overlay.get(9).starred_comments.len(), 3);

        overlay.set(9, AnnotationPatch::starred(false)).await.unwrap();
        assert!(overlay.get(9).starred_comments.is_empty());
        assert!(!cache.get(9).unwrap().starred());
    }

    #[tokio::test]
    async fn star_marks_first_comment() {
        let (cache, overlay) = setup();
        cache.put(record(9, "nine")).await.unwrap();
        let a = overlay.set(9, AnnotationPatch::starred(true)).await.unwrap();
        assert_eq!(a.starred_comments.into_iter().collect::<Vec<_>>(), vec![900]);
    }

    #[tokio::test]
    async fn star_without_comments_is_noop() {
        let (cache, overlay) = setup();
        let mut bare = record(5, "no comments");
        bare.comments.clear();
        cache.put(bare).await.unwrap();
        let a = overlay.set(5, AnnotationPatch::starred(true)).await.unwrap();
        assert!(!a.starred());
    }

    #[tokio::test]
    async fn change_is_visible_through_every_handle() {
        let (cache, overlay) = setup();
        cache.put(record(7, "seven")).await.unwrap();
        overlay.set(7, AnnotationPatch::unread(true)).await.unwrap();

        // Tab A holds the record; tab B later reads the snapshot.
        let tab_a = cache.get(7).unwrap();
        overlay.set(7, AnnotationPatch::unread(false)).await.unwrap();
        assert!(!tab_a.unread());

        let tab_b = cache.all();
        let seven = tab_b.iter().find(|r| r.id() == 7).unwrap();
        assert!(!seven.unread());
    }

    #[tokio::test]
    async fn refetch_keeps_overlay() {
        let (cache, overlay) = setup();
        cache.put(record(3, "three")).await.unwrap();
        overlay.set(3, AnnotationPatch::unread(true)).await.unwrap();

        let mut newer = record(3, "three v2");
        newer.last_change_time = crate::core::models::fixtures::at(10);
        cache.put(newer).await.unwrap();

        assert!(cache.get(3).unwrap().unread());
        assert!(overlay.get(3).unread);
    }

    #[tokio::test]
    async fn annotation_before_record_is_merged_on_insert() {
        let (cache, overlay) = setup();
        overlay.set(11, AnnotationPatch::unread(true)).await.unwrap();
        let cached = cache.put(record(11, "late")).await.unwrap();
        assert!(cached.unread());
    }

    #[tokio::test]
    async fn emits_one_event_per_changed_kind() {
        let (cache, overlay) = setup();
        cache.put(record(2, "two")).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let owner = cache.bus().register_owner();
        cache.bus().subscribe(owner, Topic::AnnotationUpdated, move |e| {
            if let Event::AnnotationUpdated { id, kind, value } = e {
                s.lock().push((*id, *kind, *value));
            }
        });

        overlay
            .set(
                2,
                AnnotationPatch {
                    unread: Some(true),
                    starred: Some(true),
                },
            )
            .await
            .unwrap();
        overlay.set(2, AnnotationPatch::unread(true)).await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                (2, AnnotationKind::Unread, true),
                (2, AnnotationKind::Starred, true)
            ]
        );
    }

    #[tokio::test]
    async fn persisted_and_restored() {
        let (cache, overlay) = setup();
        cache.put(record(6, "six")).await.unwrap();
        overlay.set(6, AnnotationPatch::unread(true)).await.unwrap();

        let stored: Option<Annotation> = cache.store().read(ANNOTATIONS, "6").await.unwrap();
        assert!(stored.unwrap().unread);
    }

    #[tokio::test]
    async fn mark_unread_many_is_quiet() {
        let (cache, overlay) = setup();
        cache.put(record(1, "one")).await.unwrap();
        cache.put(record(2, "two")).await.unwrap();
        overlay.set(2, AnnotationPatch::unread(true)).await.unwrap();

        let events = Arc::new(Mutex::new(0usize));
        let e = events.clone();
        let owner = cache.bus().register_owner();
        cache
            .bus()
            .subscribe(owner, Topic::AnnotationUpdated, move |_| *e.lock() += 1);

        assert_eq!(overlay.mark_unread_many(&[1, 2]).await.unwrap(), 1);
        assert_eq!(*events.lock(), 0);
        assert_eq!(cache.unread_count(), 2);
    }

    #[tokio::test]
    async fn clear_all_resets_memory_and_store() {
        let (cache, overlay) = setup();
        cache.put(record(1, "one")).await.unwrap();
        overlay.set(1, AnnotationPatch::unread(true)).await.unwrap();
        overlay.clear_all().await.unwrap();
        assert!(!cache.get(1).unwrap().unread());
        let rows = cache.store().read_all::<Annotation>(ANNOTATIONS).await.unwrap();
        assert!(rows.is_empty());
    }
}
