//! Identity-stable record cache and the private annotation overlay merged on
//! top of it.

mod annotations;
mod records;

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::core::models::{Annotation, Record, RecordId, RecordView};

pub use annotations::AnnotationOverlay;
pub use records::{PutReport, RecordCache};

/// Record ⊕ Annotation. One instance exists per ID; every tab holds the same
/// `Arc`, so overlay changes made in one tab are visible everywhere.
pub struct CachedRecord {
    id: RecordId,
    state: RwLock<RecordView>,
}

/// Pure merge of remote data and private overlay.
pub fn merge(record: Record, annotation: Annotation) -> RecordView {
    RecordView { record, annotation }
}

impl CachedRecord {
    pub(crate) fn new(record: Record, annotation: Annotation) -> Self {
        CachedRecord {
            id: record.id,
            state: RwLock::new(merge(record, annotation)),
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Owned copy of the current merged state.
    pub fn view(&self) -> RecordView {
        self.state.read().clone()
    }

    /// Borrow the merged state without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&Record, &Annotation) -> R) -> R {
        let state = self.state.read();
        f(&state.record, &state.annotation)
    }

    pub fn record(&self) -> Record {
        self.state.read().record.clone()
    }

    pub fn annotation(&self) -> Annotation {
        self.state.read().annotation.clone()
    }

    pub fn summary(&self) -> String {
        self.state.read().record.summary.clone()
    }

    pub fn last_change_time(&self) -> DateTime<Utc> {
        self.state.read().record.last_change_time
    }

    pub fn unread(&self) -> bool {
        self.state.read().annotation.unread
    }

    pub fn starred(&self) -> bool {
        self.state.read().annotation.starred()
    }

    /// Swap in new remote-origin fields, keeping the overlay. Returns false when
    /// the incoming record is identical.
    pub(crate) fn replace_record(&self, record: Record) -> bool {
        let mut state = self.state.write();
        if state.record == record {
            return false;
        }
        let annotation = std::mem::take(&mut state.annotation);
        *state = merge(record, annotation);
        true
    }

    pub(crate) fn same_record(&self, record: &Record) -> bool {
        self.state.read().record == *record
    }

    pub(crate) fn set_annotation(&self, annotation: Annotation) {
        self.state.write().annotation = annotation;
    }
}

impl fmt::Debug for CachedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("CachedRecord")
            .field("id", &self.id)
            .field("summary", &state.record.summary)
            .field("unread", &state.annotation.unread)
            .field("starred", &state.annotation.starred())
            .finish()
    }
}
