use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric bug ID assigned by the remote tracker.
pub type RecordId = u64;

/// A bug as served by the remote tracker. Only the sync path and foreground
/// fetches replace these fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub summary: String,
    pub status: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub assigned_to: String,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub last_change_time: DateTime<Utc>,
}

impl Record {
    /// Everyone involved in the bug, creator first, without duplicates.
    pub fn participants(&self) -> Vec<String> {
        let mut people: Vec<String> = Vec::new();
        let candidates = [&self.creator, &self.assigned_to]
            .into_iter()
            .chain(self.cc.iter());
        for person in candidates {
            if !person.is_empty() && !people.contains(person) {
                people.push(person.clone());
            }
        }
        people
    }

    /// ID of the initial comment (the bug description), if any.
    pub fn first_comment_id(&self) -> Option<u64> {
        self.comments.first().map(|c| c.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub creator: String,
    pub text: String,
    pub creation_time: DateTime<Utc>,
    #[serde(default)]
    pub is_markdown: bool,
}

/// One entry of a bug's change history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub who: String,
    pub when: DateTime<Utc>,
    pub changes: Vec<FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field_name: String,
    pub removed: String,
    pub added: String,
}

/// Private per-user state layered over a [`Record`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub unread: bool,
    #[serde(default)]
    pub starred_comments: BTreeSet<u64>,
}

impl Annotation {
    pub fn starred(&self) -> bool {
        !self.starred_comments.is_empty()
    }
}

/// Partial update applied by `AnnotationOverlay::set`. `None` leaves the field alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnotationPatch {
    pub unread: Option<bool>,
    pub starred: Option<bool>,
}

impl AnnotationPatch {
    pub fn unread(value: bool) -> Self {
        AnnotationPatch {
            unread: Some(value),
            starred: None,
        }
    }

    pub fn starred(value: bool) -> Self {
        AnnotationPatch {
            unread: None,
            starred: Some(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationKind {
    Unread,
    Starred,
}

/// Owned copy of a merged record, handed to views that need a stable value.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordView {
    pub record: Record,
    pub annotation: Annotation,
}


#[cfg(test)]
mod tests {
    use super::fixtures::record;
    use super::*;

    #[test]
    fn participants_deduplicates_and_keeps_creator_first() {
        let mut r = record(1, "crash");
        r.cc = vec![
            "reporter@example.com".into(),
            "a@example.com".into(),
            "a@example.com".into(),
        ];
        r.assigned_to = String::new();
        assert_eq!(
            r.participants(),
            vec!["reporter@example.com".to_string(), "a@example.com".to_string()]
        );
    }

    #[test]
    fn annotation_starred_follows_comment_set() {
        let mut a = Annotation::default();
        assert!(!a.starred());
        a.starred_comments.insert(7);
        assert!(a.starred());
    }

    #[test]
    fn record_deserializes_with_missing_optional_fields() {
        let json = r#"{
            "id": 42,
            "summary": "Hang on startup",
            "status": "NEW",
            "last_change_time": "2024-03-01T12:00:00Z"
        }"#;
        let r: Record = serde_json::from_str(json).unwrap();
        assert_eq!(r.id, 42);
        assert!(r.comments.is_empty());
        assert_eq!(r.first_comment_id(), None);
    }
}
