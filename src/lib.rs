//! Offline-first core of a bug tracker client: an identity-stable record
//! cache with a private annotation overlay, a typed event bus, presenters,
//! tabbed navigation and background sync.

pub mod app;
pub mod bus;
pub mod cache;
pub mod config;
pub mod core;

pub use app::{DataSource, LocationBar, Session, View};
pub use bus::{Event, EventBus, Topic};
pub use cache::{AnnotationOverlay, CachedRecord, RecordCache};
pub use config::Config;
