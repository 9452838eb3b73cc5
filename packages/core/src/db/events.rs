//! Store Events
//!
//! This module defines the events a [`MirrorStore`](crate::services::MirrorStore)
//! emits when its cache changes. The owning graph framework subscribes to them to
//! learn which of its objects must be refreshed, without coupling to the cache
//! internals.
//!
//! # Architecture
//!
//! Each store owns one `tokio::sync::broadcast` sender; every
//! [`subscribe`](crate::services::MirrorStore::subscribe) call hands out a new
//! receiver. A send never fails the fetch or save that caused it. With no
//! receivers the event is dropped, and a slow receiver sees `Lagged` instead of
//! blocking the store.
//!
//! # Event Flow
//!
//! 1. A fetch, fetch-through or completed save operation merges data into the cache
//! 2. The keys that were inserted or updated are emitted as `ObjectsRefreshed`
//! 3. Subscribers re-read the affected objects

use crate::models::ReferenceKey;
use serde::{Deserialize, Serialize};

/// Events emitted by the mirror store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StoreEvent {
    /// Fresh data was merged into the cache
    #[serde(rename_all = "camelCase")]
    ObjectsRefreshed {
        inserted: Vec<ReferenceKey>,
        updated: Vec<ReferenceKey>,
    },

    /// An entry was reset to placeholder and will be refetched on next read
    ObjectsInvalidated { key: ReferenceKey },

    /// Entries were removed from the cache
    ObjectsEvicted { keys: Vec<ReferenceKey> },

    /// A save batch finished without errors
    SaveCompleted { operations: usize },

    /// A save batch stopped at its first hard failure
    SaveFailed { error: String },
}

impl StoreEvent {
    /// Get a string representation of the event type
    pub fn event_type(&self) -> &str {
        match self {
            StoreEvent::ObjectsRefreshed { .. } => "objects:refreshed",
            StoreEvent::ObjectsInvalidated { .. } => "objects:invalidated",
            StoreEvent::ObjectsEvicted { .. } => "objects:evicted",
            StoreEvent::SaveCompleted { .. } => "save:completed",
            StoreEvent::SaveFailed { .. } => "save:failed",
        }
    }

    /// Build a refresh event, or `None` when nothing changed
    pub fn refreshed(inserted: Vec<ReferenceKey>, updated: Vec<ReferenceKey>) -> Option<Self> {
        if inserted.is_empty() && updated.is_empty() {
            None
        } else {
            Some(StoreEvent::ObjectsRefreshed { inserted, updated })
        }
    }
}
