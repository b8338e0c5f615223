// Document envelope types: the {item, metadata, previous} slot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Implicit and caller-supplied fields carried alongside a stored item.
#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Metadata {
    pub fn new(user_id: Option<String>, extra: serde_json::Map<String, Value>) -> Self {
        let now = Utc::now();
        Metadata {
            created_at: now,
            updated_at: now,
            user_id,
            extra,
        }
    }

    /// Bump `updated_at` and merge caller-supplied fields in place.
    pub fn touch(&mut self, extra: Option<serde_json::Map<String, Value>>) {
        self.updated_at = Utc::now();
        if let Some(extra) = extra {
            for (key, value) in extra {
                self.extra.insert(key, value);
            }
        }
    }
}

/// One-generation-deep snapshot of a slot's prior state. Replaced, never
/// stacked, on every subsequent write.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub item: Arc<Value>,
    pub metadata: Metadata,
}

/// The envelope around one stored value. `item` is immutable once published
/// (shared behind `Arc`); writes swap the whole slot contents.
#[derive(Debug, Clone)]
pub struct DocumentSlot {
    pub item: Arc<Value>,
    pub metadata: Metadata,
    pub previous: Option<Snapshot>,
}

impl DocumentSlot {
    pub fn new(item: Arc<Value>, metadata: Metadata) -> Self {
        DocumentSlot {
            item,
            metadata,
            previous: None,
        }
    }

    /// Replace the stored item, demoting the current state to `previous`.
    pub fn replace(&mut self, item: Arc<Value>, extra: Option<serde_json::Map<String, Value>>) {
        self.previous = Some(Snapshot {
            item: std::mem::replace(&mut self.item, item),
            metadata: self.metadata.clone(),
        });
        self.metadata.touch(extra);
    }
}
