// Listener registration and ordered event dispatch.

use crate::document::Metadata;
use serde_json::Value;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Update,
    Delete,
}

/// The payload handed to listeners after a successful write or delete.
#[derive(Debug, Clone)]
pub struct DataEvent {
    pub collection: String,
    pub id: Option<String>,
    pub on: EventKind,
    pub item: Arc<Value>,
    pub metadata: Option<Metadata>,
}

/// A registered observer. Implemented for any `Fn(&DataEvent)` closure;
/// implement directly on a type when the captured context's ownership
/// should be explicit.
pub trait Notify {
    fn notify(&self, event: &DataEvent);
}

impl<F> Notify for F
where
    F: Fn(&DataEvent),
{
    fn notify(&self, event: &DataEvent) {
        self(event)
    }
}

/// Parameters for registering a listener.
pub struct AddListener {
    pub name: String,
    pub id: Option<String>,
    pub on: EventKind,
    /// Priority listeners fire before unscoped ones, ascending.
    pub priority: Option<i32>,
    /// Force listeners still fire when an event is dispatched with
    /// stop_propagation (cache invalidation and the like).
    pub force: bool,
    /// Route to the catch-all bucket even when an id is given.
    pub capture_all: bool,
    pub handler: Rc<dyn Notify>,
}

impl AddListener {
    pub fn new(name: impl Into<String>, on: EventKind, handler: Rc<dyn Notify>) -> Self {
        AddListener {
            name: name.into(),
            id: None,
            on,
            priority: None,
            force: false,
            capture_all: false,
            handler,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    All,
    Items,
    Priority,
}

/// Opaque handle returned by add_listener, usable for removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerHandle {
    collection: String,
    on: EventKind,
    bucket: Bucket,
    key: Option<String>,
    seq: u64,
}

struct Registered {
    seq: u64,
    priority: i32,
    force: bool,
    handler: Rc<dyn Notify>,
}

#[derive(Default)]
struct Buckets {
    all: Vec<Registered>,
    items: HashMap<String, Vec<Registered>>,
    priority: HashMap<String, Vec<Registered>>,
}

#[derive(Default)]
struct KindBuckets {
    update: Buckets,
    delete: Buckets,
}

impl KindBuckets {
    fn get(&self, on: EventKind) -> &Buckets {
        match on {
            EventKind::Update => &self.update,
            EventKind::Delete => &self.delete,
        }
    }

    fn get_mut(&mut self, on: EventKind) -> &mut Buckets {
        match on {
            EventKind::Update => &mut self.update,
            EventKind::Delete => &mut self.delete,
        }
    }
}

/// Per-collection listener buckets with deterministic dispatch order:
/// priority (ascending) -> per-item -> catch-all.
#[derive(Default)]
pub struct EventDispatcher {
    seq: u64,
    collections: HashMap<String, KindBuckets>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. `per_item` says whether the collection supports
    /// per-item addressing; when it does not, handlers land in the
    /// catch-all bucket regardless of `id`.
    pub fn add_listener(&mut self, listener: AddListener, per_item: bool) -> ListenerHandle {
        self.seq += 1;
        let seq = self.seq;
        let collection = listener.name.clone();
        let buckets = self
            .collections
            .entry(collection.clone())
            .or_default()
            .get_mut(listener.on);

        let registered = Registered {
            seq,
            priority: listener.priority.unwrap_or(0),
            force: listener.force,
            handler: listener.handler,
        };

        let (bucket, key) = if let Some(priority) = listener.priority {
            // Keyed by id when scoped, by the collection name otherwise.
            let key = match (&listener.id, per_item) {
                (Some(id), true) if !listener.capture_all => id.clone(),
                _ => collection.clone(),
            };
            let list = buckets.priority.entry(key.clone()).or_default();
            // Insert keeping ascending priority, stable for equal values.
            let position = list
                .iter()
                .position(|r| r.priority > priority)
                .unwrap_or(list.len());
            list.insert(position, registered);
            (Bucket::Priority, Some(key))
        } else if listener.capture_all || !per_item || listener.id.is_none() {
            buckets.all.push(registered);
            (Bucket::All, None)
        } else {
            let id = listener.id.clone().unwrap_or_default();
            buckets.items.entry(id.clone()).or_default().push(registered);
            (Bucket::Items, Some(id))
        };

        ListenerHandle {
            collection,
            on: listener.on,
            bucket,
            key,
            seq,
        }
    }

    /// Remove a previously registered listener. Safe to call twice.
    pub fn delete_listener(&mut self, handle: &ListenerHandle) {
        let Some(kinds) = self.collections.get_mut(&handle.collection) else {
            return;
        };
        let buckets = kinds.get_mut(handle.on);
        match handle.bucket {
            Bucket::All => buckets.all.retain(|r| r.seq != handle.seq),
            Bucket::Items => {
                if let Some(key) = &handle.key {
                    if let Some(list) = buckets.items.get_mut(key) {
                        list.retain(|r| r.seq != handle.seq);
                        if list.is_empty() {
                            buckets.items.remove(key);
                        }
                    }
                }
            }
            Bucket::Priority => {
                if let Some(key) = &handle.key {
                    if let Some(list) = buckets.priority.get_mut(key) {
                        list.retain(|r| r.seq != handle.seq);
                        if list.is_empty() {
                            buckets.priority.remove(key);
                        }
                    }
                }
            }
        }
    }

    /// Fire an event. With `stop_propagation`, only force listeners run;
    /// order is unchanged either way.
    pub fn dispatch(&self, event: &DataEvent, stop_propagation: bool) {
        let Some(kinds) = self.collections.get(&event.collection) else {
            return;
        };
        let buckets = kinds.get(event.on);

        let run = |list: &[Registered]| {
            for registered in list {
                if stop_propagation && !registered.force {
                    continue;
                }
                registered.handler.notify(event);
            }
        };

        if let Some(id) = &event.id {
            if let Some(list) = buckets.priority.get(id) {
                run(list);
            }
        }
        if let Some(list) = buckets.priority.get(&event.collection) {
            run(list);
        }
        if let Some(id) = &event.id {
            if let Some(list) = buckets.items.get(id) {
                run(list);
            }
        }
        run(&buckets.all);
    }
}
