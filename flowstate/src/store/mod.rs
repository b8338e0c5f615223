use crate::document::{DocumentSlot, Metadata, Snapshot};
use crate::error::{FlowstateError, Result};
use crate::event::{AddListener, DataEvent, EventDispatcher, EventKind, ListenerHandle};
use crate::query::{self, Where};
use crate::relation::{DocKey, RelationGraph};
use crate::schema::{AutoIdStrategy, IdRules, SchemaDefinition, SchemaRegistry, SchemaType};
use crate::util;
use crate::validation::{self, RelationTarget};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Options for read operations.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub prefix_id: Option<String>,
    pub suffix_id: Option<String>,
    /// Recursively resolve the document's relation closure into `expand`.
    pub expand: bool,
    /// Detach the returned item from the store-shared allocation.
    pub clone: bool,
    /// Dotted path extracted from the item after expansion/cloning.
    pub position: Option<String>,
}

/// Options for write operations. The variant is selected by which of
/// `merge`, `replace`, `update` is set; plain insert otherwise.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub id: Option<String>,
    pub prefix_id: Option<String>,
    pub suffix_id: Option<String>,
    pub merge: bool,
    pub replace: bool,
    pub update: Option<UpdateSpec>,
    /// Caller-supplied metadata fields, merged into the slot's metadata.
    pub metadata: Option<serde_json::Map<String, Value>>,
    /// Silence normal listeners; force listeners still fire.
    pub stop_propagation: bool,
}

/// A positional array mutation inside a stored document.
#[derive(Debug, Clone)]
pub struct UpdateSpec {
    /// Path segments from the document root to the target array.
    pub position: Vec<String>,
    pub method: UpdateMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMethod {
    Push,
    Pull,
    Pop,
    Shift,
    Unshift,
    Splice { start: usize, delete_count: usize },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Recursively delete documents this one exclusively referenced.
    pub cascade: bool,
    pub stop_propagation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted: bool,
    pub in_use: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub expand: bool,
}

/// One resolved document, as returned by reads.
#[derive(Debug, Clone)]
pub struct DataValue {
    pub id: Option<String>,
    pub item: Arc<Value>,
    pub metadata: Option<Metadata>,
    pub previous: Option<Snapshot>,
    pub expand: Vec<ExpandEntry>,
}

/// One entry of a document's flattened relation closure.
#[derive(Debug, Clone)]
pub struct ExpandEntry {
    pub collection: String,
    pub id: String,
    pub item: Arc<Value>,
    pub metadata: Metadata,
}

/// Result of `get_value`. A missing document is `Empty`, not an error.
#[derive(Debug, Clone)]
pub enum GetResult {
    Empty,
    One(DataValue),
    Many(Vec<DataValue>),
}

impl GetResult {
    pub fn is_empty(&self) -> bool {
        match self {
            GetResult::Empty => true,
            GetResult::One(_) => false,
            GetResult::Many(values) => values.is_empty(),
        }
    }

    /// The single resolved value, if any.
    pub fn one(&self) -> Option<&DataValue> {
        match self {
            GetResult::One(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_one(self) -> Option<DataValue> {
        match self {
            GetResult::One(value) => Some(value),
            _ => None,
        }
    }
}

/// Result of a write.
#[derive(Debug, Clone)]
pub struct SetResult {
    pub id: Option<String>,
    pub item: Arc<Value>,
    /// False when the write was a recognized no-op (e.g. `pull` of an
    /// absent element); no event was fired and nothing changed.
    pub is_valid: bool,
}

enum CollectionState {
    Documents(HashMap<String, DocumentSlot>),
    Single(DocumentSlot),
}

/// The process-wide value store: schema-validated collections, relation
/// tracking, and listener dispatch. Single-threaded by design; all
/// mutation flows through the validated entry points.
pub struct Store {
    schema: SchemaRegistry,
    collections: HashMap<String, CollectionState>,
    relations: RelationGraph,
    dispatcher: EventDispatcher,
    user_id: Option<String>,
}

impl Store {
    pub fn new(schema: SchemaRegistry) -> Self {
        Store {
            schema,
            collections: HashMap::new(),
            relations: RelationGraph::new(),
            dispatcher: EventDispatcher::new(),
            user_id: None,
        }
    }

    /// Build a store from a YAML schema declaration.
    pub fn from_schema_str(yaml: &str) -> Result<Self> {
        let mut registry = SchemaRegistry::new();
        registry.load_str(yaml)?;
        Ok(Store::new(registry))
    }

    /// Stamp subsequent writes with a user id (server contexts).
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn relations(&self) -> &RelationGraph {
        &self.relations
    }

    /// Register additional schema declarations. Setup-time only.
    pub fn load_schema(&mut self, definition: &SchemaDefinition) -> Result<()> {
        self.schema.load(definition)
    }

    pub fn load_schema_str(&mut self, yaml: &str) -> Result<()> {
        self.schema.load_str(yaml)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn get_value(
        &self,
        name: &str,
        id: Option<&str>,
        options: GetOptions,
    ) -> Result<GetResult> {
        let entry = self
            .schema
            .get(name)
            .ok_or_else(|| FlowstateError::UnknownCollection {
                name: name.to_string(),
            })?;

        if entry.schema_type != SchemaType::Collection {
            let Some(CollectionState::Single(slot)) = self.collections.get(name) else {
                return Ok(GetResult::Empty);
            };
            return Ok(match self.build_data_value(name, None, slot, &options) {
                Some(value) => GetResult::One(value),
                None => GetResult::Empty,
            });
        }

        let Some(CollectionState::Documents(documents)) = self.collections.get(name) else {
            return Ok(GetResult::Empty);
        };

        match id {
            Some(id) => {
                let resolved = id_candidates(
                    id,
                    options.prefix_id.as_deref(),
                    options.suffix_id.as_deref(),
                    entry.id.as_ref(),
                )
                .into_iter()
                .find(|candidate| documents.contains_key(candidate));

                let Some(resolved) = resolved else {
                    return Ok(GetResult::Empty);
                };
                let slot = &documents[&resolved];
                Ok(
                    match self.build_data_value(name, Some(&resolved), slot, &options) {
                        Some(value) => GetResult::One(value),
                        None => GetResult::Empty,
                    },
                )
            }
            None => {
                let mut values = Vec::new();
                for (doc_id, slot) in documents {
                    if let Some(value) =
                        self.build_data_value(name, Some(doc_id.as_str()), slot, &options)
                    {
                        values.push(value);
                    }
                }
                if values.is_empty() {
                    Ok(GetResult::Empty)
                } else {
                    Ok(GetResult::Many(values))
                }
            }
        }
    }

    /// Linear scan of a collection with a short-circuit predicate tree.
    /// Leaf names prefixed `metadata.` read document metadata; all others
    /// are dotted paths into the item.
    pub fn find(
        &self,
        name: &str,
        predicate: Option<&Where>,
        options: FindOptions,
    ) -> Result<Vec<DataValue>> {
        let entry = self
            .schema
            .get(name)
            .ok_or_else(|| FlowstateError::UnknownCollection {
                name: name.to_string(),
            })?;

        let get_options = GetOptions {
            expand: options.expand,
            ..GetOptions::default()
        };

        let matches = |slot: &DocumentSlot| -> bool {
            let Some(predicate) = predicate else {
                return true;
            };
            query::evaluate(predicate, &|field: &str| {
                if let Some(rest) = field.strip_prefix("metadata.") {
                    let metadata = serde_json::to_value(&slot.metadata).ok()?;
                    metadata.get(rest).cloned()
                } else {
                    util::get_path(&slot.item, field).cloned()
                }
            })
        };

        let mut results = Vec::new();
        match self.collections.get(name) {
            Some(CollectionState::Documents(documents)) => {
                for (doc_id, slot) in documents {
                    if matches(slot) {
                        if let Some(value) =
                            self.build_data_value(name, Some(doc_id.as_str()), slot, &get_options)
                        {
                            results.push(value);
                        }
                    }
                }
            }
            Some(CollectionState::Single(slot)) => {
                if entry.schema_type != SchemaType::Collection && matches(slot) {
                    if let Some(value) = self.build_data_value(name, None, slot, &get_options) {
                        results.push(value);
                    }
                }
            }
            None => {}
        }
        Ok(results)
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Validated write. See SetOptions for the merge/replace/update
    /// variants; plain insert otherwise.
    pub fn set_value(&mut self, name: &str, value: Value, options: SetOptions) -> Result<SetResult> {
        self.write_value(name, value, options, true)
    }

    /// Unvalidated write for trusted callers (bulk hydration). Skips both
    /// schema checks and relation tracking; events still fire.
    pub fn unsafe_set_value(
        &mut self,
        name: &str,
        value: Value,
        options: SetOptions,
    ) -> Result<SetResult> {
        self.write_value(name, value, options, false)
    }

    fn write_value(
        &mut self,
        name: &str,
        value: Value,
        options: SetOptions,
        validate: bool,
    ) -> Result<SetResult> {
        let entry = self
            .schema
            .get(name)
            .ok_or_else(|| FlowstateError::UnknownCollection {
                name: name.to_string(),
            })?;
        let is_collection = entry.schema_type == SchemaType::Collection;
        let id_rules = entry.id.clone();

        if options.update.is_some() {
            return self.apply_update(name, value, &options, is_collection, id_rules, validate);
        }
        if options.merge {
            return self.apply_merge(name, value, &options, is_collection, id_rules, validate);
        }

        if is_collection {
            if options.replace && options.id.is_none() {
                return self.replace_documents(name, value, &options, validate);
            }
            let id = match &options.id {
                Some(_) => resolve_write_id(&options, id_rules.as_ref()),
                None => generate_id(id_rules.as_ref()),
            };
            let mut value = value;
            let relations = if validate {
                validation::validate_value(&self.schema, &format!("{name}/items"), &mut value)?
            } else {
                Vec::new()
            };
            self.commit_document(name, &id, value, relations, &options, validate)
        } else {
            let mut value = value;
            let relations = if validate {
                validation::validate_value(&self.schema, name, &mut value)?
            } else {
                Vec::new()
            };
            self.commit_single(name, value, relations, &options, validate)
        }
    }

    /// Wholesale overwrite of several documents at once: the value is a
    /// mapping of document id -> item, each validated independently.
    fn replace_documents(
        &mut self,
        name: &str,
        value: Value,
        options: &SetOptions,
        validate: bool,
    ) -> Result<SetResult> {
        let Value::Object(documents) = value else {
            return Err(FlowstateError::UnexpectedType {
                path: name.to_string(),
                expected: "object",
                found: validation::json_type_name(&value),
            });
        };

        let mut last = None;
        for (id, document) in documents {
            let mut document = document;
            let relations = if validate {
                validation::validate_value(&self.schema, &format!("{name}/items"), &mut document)?
            } else {
                Vec::new()
            };
            last = Some(self.commit_document(name, &id, document, relations, options, validate)?);
        }

        Ok(last.unwrap_or(SetResult {
            id: None,
            item: Arc::new(Value::Null),
            is_valid: true,
        }))
    }

    fn apply_merge(
        &mut self,
        name: &str,
        value: Value,
        options: &SetOptions,
        is_collection: bool,
        id_rules: Option<IdRules>,
        validate: bool,
    ) -> Result<SetResult> {
        if is_collection {
            match &options.id {
                Some(_) => {
                    let id = self
                        .resolve_existing_id(name, options, id_rules.as_ref())
                        .unwrap_or_else(|| resolve_write_id(options, id_rules.as_ref()));
                    let existing = self
                        .document_slot(name, &id)
                        .map(|slot| (*slot.item).clone());
                    let mut merged = shallow_merge(existing, value);
                    let relations = if validate {
                        validation::validate_value(
                            &self.schema,
                            &format!("{name}/items"),
                            &mut merged,
                        )?
                    } else {
                        Vec::new()
                    };
                    self.commit_document(name, &id, merged, relations, options, validate)
                }
                None => {
                    // Per-document merge: the value maps document id -> delta.
                    let Value::Object(deltas) = value else {
                        return Err(FlowstateError::UnexpectedType {
                            path: name.to_string(),
                            expected: "object",
                            found: validation::json_type_name(&value),
                        });
                    };
                    let mut last = None;
                    for (id, delta) in deltas {
                        let per_doc = SetOptions {
                            id: Some(id),
                            ..options.clone()
                        };
                        last = Some(self.apply_merge(
                            name,
                            delta,
                            &per_doc,
                            true,
                            id_rules.clone(),
                            validate,
                        )?);
                    }
                    Ok(last.unwrap_or(SetResult {
                        id: None,
                        item: Arc::new(Value::Null),
                        is_valid: true,
                    }))
                }
            }
        } else {
            let existing = match self.collections.get(name) {
                Some(CollectionState::Single(slot)) => Some((*slot.item).clone()),
                _ => None,
            };
            let mut merged = shallow_merge(existing, value);
            let relations = if validate {
                validation::validate_value(&self.schema, name, &mut merged)?
            } else {
                Vec::new()
            };
            self.commit_single(name, merged, relations, options, validate)
        }
    }

    fn apply_update(
        &mut self,
        name: &str,
        value: Value,
        options: &SetOptions,
        is_collection: bool,
        id_rules: Option<IdRules>,
        validate: bool,
    ) -> Result<SetResult> {
        let update = options.update.clone().expect("checked by caller");
        if update.position.is_empty() {
            return Err(FlowstateError::MissingUpdatePosition {
                collection: name.to_string(),
            });
        }

        let (id, mut item) = if is_collection {
            if options.id.is_none() {
                return Err(FlowstateError::InvalidId(format!(
                    "update on collection '{name}' requires an id"
                )));
            }
            let id = self
                .resolve_existing_id(name, options, id_rules.as_ref())
                .ok_or_else(|| FlowstateError::NotFound {
                    collection: name.to_string(),
                    id: options.id.clone().unwrap_or_default(),
                })?;
            let slot = self.document_slot(name, &id).expect("resolved above");
            (Some(id), (*slot.item).clone())
        } else {
            let Some(CollectionState::Single(slot)) = self.collections.get(name) else {
                return Err(FlowstateError::NotFound {
                    collection: name.to_string(),
                    id: String::new(),
                });
            };
            (None, (*slot.item).clone())
        };

        // Validate (and default) incoming elements before touching the item,
        // so a rejected element leaves the document untouched.
        let items_path = update_items_path(name, is_collection, &update.position);
        let (mut added, pull_value): (Vec<Value>, Option<Value>) = match update.method {
            UpdateMethod::Push | UpdateMethod::Unshift => (vec![value], None),
            UpdateMethod::Splice { .. } => {
                let values = match value {
                    Value::Array(values) => values,
                    Value::Null => Vec::new(),
                    single => vec![single],
                };
                (values, None)
            }
            UpdateMethod::Pull => (Vec::new(), Some(value)),
            UpdateMethod::Pop | UpdateMethod::Shift => (Vec::new(), None),
        };
        let mut added_relations: Vec<RelationTarget> = Vec::new();
        if validate {
            for element in &mut added {
                added_relations
                    .extend(validation::validate_value(&self.schema, &items_path, element)?);
            }
        }
        let element_relation = self
            .schema
            .get(&items_path)
            .and_then(|entry| entry.relation.clone());

        let position_label = update.position.join(".");
        let target = position_mut(&mut item, &update.position).ok_or_else(|| {
            FlowstateError::InvalidUpdateTarget {
                collection: name.to_string(),
                id: id.clone().unwrap_or_default(),
                position: position_label.clone(),
            }
        })?;
        let Value::Array(array) = target else {
            return Err(FlowstateError::InvalidUpdateTarget {
                collection: name.to_string(),
                id: id.clone().unwrap_or_default(),
                position: position_label,
            });
        };

        let mut removed: Vec<Value> = Vec::new();
        match update.method {
            UpdateMethod::Push => array.extend(added.iter().cloned()),
            UpdateMethod::Unshift => {
                for element in added.iter().rev() {
                    array.insert(0, element.clone());
                }
            }
            UpdateMethod::Pop => match array.pop() {
                Some(element) => removed.push(element),
                None => return Ok(self.unchanged_result(name, id)),
            },
            UpdateMethod::Shift => {
                if array.is_empty() {
                    return Ok(self.unchanged_result(name, id));
                }
                removed.push(array.remove(0));
            }
            UpdateMethod::Pull => {
                let operand = pull_value.as_ref().expect("set above");
                match array.iter().position(|e| query::loose_eq(e, operand)) {
                    Some(index) => removed.push(array.remove(index)),
                    // Absent element: recognized no-op, no event.
                    None => return Ok(self.unchanged_result(name, id)),
                }
            }
            UpdateMethod::Splice { start, delete_count } => {
                let start = start.min(array.len());
                let end = (start + delete_count).min(array.len());
                removed.extend(array.drain(start..end));
                for (offset, element) in added.iter().enumerate() {
                    array.insert(start + offset, element.clone());
                }
            }
        }

        // Relation bookkeeping mirrors the element changes.
        let owner = DocKey::new(name, id.clone().unwrap_or_default());
        for relation in &added_relations {
            self.relations.add(
                owner.clone(),
                DocKey::new(relation.collection.clone(), relation.id.clone()),
            );
        }
        if let Some(relation_path) = &element_relation {
            for element in &removed {
                if let Some(element_id) = element.as_str() {
                    let target = RelationTarget::from_schema_path(relation_path, element_id);
                    self.relations
                        .remove(&owner, &DocKey::new(target.collection, target.id));
                }
            }
        }

        self.commit_prepared(name, id.as_deref(), item, options)
    }

    /// Plain insert/overwrite of one collection document.
    fn commit_document(
        &mut self,
        name: &str,
        id: &str,
        value: Value,
        relations: Vec<RelationTarget>,
        options: &SetOptions,
        track_relations: bool,
    ) -> Result<SetResult> {
        if track_relations {
            let owner = DocKey::new(name, id);
            // Full overwrite: recompute this document's outgoing edges.
            self.relations.remove_owner(&owner);
            for relation in relations {
                self.relations
                    .add(owner.clone(), DocKey::new(relation.collection, relation.id));
            }
        }

        let item = Arc::new(value);
        let state = self
            .collections
            .entry(name.to_string())
            .or_insert_with(|| CollectionState::Documents(HashMap::new()));
        let CollectionState::Documents(documents) = state else {
            return Err(FlowstateError::Other(format!(
                "'{name}' is not a collection"
            )));
        };

        let metadata = match documents.get_mut(id) {
            Some(slot) => {
                slot.replace(item.clone(), options.metadata.clone());
                slot.metadata.clone()
            }
            None => {
                let metadata = Metadata::new(
                    self.user_id.clone(),
                    options.metadata.clone().unwrap_or_default(),
                );
                documents.insert(
                    id.to_string(),
                    DocumentSlot::new(item.clone(), metadata.clone()),
                );
                metadata
            }
        };

        self.emit(
            name,
            EventKind::Update,
            Some(id.to_string()),
            item.clone(),
            Some(metadata),
            options.stop_propagation,
        );

        Ok(SetResult {
            id: Some(id.to_string()),
            item,
            is_valid: true,
        })
    }

    fn commit_single(
        &mut self,
        name: &str,
        value: Value,
        relations: Vec<RelationTarget>,
        options: &SetOptions,
        track_relations: bool,
    ) -> Result<SetResult> {
        if track_relations {
            let owner = DocKey::new(name, "");
            self.relations.remove_owner(&owner);
            for relation in relations {
                self.relations
                    .add(owner.clone(), DocKey::new(relation.collection, relation.id));
            }
        }

        let item = Arc::new(value);
        let metadata = match self.collections.get_mut(name) {
            Some(CollectionState::Single(slot)) => {
                slot.replace(item.clone(), options.metadata.clone());
                slot.metadata.clone()
            }
            _ => {
                let metadata = Metadata::new(
                    self.user_id.clone(),
                    options.metadata.clone().unwrap_or_default(),
                );
                self.collections.insert(
                    name.to_string(),
                    CollectionState::Single(DocumentSlot::new(item.clone(), metadata.clone())),
                );
                metadata
            }
        };

        self.emit(
            name,
            EventKind::Update,
            None,
            item.clone(),
            Some(metadata),
            options.stop_propagation,
        );

        Ok(SetResult {
            id: None,
            item,
            is_valid: true,
        })
    }

    /// Store an already-validated item back into its slot and fire the
    /// update event (positional updates).
    fn commit_prepared(
        &mut self,
        name: &str,
        id: Option<&str>,
        item: Value,
        options: &SetOptions,
    ) -> Result<SetResult> {
        let item = Arc::new(item);
        let metadata = match (self.collections.get_mut(name), id) {
            (Some(CollectionState::Documents(documents)), Some(id)) => {
                let slot = documents.get_mut(id).expect("resolved by caller");
                slot.replace(item.clone(), options.metadata.clone());
                slot.metadata.clone()
            }
            (Some(CollectionState::Single(slot)), None) => {
                slot.replace(item.clone(), options.metadata.clone());
                slot.metadata.clone()
            }
            _ => {
                return Err(FlowstateError::Other(format!(
                    "slot disappeared during update of '{name}'"
                )))
            }
        };

        self.emit(
            name,
            EventKind::Update,
            id.map(String::from),
            item.clone(),
            Some(metadata),
            options.stop_propagation,
        );

        Ok(SetResult {
            id: id.map(String::from),
            item,
            is_valid: true,
        })
    }

    /// The result for a no-op write: nothing changed, no event fired.
    fn unchanged_result(&self, name: &str, id: Option<String>) -> SetResult {
        let item = match (&id, self.collections.get(name)) {
            (Some(id), Some(CollectionState::Documents(documents))) => documents
                .get(id)
                .map(|slot| slot.item.clone())
                .unwrap_or_else(|| Arc::new(Value::Null)),
            (None, Some(CollectionState::Single(slot))) => slot.item.clone(),
            _ => Arc::new(Value::Null),
        };
        SetResult {
            id,
            item,
            is_valid: false,
        }
    }

    // ── Deletes ─────────────────────────────────────────────────────

    /// Delete a document, refusing while other live documents still
    /// reference it. With `cascade`, documents this one exclusively
    /// referenced are deleted recursively; edges are removed before each
    /// recursion step, so cyclic graphs terminate.
    pub fn delete_value(
        &mut self,
        name: &str,
        id: &str,
        options: DeleteOptions,
    ) -> Result<DeleteResult> {
        let entry = self
            .schema
            .get(name)
            .ok_or_else(|| FlowstateError::UnknownCollection {
                name: name.to_string(),
            })?;
        if entry.schema_type != SchemaType::Collection {
            return Err(FlowstateError::Other(format!(
                "delete_value requires a collection, '{name}' is {}",
                entry.schema_type.name()
            )));
        }
        let id_rules = entry.id.clone();

        let lookup = SetOptions {
            id: Some(id.to_string()),
            ..SetOptions::default()
        };
        let resolved = self
            .resolve_existing_id(name, &lookup, id_rules.as_ref())
            .ok_or_else(|| FlowstateError::NotFound {
                collection: name.to_string(),
                id: id.to_string(),
            })?;

        let key = DocKey::new(name, resolved.clone());
        if self.relations.is_in_use(&key) {
            return Ok(DeleteResult {
                deleted: false,
                in_use: true,
            });
        }

        // Fire the delete event, then remove the slot.
        let slot = self
            .document_slot(name, &resolved)
            .expect("resolved above")
            .clone();
        self.emit(
            name,
            EventKind::Delete,
            Some(resolved.clone()),
            slot.item.clone(),
            Some(slot.metadata.clone()),
            options.stop_propagation,
        );
        if let Some(CollectionState::Documents(documents)) = self.collections.get_mut(name) {
            documents.remove(&resolved);
        }

        // Remove outgoing edges first so cascades over cycles terminate.
        let targets = self.relations.remove_owner(&key);
        if options.cascade {
            for target in targets {
                if self.relations.is_in_use(&target) {
                    continue; // still referenced elsewhere
                }
                if self.document_slot(&target.collection, &target.id).is_some() {
                    self.delete_value(&target.collection, &target.id, options)?;
                }
            }
        }

        Ok(DeleteResult {
            deleted: true,
            in_use: false,
        })
    }

    // ── Listeners ───────────────────────────────────────────────────

    pub fn add_listener(&mut self, listener: AddListener) -> Result<ListenerHandle> {
        let entry = self
            .schema
            .get(&listener.name)
            .ok_or_else(|| FlowstateError::UnknownCollection {
                name: listener.name.clone(),
            })?;
        let per_item = entry.schema_type == SchemaType::Collection;
        Ok(self.dispatcher.add_listener(listener, per_item))
    }

    pub fn delete_listener(&mut self, handle: &ListenerHandle) {
        self.dispatcher.delete_listener(handle)
    }

    /// Re-fire an event for collaborators that need to replay one.
    pub fn dispatch_event(
        &self,
        name: &str,
        on: EventKind,
        id: Option<String>,
        item: Arc<Value>,
        stop_propagation: bool,
    ) {
        self.emit(name, on, id, item, None, stop_propagation);
    }

    fn emit(
        &self,
        name: &str,
        on: EventKind,
        id: Option<String>,
        item: Arc<Value>,
        metadata: Option<Metadata>,
        stop_propagation: bool,
    ) {
        let event = DataEvent {
            collection: name.to_string(),
            id,
            on,
            item,
            metadata,
        };
        self.dispatcher.dispatch(&event, stop_propagation);
    }

    // ── Internals ───────────────────────────────────────────────────

    fn document_slot(&self, name: &str, id: &str) -> Option<&DocumentSlot> {
        match self.collections.get(name)? {
            CollectionState::Documents(documents) => documents.get(id),
            CollectionState::Single(slot) => {
                if id.is_empty() {
                    Some(slot)
                } else {
                    None
                }
            }
        }
    }

    fn resolve_existing_id(
        &self,
        name: &str,
        options: &SetOptions,
        rules: Option<&IdRules>,
    ) -> Option<String> {
        let id = options.id.as_deref()?;
        let Some(CollectionState::Documents(documents)) = self.collections.get(name) else {
            return None;
        };
        id_candidates(
            id,
            options.prefix_id.as_deref(),
            options.suffix_id.as_deref(),
            rules,
        )
        .into_iter()
        .find(|candidate| documents.contains_key(candidate))
    }

    fn build_data_value(
        &self,
        name: &str,
        id: Option<&str>,
        slot: &DocumentSlot,
        options: &GetOptions,
    ) -> Option<DataValue> {
        let mut item = slot.item.clone();
        let mut expand_entries = Vec::new();

        if options.expand {
            let root = DocKey::new(name, id.unwrap_or_default());
            let mut seen = HashSet::new();
            seen.insert(root.clone());
            self.expand_relations(&root, &mut seen, &mut expand_entries);
        }
        if options.clone {
            item = Arc::new((*item).clone());
        }
        if let Some(position) = &options.position {
            item = Arc::new(util::get_path(&item, position)?.clone());
        }

        Some(DataValue {
            id: id.map(String::from),
            item,
            metadata: Some(slot.metadata.clone()),
            previous: slot.previous.clone(),
            expand: expand_entries,
        })
    }

    /// Flatten the transitive relation closure of `key`: branches in
    /// relation-insertion order, descendants before the branch document
    /// itself, diamonds and cycles visited once.
    fn expand_relations(
        &self,
        key: &DocKey,
        seen: &mut HashSet<DocKey>,
        out: &mut Vec<ExpandEntry>,
    ) {
        for target in self.relations.targets(key) {
            if !seen.insert(target.clone()) {
                continue;
            }
            self.expand_relations(target, seen, out);
            if let Some(slot) = self.document_slot(&target.collection, &target.id) {
                out.push(ExpandEntry {
                    collection: target.collection.clone(),
                    id: target.id.clone(),
                    item: slot.item.clone(),
                    metadata: slot.metadata.clone(),
                });
            }
        }
    }
}

/// An id "has both affixes" when splitting on `_` yields exactly three
/// parts with non-empty bounds.
pub fn has_both_affixes(id: &str) -> bool {
    let parts: Vec<&str> = id.split('_').collect();
    parts.len() == 3 && !parts[0].is_empty() && !parts[2].is_empty()
}

/// Candidate ids for read resolution, in fallback order: caller-affixed,
/// schema-affixed, raw.
fn id_candidates(
    id: &str,
    prefix: Option<&str>,
    suffix: Option<&str>,
    rules: Option<&IdRules>,
) -> Vec<String> {
    let mut candidates = Vec::new();
    if prefix.is_some() || suffix.is_some() {
        candidates.push(format!(
            "{}{}{}",
            prefix.unwrap_or(""),
            id,
            suffix.unwrap_or("")
        ));
    }
    if let Some(rules) = rules {
        if rules.has_affixes() && !has_both_affixes(id) {
            candidates.push(rules.affixed(id));
        }
    }
    if !candidates.iter().any(|c| c == id) {
        candidates.push(id.to_string());
    }
    candidates
}

/// The id used for a write when the caller supplied one.
fn resolve_write_id(options: &SetOptions, rules: Option<&IdRules>) -> String {
    let id = options.id.as_deref().expect("checked by caller");
    if options.prefix_id.is_some() || options.suffix_id.is_some() {
        return format!(
            "{}{}{}",
            options.prefix_id.as_deref().unwrap_or(""),
            id,
            options.suffix_id.as_deref().unwrap_or("")
        );
    }
    if let Some(rules) = rules {
        if rules.has_affixes() && !has_both_affixes(id) {
            return rules.affixed(id);
        }
    }
    id.to_string()
}

/// A fresh document id from the schema's rules: the declared default id,
/// or one generated by the declared strategy (nanoid when none), wrapped
/// in the declared affixes.
fn generate_id(rules: Option<&IdRules>) -> String {
    let base = rules
        .and_then(|r| r.default.clone())
        .unwrap_or_else(|| match rules.and_then(|r| r.auto) {
            Some(AutoIdStrategy::Ulid) => ulid::Ulid::new().to_string().to_lowercase(),
            Some(AutoIdStrategy::Uuid) => uuid::Uuid::new_v4().to_string(),
            Some(AutoIdStrategy::Nanoid) | None => nanoid::nanoid!(),
        });
    match rules {
        Some(rules) => rules.affixed(&base),
        None => base,
    }
}

/// Shallow merge: each top-level key of the delta overwrites the base.
/// Non-object pairs degenerate to replacement.
fn shallow_merge(base: Option<Value>, delta: Value) -> Value {
    match (base, delta) {
        (Some(Value::Object(mut base)), Value::Object(delta)) => {
            for (key, value) in delta {
                base.insert(key, value);
            }
            Value::Object(base)
        }
        (_, delta) => delta,
    }
}

fn position_mut<'a>(root: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Schema path of the elements touched by a positional update. Numeric
/// segments index into data, not schema, and are skipped.
fn update_items_path(name: &str, is_collection: bool, position: &[String]) -> String {
    let mut path = String::from(name);
    if is_collection {
        path.push_str("/items");
    }
    for segment in position {
        if segment.parse::<usize>().is_err() {
            path.push('/');
            path.push_str(segment);
        }
    }
    path.push_str("/items");
    path
}
