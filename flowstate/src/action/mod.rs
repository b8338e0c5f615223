//! Stored-workflow execution: sequences of block sequences of blocks,
//! dispatched against the store and a host-supplied action-method table.

use crate::error::{FlowstateError, Result};
use crate::query::{self, Op};
use crate::store::{GetOptions, GetResult, SetOptions, Store};
use crate::util;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

/// Reserved collection names the interpreter reads its programs from.
pub const BLOCKS: &str = "blocks";
pub const BLOCK_SEQUENCES: &str = "blockSequences";
pub const SEQUENCES: &str = "sequences";

const ACTION_SCHEMA: &str = r#"
collections:
  blocks:
    type: collection
    items:
      type: object
  blockSequences:
    type: collection
    items:
      type: array
      items: { type: string }
  sequences:
    type: collection
    items:
      type: array
      items: { type: string }
"#;

/// An externally registered action method. The interpreter only advances
/// once a method's outcome is known, so sequence execution is strictly
/// sequential.
pub trait ActionMethod {
    fn call(&self, store: &mut Store, args: MethodArgs<'_>) -> Result<Value>;
}

impl<F> ActionMethod for F
where
    F: Fn(&mut Store, MethodArgs<'_>) -> Result<Value>,
{
    fn call(&self, store: &mut Store, args: MethodArgs<'_>) -> Result<Value> {
        self(store, args)
    }
}

/// Everything a method sees for one block execution.
pub struct MethodArgs<'a> {
    pub block_id: &'a str,
    /// The block's resolved value (literal, referenced, or collected).
    pub value: Value,
    pub context: &'a Value,
    pub payload: &'a Value,
}

/// Fetch-by-id capability for documents missing from the store (an HTTP
/// client, in practice). Invoked at most once per missing key per
/// dispatch; fetched documents are persisted before the single retry.
pub trait DocumentLoader {
    fn fetch(&self, collection: &str, id: &str) -> Result<Option<Value>>;
}

/// One stored block, in its wire shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Block {
    pub key: Option<String>,
    pub value: Option<Value>,
    /// Substitute a single referenced block's value.
    pub block_value: Option<String>,
    /// Collect several referenced blocks' values into `data_type`.
    pub block_values: Option<Vec<String>>,
    pub data_type: Option<DataKind>,
    pub method: Option<String>,
    pub if_else: Option<IfElse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Object,
    Array,
}

/// A stored branch. `then`/`else` name block sequences whose blocks are
/// spliced into the execution list when the branch is taken.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IfElse {
    #[serde(rename = "if", default)]
    pub conditions: Vec<ConditionEntry>,
    #[serde(default)]
    pub then: Vec<String>,
    #[serde(rename = "else", default)]
    pub else_: Vec<String>,
}

/// One entry of a condition list: either an operand comparison or the
/// `andOr` operator joining two operands into a pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionEntry {
    Logical {
        #[serde(rename = "andOr")]
        and_or: LogicalOp,
    },
    Compare {
        op: Op,
        left: Value,
        right: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    #[serde(rename = "&&")]
    And,
    #[serde(rename = "||")]
    Or,
}

/// Input for one workflow run.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Id of the stored sequence to run.
    pub id: String,
    pub context: Value,
    pub payload: Value,
    /// Drop the per-dispatch block-value cache instead of returning it.
    pub clear_block_values: bool,
}

impl DispatchRequest {
    pub fn new(id: impl Into<String>) -> Self {
        DispatchRequest {
            id: id.into(),
            context: Value::Null,
            payload: Value::Null,
            clear_block_values: false,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Block results keyed by block id, in execution scope for one
    /// dispatch. Empty when the request asked to clear them.
    pub block_values: HashMap<String, Value>,
}

/// The workflow interpreter. Owns the method table and the optional
/// remote loader; all data flows through the store it is handed.
#[derive(Default)]
pub struct ActionEngine {
    methods: HashMap<String, Rc<dyn ActionMethod>>,
    loader: Option<Box<dyn DocumentLoader>>,
}

impl ActionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the reserved action collections on a store. Call once at
    /// setup, before any dispatch.
    pub fn install(&self, store: &mut Store) -> Result<()> {
        store.load_schema_str(ACTION_SCHEMA)
    }

    /// Register an action method under a name referenced by stored blocks.
    pub fn register(&mut self, name: impl Into<String>, method: impl ActionMethod + 'static) {
        self.methods.insert(name.into(), Rc::new(method));
    }

    /// Register a closure as an action method.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, method: F)
    where
        F: Fn(&mut Store, MethodArgs<'_>) -> Result<Value> + 'static,
    {
        self.methods.insert(name.into(), Rc::new(method));
    }

    pub fn set_loader(&mut self, loader: impl DocumentLoader + 'static) {
        self.loader = Some(Box::new(loader));
    }

    /// Run a stored sequence: flatten its block sequences into an ordered
    /// execution list, then execute block by block. Branch blocks splice
    /// the taken branch's blocks in at the current position. Side effects
    /// committed by earlier blocks are not rolled back on failure.
    pub fn dispatch(&self, store: &mut Store, request: DispatchRequest) -> Result<DispatchOutcome> {
        let mut fetched: HashSet<(String, String)> = HashSet::new();

        let sequence = self
            .load_document(store, SEQUENCES, &request.id, &mut fetched)?
            .ok_or_else(|| FlowstateError::SequenceNotFound {
                id: request.id.clone(),
            })?;
        let block_sequence_ids: Vec<String> = serde_json::from_value(sequence)?;

        let mut queue: VecDeque<String> = VecDeque::new();
        for block_sequence_id in &block_sequence_ids {
            queue.extend(self.load_block_sequence(store, block_sequence_id, &mut fetched)?);
        }

        let mut block_values: HashMap<String, Value> = HashMap::new();
        while let Some(block_id) = queue.pop_front() {
            let block_value = self
                .load_document(store, BLOCKS, &block_id, &mut fetched)?
                .ok_or_else(|| FlowstateError::BlockNotFound {
                    id: block_id.clone(),
                })?;
            let block: Block = serde_json::from_value(block_value)?;

            if let Some(if_else) = &block.if_else {
                let taken =
                    evaluate_conditions(&if_else.conditions, &request.context, &request.payload)?;
                let branch = if taken { &if_else.then } else { &if_else.else_ };
                let mut spliced = Vec::new();
                for block_sequence_id in branch {
                    spliced.extend(self.load_block_sequence(
                        store,
                        block_sequence_id,
                        &mut fetched,
                    )?);
                }
                for id in spliced.into_iter().rev() {
                    queue.push_front(id);
                }
            } else if let Some(method_name) = &block.method {
                let value = self.resolve_block_value(store, &block, &block_values, &mut fetched)?;
                let method = self.methods.get(method_name).ok_or_else(|| {
                    FlowstateError::MethodNotFound {
                        method: method_name.clone(),
                    }
                })?;
                let args = MethodArgs {
                    block_id: &block_id,
                    value,
                    context: &request.context,
                    payload: &request.payload,
                };
                let result =
                    method
                        .call(store, args)
                        .map_err(|source| FlowstateError::ActionFailure {
                            block_id: block_id.clone(),
                            method: method_name.clone(),
                            source: Box::new(source),
                        })?;
                block_values.insert(block_id.clone(), result);
            } else {
                log::warn!("Block '{block_id}' has neither method nor ifElse, skipping");
            }
        }

        if request.clear_block_values {
            block_values.clear();
        }
        Ok(DispatchOutcome { block_values })
    }

    /// Resolve a block's effective value: collected references, a single
    /// reference, or the literal.
    fn resolve_block_value(
        &self,
        store: &mut Store,
        block: &Block,
        cache: &HashMap<String, Value>,
        fetched: &mut HashSet<(String, String)>,
    ) -> Result<Value> {
        if let Some(references) = &block.block_values {
            return match block.data_type {
                Some(DataKind::Object) => {
                    let mut object = serde_json::Map::new();
                    for reference in references {
                        let (key, value) = self.lookup_reference(store, cache, reference, fetched)?;
                        object.insert(key, value);
                    }
                    Ok(Value::Object(object))
                }
                _ => {
                    let mut array = Vec::new();
                    for reference in references {
                        let (_, value) = self.lookup_reference(store, cache, reference, fetched)?;
                        array.push(value);
                    }
                    Ok(Value::Array(array))
                }
            };
        }
        if let Some(reference) = &block.block_value {
            let (_, value) = self.lookup_reference(store, cache, reference, fetched)?;
            return Ok(value);
        }
        Ok(block.value.clone().unwrap_or(Value::Null))
    }

    /// A referenced block's value: the in-flight cache first, the stored
    /// block's literal value on a miss. Returns the referenced block's
    /// key (falling back to its id) for object collection.
    fn lookup_reference(
        &self,
        store: &mut Store,
        cache: &HashMap<String, Value>,
        reference: &str,
        fetched: &mut HashSet<(String, String)>,
    ) -> Result<(String, Value)> {
        let stored = self.load_document(store, BLOCKS, reference, fetched)?;
        let key = stored
            .as_ref()
            .and_then(|value| serde_json::from_value::<Block>(value.clone()).ok())
            .and_then(|block| block.key)
            .unwrap_or_else(|| reference.to_string());

        if let Some(cached) = cache.get(reference) {
            return Ok((key, cached.clone()));
        }
        let value = match stored {
            Some(value) => serde_json::from_value::<Block>(value)
                .ok()
                .and_then(|block| block.value)
                .unwrap_or(Value::Null),
            None => {
                log::debug!("Referenced block '{reference}' not found, substituting null");
                Value::Null
            }
        };
        Ok((key, value))
    }

    fn load_block_sequence(
        &self,
        store: &mut Store,
        id: &str,
        fetched: &mut HashSet<(String, String)>,
    ) -> Result<Vec<String>> {
        let value = self
            .load_document(store, BLOCK_SEQUENCES, id, fetched)?
            .ok_or_else(|| FlowstateError::SequenceNotFound { id: id.to_string() })?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fetch-or-load: the store first, then the remote loader (at most
    /// once per key per dispatch), then one retry against the store.
    fn load_document(
        &self,
        store: &mut Store,
        collection: &str,
        id: &str,
        fetched: &mut HashSet<(String, String)>,
    ) -> Result<Option<Value>> {
        if let GetResult::One(value) = store.get_value(collection, Some(id), GetOptions::default())?
        {
            return Ok(Some((*value.item).clone()));
        }

        let key = (collection.to_string(), id.to_string());
        if fetched.contains(&key) {
            return Ok(None);
        }
        fetched.insert(key);

        let Some(loader) = &self.loader else {
            return Ok(None);
        };
        let Some(value) = loader.fetch(collection, id)? else {
            return Ok(None);
        };
        store.set_value(
            collection,
            value,
            SetOptions {
                id: Some(id.to_string()),
                ..SetOptions::default()
            },
        )?;

        match store.get_value(collection, Some(id), GetOptions::default())? {
            GetResult::One(value) => Ok(Some((*value.item).clone())),
            _ => Ok(None),
        }
    }
}

/// Resolve one condition operand. Strings prefixed `context.`/`payload.`
/// are dotted lookups into the respective value; bare strings are tried
/// against context then payload, then taken literally.
fn resolve_operand(operand: &Value, context: &Value, payload: &Value) -> Value {
    if let Some(s) = operand.as_str() {
        if let Some(rest) = s.strip_prefix("context.") {
            return util::get_path(context, rest).cloned().unwrap_or(Value::Null);
        }
        if let Some(rest) = s.strip_prefix("payload.") {
            return util::get_path(payload, rest).cloned().unwrap_or(Value::Null);
        }
        if let Some(found) = util::get_path(context, s) {
            return found.clone();
        }
        if let Some(found) = util::get_path(payload, s) {
            return found.clone();
        }
    }
    operand.clone()
}

/// Evaluate a condition list. Operands are grouped pairwise by explicit
/// `andOr` operators; the groups combine as: true if any OR group is
/// true, else true if at least one AND group exists and all AND groups
/// are true. An operand pair without an operator between them is an
/// error.
fn evaluate_conditions(entries: &[ConditionEntry], context: &Value, payload: &Value) -> Result<bool> {
    let mut groups: Vec<(LogicalOp, bool)> = Vec::new();
    let mut first: Option<bool> = None;
    let mut pending_op: Option<LogicalOp> = None;

    for entry in entries {
        match entry {
            ConditionEntry::Logical { and_or } => pending_op = Some(*and_or),
            ConditionEntry::Compare { op, left, right } => {
                let value = query::compare(
                    *op,
                    &resolve_operand(left, context, payload),
                    &resolve_operand(right, context, payload),
                );
                match (first.take(), pending_op.take()) {
                    (None, keep) => {
                        first = Some(value);
                        pending_op = keep;
                    }
                    (Some(first_value), Some(op)) => {
                        let pair = match op {
                            LogicalOp::And => first_value && value,
                            LogicalOp::Or => first_value || value,
                        };
                        groups.push((op, pair));
                    }
                    (Some(_), None) => return Err(FlowstateError::MissingConditionOperator),
                }
            }
        }
    }

    match (first, pending_op) {
        // A trailing lone operand after an operator joins as a group of
        // that operator's kind.
        (Some(value), Some(op)) => groups.push((op, value)),
        (Some(value), None) => {
            if groups.is_empty() {
                return Ok(value);
            }
            return Err(FlowstateError::MissingConditionOperator);
        }
        (None, _) => {}
    }

    if groups.is_empty() {
        return Ok(false);
    }
    // OR dominates AND at the top level.
    if groups.iter().any(|(op, v)| *op == LogicalOp::Or && *v) {
        return Ok(true);
    }
    let and_groups: Vec<bool> = groups
        .iter()
        .filter(|(op, _)| *op == LogicalOp::And)
        .map(|(_, v)| *v)
        .collect();
    Ok(!and_groups.is_empty() && and_groups.iter().all(|v| *v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::cell::RefCell;

    fn setup() -> (Store, ActionEngine) {
        let mut store = Store::from_schema_str("collections: {}").unwrap();
        let engine = ActionEngine::new();
        engine.install(&mut store).unwrap();
        (store, engine)
    }

    fn seed(store: &mut Store, collection: &str, id: &str, value: Value) {
        store
            .set_value(
                collection,
                value,
                SetOptions {
                    id: Some(id.into()),
                    ..SetOptions::default()
                },
            )
            .unwrap();
    }

    /// Register a method that records its resolved value and returns it.
    fn recording_engine(engine: &mut ActionEngine) -> Rc<RefCell<Vec<Value>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        engine.register_fn("record", move |_store, args| {
            sink.borrow_mut().push(args.value.clone());
            Ok(args.value)
        });
        log
    }

    fn compare(op: Op, left: Value, right: Value) -> ConditionEntry {
        ConditionEntry::Compare { op, left, right }
    }

    fn logical(and_or: LogicalOp) -> ConditionEntry {
        ConditionEntry::Logical { and_or }
    }

    #[test]
    fn test_sequential_execution_order() {
        let (mut store, mut engine) = setup();
        let log = recording_engine(&mut engine);

        for (id, value) in [("b1", "one"), ("b2", "two"), ("b3", "three")] {
            seed(
                &mut store,
                BLOCKS,
                id,
                json!({"method": "record", "value": value}),
            );
        }
        seed(&mut store, BLOCK_SEQUENCES, "bs1", json!(["b1", "b2"]));
        seed(&mut store, BLOCK_SEQUENCES, "bs2", json!(["b3"]));
        seed(&mut store, SEQUENCES, "s1", json!(["bs1", "bs2"]));

        let outcome = engine
            .dispatch(&mut store, DispatchRequest::new("s1"))
            .unwrap();

        assert_eq!(*log.borrow(), vec![json!("one"), json!("two"), json!("three")]);
        assert_eq!(outcome.block_values["b2"], json!("two"));
    }

    #[test]
    fn test_conditional_dispatch_takes_exactly_one_branch() {
        let (mut store, mut engine) = setup();
        let log = recording_engine(&mut engine);

        seed(
            &mut store,
            BLOCKS,
            "b_if",
            json!({"ifElse": {
                "if": [{"op": "==", "left": "context.role", "right": "admin"}],
                "then": ["bsA"],
                "else": ["bsB"]
            }}),
        );
        seed(&mut store, BLOCKS, "bA", json!({"method": "record", "value": "A"}));
        seed(&mut store, BLOCKS, "bB", json!({"method": "record", "value": "B"}));
        seed(&mut store, BLOCK_SEQUENCES, "bs0", json!(["b_if"]));
        seed(&mut store, BLOCK_SEQUENCES, "bsA", json!(["bA"]));
        seed(&mut store, BLOCK_SEQUENCES, "bsB", json!(["bB"]));
        seed(&mut store, SEQUENCES, "s1", json!(["bs0"]));

        engine
            .dispatch(
                &mut store,
                DispatchRequest::new("s1").with_context(json!({"role": "admin"})),
            )
            .unwrap();
        assert_eq!(*log.borrow(), vec![json!("A")]);

        log.borrow_mut().clear();
        engine
            .dispatch(
                &mut store,
                DispatchRequest::new("s1").with_context(json!({"role": "guest"})),
            )
            .unwrap();
        assert_eq!(*log.borrow(), vec![json!("B")]);
    }

    #[test]
    fn test_branch_blocks_splice_before_remaining() {
        let (mut store, mut engine) = setup();
        let log = recording_engine(&mut engine);

        seed(
            &mut store,
            BLOCKS,
            "b_if",
            json!({"ifElse": {
                "if": [{"op": "==", "left": 1, "right": 1}],
                "then": ["bs_branch"],
                "else": []
            }}),
        );
        seed(&mut store, BLOCKS, "b_branch", json!({"method": "record", "value": "branch"}));
        seed(&mut store, BLOCKS, "b_after", json!({"method": "record", "value": "after"}));
        seed(&mut store, BLOCK_SEQUENCES, "bs_main", json!(["b_if", "b_after"]));
        seed(&mut store, BLOCK_SEQUENCES, "bs_branch", json!(["b_branch"]));
        seed(&mut store, SEQUENCES, "s1", json!(["bs_main"]));

        engine
            .dispatch(&mut store, DispatchRequest::new("s1"))
            .unwrap();
        // The taken branch runs at the branch position, not at the end.
        assert_eq!(*log.borrow(), vec![json!("branch"), json!("after")]);
    }

    #[test]
    fn test_block_value_collection() {
        let (mut store, mut engine) = setup();
        let log = recording_engine(&mut engine);

        seed(&mut store, BLOCKS, "b1", json!({"key": "first", "method": "record", "value": 42}));
        seed(&mut store, BLOCKS, "b_lit", json!({"key": "lit", "value": "x"}));
        seed(
            &mut store,
            BLOCKS,
            "b_collect",
            json!({"method": "record", "blockValues": ["b1", "b_lit"], "dataType": "object"}),
        );
        seed(
            &mut store,
            BLOCKS,
            "b_array",
            json!({"method": "record", "blockValues": ["b1", "b_lit"], "dataType": "array"}),
        );
        seed(
            &mut store,
            BLOCK_SEQUENCES,
            "bs1",
            json!(["b1", "b_collect", "b_array"]),
        );
        seed(&mut store, SEQUENCES, "s1", json!(["bs1"]));

        engine
            .dispatch(&mut store, DispatchRequest::new("s1"))
            .unwrap();

        let log = log.borrow();
        // b1 executed (42), then collected: cache hit for b1, literal for b_lit.
        assert_eq!(log[1], json!({"first": 42, "lit": "x"}));
        assert_eq!(log[2], json!([42, "x"]));
    }

    #[test]
    fn test_single_block_value_reference() {
        let (mut store, mut engine) = setup();
        let log = recording_engine(&mut engine);

        seed(&mut store, BLOCKS, "b1", json!({"method": "record", "value": "cached"}));
        seed(&mut store, BLOCKS, "b2", json!({"method": "record", "blockValue": "b1"}));
        seed(&mut store, BLOCK_SEQUENCES, "bs1", json!(["b1", "b2"]));
        seed(&mut store, SEQUENCES, "s1", json!(["bs1"]));

        engine
            .dispatch(&mut store, DispatchRequest::new("s1"))
            .unwrap();
        assert_eq!(*log.borrow(), vec![json!("cached"), json!("cached")]);
    }

    #[test]
    fn test_missing_sequence_is_fatal() {
        let (mut store, engine) = setup();
        let err = engine
            .dispatch(&mut store, DispatchRequest::new("nope"))
            .unwrap_err();
        assert_eq!(err.code(), "ACTION_SEQUENCE");
    }

    #[test]
    fn test_missing_method_is_fatal() {
        let (mut store, engine) = setup();
        seed(&mut store, BLOCKS, "b1", json!({"method": "unregistered"}));
        seed(&mut store, BLOCK_SEQUENCES, "bs1", json!(["b1"]));
        seed(&mut store, SEQUENCES, "s1", json!(["bs1"]));

        let err = engine
            .dispatch(&mut store, DispatchRequest::new("s1"))
            .unwrap_err();
        assert_eq!(err.code(), "ACTION_METHOD");
    }

    #[test]
    fn test_method_failure_is_wrapped_with_context() {
        let (mut store, mut engine) = setup();
        engine.register_fn("boom", |_store, _args| {
            Err(FlowstateError::Other("exploded".into()))
        });
        seed(&mut store, BLOCKS, "b1", json!({"method": "boom"}));
        seed(&mut store, BLOCK_SEQUENCES, "bs1", json!(["b1"]));
        seed(&mut store, SEQUENCES, "s1", json!(["bs1"]));

        let err = engine
            .dispatch(&mut store, DispatchRequest::new("s1"))
            .unwrap_err();
        assert_eq!(err.code(), "ACTION_FAILURE");
        let message = err.to_string();
        assert!(message.contains("b1"));
        assert!(message.contains("boom"));
    }

    #[test]
    fn test_earlier_side_effects_survive_failure() {
        let (mut store, mut engine) = setup();
        let log = recording_engine(&mut engine);
        engine.register_fn("boom", |_store, _args| {
            Err(FlowstateError::Other("exploded".into()))
        });

        seed(&mut store, BLOCKS, "b1", json!({"method": "record", "value": "ran"}));
        seed(&mut store, BLOCKS, "b2", json!({"method": "boom"}));
        seed(&mut store, BLOCK_SEQUENCES, "bs1", json!(["b1", "b2"]));
        seed(&mut store, SEQUENCES, "s1", json!(["bs1"]));

        assert!(engine.dispatch(&mut store, DispatchRequest::new("s1")).is_err());
        // No rollback of committed work.
        assert_eq!(*log.borrow(), vec![json!("ran")]);
    }

    #[test]
    fn test_block_without_method_or_branch_is_skipped() {
        let (mut store, mut engine) = setup();
        let log = recording_engine(&mut engine);

        seed(&mut store, BLOCKS, "b_noop", json!({"value": "ignored"}));
        seed(&mut store, BLOCKS, "b1", json!({"method": "record", "value": "ran"}));
        seed(&mut store, BLOCK_SEQUENCES, "bs1", json!(["b_noop", "b1"]));
        seed(&mut store, SEQUENCES, "s1", json!(["bs1"]));

        engine
            .dispatch(&mut store, DispatchRequest::new("s1"))
            .unwrap();
        assert_eq!(*log.borrow(), vec![json!("ran")]);
    }

    #[test]
    fn test_clear_block_values() {
        let (mut store, mut engine) = setup();
        recording_engine(&mut engine);

        seed(&mut store, BLOCKS, "b1", json!({"method": "record", "value": 1}));
        seed(&mut store, BLOCK_SEQUENCES, "bs1", json!(["b1"]));
        seed(&mut store, SEQUENCES, "s1", json!(["bs1"]));

        let mut request = DispatchRequest::new("s1");
        request.clear_block_values = true;
        let outcome = engine.dispatch(&mut store, request).unwrap();
        assert!(outcome.block_values.is_empty());
    }

    struct CountingLoader {
        calls: Rc<RefCell<Vec<(String, String)>>>,
        documents: HashMap<(String, String), Value>,
    }

    impl DocumentLoader for CountingLoader {
        fn fetch(&self, collection: &str, id: &str) -> Result<Option<Value>> {
            self.calls
                .borrow_mut()
                .push((collection.to_string(), id.to_string()));
            Ok(self
                .documents
                .get(&(collection.to_string(), id.to_string()))
                .cloned())
        }
    }

    #[test]
    fn test_loader_supplies_missing_documents_once() {
        let (mut store, mut engine) = setup();
        let log = recording_engine(&mut engine);

        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut documents = HashMap::new();
        documents.insert(
            ("sequences".to_string(), "s1".to_string()),
            json!(["bs1"]),
        );
        documents.insert(
            ("blockSequences".to_string(), "bs1".to_string()),
            json!(["b1"]),
        );
        documents.insert(
            ("blocks".to_string(), "b1".to_string()),
            json!({"method": "record", "value": "fetched"}),
        );
        engine.set_loader(CountingLoader {
            calls: Rc::clone(&calls),
            documents,
        });

        engine
            .dispatch(&mut store, DispatchRequest::new("s1"))
            .unwrap();
        assert_eq!(*log.borrow(), vec![json!("fetched")]);
        // One fetch per missing key, and the documents are now persisted.
        assert_eq!(calls.borrow().len(), 3);
        assert!(!store
            .get_value(SEQUENCES, Some("s1"), GetOptions::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_loader_miss_stays_fatal() {
        let (mut store, mut engine) = setup();
        engine.set_loader(CountingLoader {
            calls: Rc::new(RefCell::new(Vec::new())),
            documents: HashMap::new(),
        });
        let err = engine
            .dispatch(&mut store, DispatchRequest::new("absent"))
            .unwrap_err();
        assert_eq!(err.code(), "ACTION_SEQUENCE");
    }

    #[test]
    fn test_single_condition() {
        let context = json!({"role": "admin"});
        let entries = vec![compare(Op::Eq, json!("context.role"), json!("admin"))];
        assert!(evaluate_conditions(&entries, &context, &Value::Null).unwrap());

        let entries = vec![compare(Op::Eq, json!("context.role"), json!("guest"))];
        assert!(!evaluate_conditions(&entries, &context, &Value::Null).unwrap());
    }

    #[test]
    fn test_operand_resolution_order() {
        let context = json!({"a": 1, "shared": "from-context"});
        let payload = json!({"b": 2, "shared": "from-payload"});

        assert_eq!(resolve_operand(&json!("context.a"), &context, &payload), json!(1));
        assert_eq!(resolve_operand(&json!("payload.b"), &context, &payload), json!(2));
        // Bare paths try context before payload.
        assert_eq!(
            resolve_operand(&json!("shared"), &context, &payload),
            json!("from-context")
        );
        assert_eq!(resolve_operand(&json!("b"), &context, &payload), json!(2));
        // Unresolvable strings and non-strings are literals.
        assert_eq!(
            resolve_operand(&json!("plain"), &context, &payload),
            json!("plain")
        );
        assert_eq!(resolve_operand(&json!(7), &context, &payload), json!(7));
    }

    #[test]
    fn test_and_pairs_must_all_hold() {
        let entries = vec![
            compare(Op::Eq, json!(1), json!(1)),
            logical(LogicalOp::And),
            compare(Op::Eq, json!(2), json!(2)),
            compare(Op::Eq, json!(3), json!(3)),
            logical(LogicalOp::And),
            compare(Op::Eq, json!(4), json!(5)),
        ];
        assert!(!evaluate_conditions(&entries, &Value::Null, &Value::Null).unwrap());
    }

    #[test]
    fn test_or_dominates_and() {
        // A failing AND pair is overruled by a passing OR pair.
        let entries = vec![
            compare(Op::Eq, json!(1), json!(2)),
            logical(LogicalOp::And),
            compare(Op::Eq, json!(1), json!(1)),
            compare(Op::Eq, json!(9), json!(9)),
            logical(LogicalOp::Or),
            compare(Op::Eq, json!(0), json!(1)),
        ];
        assert!(evaluate_conditions(&entries, &Value::Null, &Value::Null).unwrap());
    }

    #[test]
    fn test_adjacent_operands_without_operator_error() {
        let entries = vec![
            compare(Op::Eq, json!(1), json!(1)),
            compare(Op::Eq, json!(2), json!(2)),
        ];
        let err = evaluate_conditions(&entries, &Value::Null, &Value::Null).unwrap_err();
        assert_eq!(err.code(), "ACTION_CONDITION");
    }

    #[test]
    fn test_empty_conditions_are_false() {
        assert!(!evaluate_conditions(&[], &Value::Null, &Value::Null).unwrap());
    }
}
