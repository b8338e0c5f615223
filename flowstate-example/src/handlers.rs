use flowstate::{ActionEngine, FlowstateError, GetOptions, SetOptions, Store};
use serde_json::{json, Value};

/// Register the action methods the stored workflows call into.
pub fn register(engine: &mut ActionEngine) {
    // Write a document into the collection named by value.collection.
    engine.register_fn("state_setValue", |store: &mut Store, args| {
        let collection = args.value["collection"]
            .as_str()
            .ok_or_else(|| FlowstateError::Other("state_setValue needs a collection".into()))?
            .to_string();
        let id = args.value["id"].as_str().map(String::from);
        let item = args.value["item"].clone();
        let result = store.set_value(
            &collection,
            item,
            SetOptions {
                id,
                ..SetOptions::default()
            },
        )?;
        Ok(json!({"id": result.id, "isValid": result.is_valid}))
    });

    // Read a document; the result becomes the block's cached value.
    engine.register_fn("state_getValue", |store: &mut Store, args| {
        let collection = args.value["collection"]
            .as_str()
            .ok_or_else(|| FlowstateError::Other("state_getValue needs a collection".into()))?;
        let id = args.value["id"].as_str();
        let result = store.get_value(collection, id, GetOptions::default())?;
        Ok(result
            .into_one()
            .map(|value| (*value.item).clone())
            .unwrap_or(Value::Null))
    });

    // Append a line to the audit trail collection.
    engine.register_fn("audit_log", |store: &mut Store, args| {
        let message = args.value.as_str().unwrap_or("").to_string();
        log::info!("audit: {message}");
        let result = store.set_value("audit", json!({ "message": message }), SetOptions::default())?;
        Ok(json!(result.id))
    });
}
