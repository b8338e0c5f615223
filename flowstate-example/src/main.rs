use flowstate::{ActionEngine, DispatchRequest, GetResult, GetOptions, SetOptions, Store};
use serde_json::json;

mod handlers;

const SCHEMA: &str = r#"
collections:
  users:
    type: collection
    id: { prefix: "usr_", auto: nanoid }
    items:
      type: object
      properties:
        - { name: name, type: string, required: true }
        - { name: plan, type: string, default: free }
      additional_properties: false

  audit:
    type: collection
    items:
      type: object
      properties:
        - { name: message, type: string, required: true }
"#;

fn main() -> flowstate::Result<()> {
    env_logger::init();
    log::info!("Starting flowstate example");

    let mut store = Store::from_schema_str(SCHEMA)?;
    let mut engine = ActionEngine::new();
    engine.install(&mut store)?;
    handlers::register(&mut engine);

    seed_workflow(&mut store)?;

    // An onboarding run for a paying user, then one for a free user.
    for plan in ["pro", "free"] {
        let outcome = engine.dispatch(
            &mut store,
            DispatchRequest::new("user_onboarding")
                .with_context(json!({"source": "example"}))
                .with_payload(json!({"name": "Alice", "plan": plan})),
        )?;
        log::info!("onboarding({plan}) block values: {:?}", outcome.block_values);
    }

    if let GetResult::Many(entries) = store.get_value("audit", None, GetOptions::default())? {
        for entry in entries {
            log::info!("audit trail: {}", entry.item["message"]);
        }
    }

    Ok(())
}

/// Persist the onboarding workflow: create the user, then branch on the
/// requested plan.
fn seed_workflow(store: &mut Store) -> flowstate::Result<()> {
    let set = |store: &mut Store, collection: &str, id: &str, value: serde_json::Value| {
        store
            .set_value(
                collection,
                value,
                SetOptions {
                    id: Some(id.into()),
                    ..SetOptions::default()
                },
            )
            .map(|_| ())
    };

    set(
        store,
        "blocks",
        "create_user",
        json!({
            "method": "state_setValue",
            "value": {
                "collection": "users",
                "item": {"name": "Alice", "plan": "free"}
            }
        }),
    )?;
    set(
        store,
        "blocks",
        "plan_branch",
        json!({
            "ifElse": {
                "if": [{"op": "==", "left": "payload.plan", "right": "pro"}],
                "then": ["bs_pro"],
                "else": ["bs_free"]
            }
        }),
    )?;
    set(
        store,
        "blocks",
        "audit_pro",
        json!({"method": "audit_log", "value": "onboarded a pro user"}),
    )?;
    set(
        store,
        "blocks",
        "audit_free",
        json!({"method": "audit_log", "value": "onboarded a free user"}),
    )?;

    set(store, "blockSequences", "bs_main", json!(["create_user", "plan_branch"]))?;
    set(store, "blockSequences", "bs_pro", json!(["audit_pro"]))?;
    set(store, "blockSequences", "bs_free", json!(["audit_free"]))?;
    set(store, "sequences", "user_onboarding", json!(["bs_main"]))?;

    Ok(())
}
