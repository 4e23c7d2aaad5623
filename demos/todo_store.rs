//! A todo list built from slices, driven by a reducer and mirrored to devtools

use cannery::middleware::{devtools, DevtoolsConnection, DevtoolsMessage, DevtoolsOptions};
use cannery::reducer::{EffectAction, ReducerEffect};
use cannery::{combine_slices, create_slice, DevtoolsError, FieldUpdate, Record, Store, StoreApi};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Prints everything the bridge sends instead of talking to a real extension.
struct ConsoleDevtools;

impl DevtoolsConnection for ConsoleDevtools {
    fn init(&self, state: &Value) -> Result<(), DevtoolsError> {
        println!("   [devtools] init {state}");
        Ok(())
    }

    fn send(&self, action: &str, state: &Value) -> Result<(), DevtoolsError> {
        println!("   [devtools] {action}: {state}");
        Ok(())
    }
}

#[derive(Debug)]
enum Action {
    Add(&'static str),
    Toggle(usize),
    Save,
}

impl EffectAction for Action {
    fn runs_effect(&self) -> bool {
        matches!(self, Action::Save)
    }
}

fn todos(state: &Record, action: &Action) -> Record {
    let mut items = state
        .get("items")
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();
    match action {
        Action::Add(title) => items.push(json!({ "title": title, "done": false })),
        Action::Toggle(index) => {
            if let Some(item) = items.get_mut(*index) {
                item["done"] = json!(!item["done"].as_bool().unwrap_or(false));
            }
        }
        Action::Save => return state.clone(),
    }
    let mut next = state.clone();
    next.insert("items", Value::Array(items));
    next
}

#[tokio::main]
async fn main() {
    println!("=== Todo Store Example ===\n");

    println!("1. Combining slices into one store");
    let filter = create_slice(|api: &StoreApi<Record>| {
        let api = api.clone();
        Record::new()
            .with("filter", "all")
            .with_action("set_filter", move |payload| {
                api.set_state_selective("filter", payload);
            })
    });
    let stats = create_slice(|api: &StoreApi<Record>| {
        let api = api.clone();
        Record::new().with("views", 0).with_action("viewed", move |_| {
            api.set_state_selective(
                "views",
                FieldUpdate::with(|v: Option<Value>| {
                    json!(v.and_then(|v| v.as_i64()).unwrap_or(0) + 1)
                }),
            );
        })
    });
    let ui = Store::create(combine_slices([("filter", filter), ("stats", stats)]));
    ui.get_state().call("set_filter", json!("open"));
    ui.get_state().call("viewed", Value::Null);
    println!("   ui state: {}", ui.get_state().to_json());

    println!("\n2. A reducer with a save effect");
    let list = ReducerEffect::builder(Record::new().with("items", json!([])), todos)
        .effect(|state: &Record, _| {
            let count = state
                .get("items")
                .and_then(|v| v.as_array().map(|items| items.len()))
                .unwrap_or(0);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, String>(count)
            }
        })
        .on_success(|saved: &usize, _, _| println!("   [save] wrote {saved} items"))
        .on_error(|error: &String, _, _| println!("   [save] failed: {error}"))
        .build();

    println!("\n3. Connecting devtools");
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let connection: Arc<dyn DevtoolsConnection> = Arc::new(ConsoleDevtools);
    let _devtools = devtools(
        list.store(),
        DevtoolsOptions::default().with_name("todos"),
        Some(connection),
        Some(rx),
    );

    println!("\n4. Dispatching actions");
    list.dispatch(Action::Add("write the store"));
    list.dispatch(Action::Add("write the docs"));
    list.dispatch(Action::Toggle(0));
    list.dispatch(Action::Save);
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("\n5. Jumping back in time from devtools (not echoed)");
    tx.send(DevtoolsMessage::JumpToState(
        r#"{"items":[{"title":"write the store","done":false}]}"#.into(),
    ))
    .await
    .ok();
    tokio::time::sleep(Duration::from_millis(10)).await;
    println!("   items now: {}", list.get_state().to_json()["items"]);

    println!("\n✓ Todo store complete!");
}
