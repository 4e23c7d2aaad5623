//! Complete counter application: a typed store, labelled updates and persistence

use cannery::middleware::{persist, MemoryStorage, PersistOptions};
use cannery::{Next, State, Store};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CounterState {
    count: i32,
    step: i32,
    history: Vec<i32>,
}

#[derive(Default, Deserialize)]
struct CounterPatch {
    count: Option<i32>,
    step: Option<i32>,
    history: Option<Vec<i32>>,
}

impl State for CounterState {
    type Patch = CounterPatch;

    fn merge(&mut self, patch: CounterPatch) {
        if let Some(count) = patch.count {
            self.count = count;
        }
        if let Some(step) = patch.step {
            self.step = step;
        }
        if let Some(history) = patch.history {
            self.history = history;
        }
    }
}

impl CounterState {
    fn new() -> Self {
        Self {
            count: 0,
            step: 1,
            history: vec![0],
        }
    }

    fn moved_by(&self, delta: i32) -> Next<Self> {
        let count = self.count + delta;
        let mut history = self.history.clone();
        history.push(count);
        Next::Merge(CounterPatch {
            count: Some(count),
            history: Some(history),
            ..Default::default()
        })
    }
}

fn increment(store: &Store<CounterState>) {
    store.set_state_as("increment", |s| Some(s.moved_by(s.step)));
}

fn decrement(store: &Store<CounterState>) {
    store.set_state_as("decrement", |s| Some(s.moved_by(-s.step)));
}

#[tokio::main]
async fn main() {
    println!("=== Complete Counter Application ===\n");

    println!("1. Restoring a counter from storage");
    let storage = MemoryStorage::new().with(
        "counter",
        r#"{"state":{"count":3,"step":1,"history":[0,1,2,3]},"version":0}"#,
    );
    let store = Store::new(CounterState::new());
    let persisted = persist(&store, PersistOptions::new("counter", storage.clone()));
    persisted.wait_for_hydration().await;
    store.read(|s| println!("   Restored count: {}, history: {:?}", s.count, s.history));

    // Log every change together with the label that caused it
    let _logger = store.subscribe_changes(|change| {
        println!(
            "   [{}] {} -> {}",
            change.label.unwrap_or("anonymous"),
            change.previous.count,
            change.state.count
        );
    });

    println!("\n2. Incrementing...");
    increment(&store);
    increment(&store);

    println!("\n3. Changing step size to 5");
    store.set_state_as("set-step", |_| {
        Some(Next::Merge(CounterPatch {
            step: Some(5),
            ..Default::default()
        }))
    });

    println!("\n4. Incrementing with new step...");
    increment(&store);

    println!("\n5. Decrementing...");
    decrement(&store);
    decrement(&store);

    println!("\n6. An updater that returns nothing publishes nothing");
    store.update(|s| if s.count > 100 { Some(s.moved_by(-100)) } else { None });

    println!("\n7. History:");
    store.read(|state| {
        println!("   {:?}", state.history);
    });

    println!("\n8. Resetting...");
    store.set_state_as("reset", |_| Some(Next::Replace(CounterState::new())));

    // Give the background writer a moment to flush
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    println!("\n9. Persisted snapshot:");
    println!("   {}", storage.peek("counter").unwrap_or_default());

    println!("\n✓ Counter application complete!");
}
