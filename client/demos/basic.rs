//! Basic Live Component Runtime client example.
//!
//! Connects to a running runtime, mounts a `Counter` instance, invokes
//! `increment` a few times, and prints the state updates it observes.
//!
//! ```bash
//! cargo run -p live-component-runtime &
//! cargo run --example basic
//! ```

use serde_json::json;
use live_component_runtime_client::LiveClient;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let client = LiveClient::connect("ws://127.0.0.1:8787/ws").await;

    let initial = client
        .get_initial_state("Counter", json!({ "initial": 5 }), None)
        .await
        .expect("getInitialState failed");
    println!("mounted {} as {} — state: {}", initial.component_name, initial.id, initial.state);

    let mut events = client.events();
    tokio::spawn(async move {
        while let Ok(ev) = events.recv().await {
            println!("event {:?}: {} {}", ev.scope, ev.name, ev.data);
        }
    });

    for delta in [1, 2, 3] {
        let result = client
            .call_method("Counter", &initial.id, "increment", vec![json!(delta)], None, false)
            .await
            .expect("increment failed");
        let state = client.cached_state(&initial.id).await;
        println!("increment({delta}) -> {result:?}, state now {state:?}");
    }
}
