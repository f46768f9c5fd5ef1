//! A client mounts a `Counter` instance and calls `increment`; the server replies
//! with the expected initial state, then a state patch reflecting the mutation.

mod support;

use serde_json::json;
use support::TestClient;

#[tokio::test]
async fn increment_produces_expected_patch() {
    let url = support::start_server().await;
    let mut client = TestClient::connect(&url).await;

    client.send("getInitialState", json!({ "componentName": "Counter", "props": { "initial": 5 } })).await;
    let initial = client.recv().await;
    assert_eq!(initial["type"], "initial_state");
    assert_eq!(initial["payload"]["state"]["count"], 5);
    let id = initial["payload"]["$ID"].as_str().expect("$ID present").to_string();
    assert!(!id.is_empty());

    client
        .send(
            "callMethod",
            json!({ "name": "Counter", "id": id, "methodName": "increment", "params": [3] }),
        )
        .await;
    let update = client.recv().await;
    assert_eq!(update["type"], "state_update");
    assert_eq!(update["payload"]["toVersion"], 2);
    assert_eq!(update["payload"]["full"], false);
    let patch = update["payload"]["patch"].as_array().expect("patch present");
    assert_eq!(patch.len(), 1);
    assert_eq!(patch[0]["op"], "replace");
    assert_eq!(patch[0]["path"], "/count");
    assert_eq!(patch[0]["value"], 8);
}
