//! A `callMethod` carrying a stale fingerprint forces a full resync to freshly
//! initialized state before the invoked method runs.

mod support;

use serde_json::json;
use support::TestClient;

#[tokio::test]
async fn stale_fingerprint_forces_reinitialization() {
    let url = support::start_server().await;
    let mut client = TestClient::connect(&url).await;

    client.send("getInitialState", json!({ "componentName": "Counter", "props": { "initial": 5 } })).await;
    let initial = client.recv().await;
    let id = initial["payload"]["$ID"].as_str().unwrap().to_string();

    client
        .send(
            "callMethod",
            json!({ "name": "Counter", "id": id, "methodName": "increment", "params": [3] }),
        )
        .await;
    let bumped = client.recv().await;
    assert_eq!(bumped["payload"]["toVersion"], 2);
    assert_eq!(bumped["payload"]["patch"][0]["value"], 8);

    client
        .send(
            "callMethod",
            json!({
                "name": "Counter",
                "id": id,
                "methodName": "increment",
                "params": [0],
                "fingerprint": "stale-or-fabricated-fingerprint",
                "hydrationAttempt": true,
            }),
        )
        .await;

    let resync = client.recv().await;
    assert_eq!(resync["type"], "state_update");
    assert_eq!(resync["payload"]["full"], true);
    assert_eq!(resync["payload"]["fromVersion"], 2);
    assert_eq!(resync["payload"]["toVersion"], 3);
    assert_eq!(
        resync["payload"]["state"]["count"], 5,
        "reinitialization must reapply initialState(props), not keep the mutated value"
    );
    assert!(resync["payload"].get("patch").is_none(), "a full resync carries state, not a patch");
}
