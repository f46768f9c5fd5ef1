//! Two connections subscribed to the same instance each fire 100 `increment(1)`
//! calls. The single-writer mailbox must serialize every mutation into one
//! monotonically increasing version sequence that both connections observe.

mod support;

use serde_json::json;
use support::TestClient;

const CALLS_PER_CONNECTION: i64 = 100;

#[tokio::test]
async fn interleaved_increments_yield_one_consistent_total_order() {
    let url = support::start_server().await;

    let mut conn_a = TestClient::connect(&url).await;
    conn_a.send("getInitialState", json!({ "componentName": "Counter", "props": { "initial": 0 } })).await;
    let initial = conn_a.recv().await;
    let id = initial["payload"]["$ID"].as_str().unwrap().to_string();

    let mut conn_b = TestClient::connect(&url).await;
    conn_b.send("subscribe", json!({ "id": id })).await;
    let resync = conn_b.recv().await;
    assert_eq!(resync["type"], "state_update");
    assert_eq!(resync["payload"]["full"], true);
    assert_eq!(resync["payload"]["toVersion"], 1);

    for _ in 0..CALLS_PER_CONNECTION {
        conn_a
            .send("callMethod", json!({ "name": "Counter", "id": id, "methodName": "increment", "params": [1] }))
            .await;
        conn_b
            .send("callMethod", json!({ "name": "Counter", "id": id, "methodName": "increment", "params": [1] }))
            .await;
    }

    let total_calls = (CALLS_PER_CONNECTION * 2) as usize;
    let mut versions_a = Vec::with_capacity(total_calls);
    for _ in 0..total_calls {
        let update = conn_a.recv().await;
        assert_eq!(update["type"], "state_update");
        versions_a.push(update["payload"]["toVersion"].as_u64().unwrap());
    }
    let mut versions_b = Vec::with_capacity(total_calls);
    for _ in 0..total_calls {
        let update = conn_b.recv().await;
        assert_eq!(update["type"], "state_update");
        versions_b.push(update["payload"]["toVersion"].as_u64().unwrap());
    }

    assert!(versions_a.windows(2).all(|w| w[0] < w[1]), "versions at A must strictly increase: {versions_a:?}");
    assert!(versions_b.windows(2).all(|w| w[0] < w[1]), "versions at B must strictly increase: {versions_b:?}");
    assert_eq!(versions_a, versions_b, "both connections must observe the identical total order");
    assert_eq!(*versions_a.last().unwrap(), 1 + total_calls as u64);

    conn_a.send("getInitialState", json!({ "componentName": "Counter", "props": {}, "userProvidedId": id })).await;
    let final_read = conn_a.recv().await;
    assert_eq!(final_read["payload"]["state"]["count"], CALLS_PER_CONNECTION * 2);
}
