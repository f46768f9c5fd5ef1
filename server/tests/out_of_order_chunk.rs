//! Chunks arriving out of sequence fail the upload permanently: the chunk
//! that breaks the sequence errors with `BAD_SEQ`, every later chunk and the
//! final `uploadEnd` keep failing the same way, and the target instance's
//! state is never touched.

mod support;

use base64::Engine;
use serde_json::json;
use support::TestClient;

#[tokio::test]
async fn a_skipped_sequence_number_fails_the_upload_for_good() {
    let url = support::start_server().await;
    let mut client = TestClient::connect(&url).await;

    client.send("getInitialState", json!({ "componentName": "FileBin", "props": {} })).await;
    let initial = client.recv().await;
    let id = initial["payload"]["$ID"].as_str().unwrap().to_string();

    let chunk = base64::engine::general_purpose::STANDARD.encode([0u8; 4]);

    client
        .send(
            "uploadBegin",
            json!({
                "instanceId": id,
                "uploadId": "up-oos",
                "fileName": "blob.bin",
                "totalBytes": 16,
                "chunkSize": 4,
            }),
        )
        .await;

    client.send("uploadChunk", json!({ "uploadId": "up-oos", "seq": 0, "bytesBase64": chunk })).await;

    // seq 1 is skipped; seq 2 arrives next and must fail the upload. An
    // `upload-progress` frame from the seq 0 chunk may already be queued
    // ahead of the error, so match past it instead of assuming order.
    client.send("uploadChunk", json!({ "uploadId": "up-oos", "seq": 2, "bytesBase64": chunk })).await;
    let first_error = client.recv_matching(|v| v["type"] == "error").await;
    assert_eq!(first_error["payload"]["code"], "BAD_SEQ");

    client.send("uploadChunk", json!({ "uploadId": "up-oos", "seq": 1, "bytesBase64": chunk })).await;
    let second_error = client.recv_matching(|v| v["type"] == "error").await;
    assert_eq!(second_error["payload"]["code"], "BAD_SEQ");

    client.send("uploadChunk", json!({ "uploadId": "up-oos", "seq": 3, "bytesBase64": chunk })).await;
    let third_error = client.recv_matching(|v| v["type"] == "error").await;
    assert_eq!(third_error["payload"]["code"], "BAD_SEQ");

    client.send("uploadEnd", json!({ "uploadId": "up-oos" })).await;
    let end_error = client.recv_matching(|v| v["type"] == "error").await;
    assert_eq!(end_error["payload"]["code"], "BAD_SEQ");

    client.send("getInitialState", json!({ "componentName": "FileBin", "props": {}, "userProvidedId": id })).await;
    let refetched = client.recv().await;
    assert_eq!(refetched["payload"]["state"]["files"], json!([]), "a failed upload must never mutate instance state");
}
