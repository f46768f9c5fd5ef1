//! Shared integration-test harness: spins up a real server instance bound to an
//! ephemeral port and drives it over a real WebSocket with `tokio-tungstenite`.

use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use live_component_runtime::config::Config;
use live_component_runtime::AppState;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Starts an in-process server bound to an OS-assigned port with a scratch
/// `work_dir` and short handler/idle timeouts, and returns its `ws://.../ws` URL.
pub async fn start_server() -> String {
    let work_dir = std::env::temp_dir().join(format!("lcr-test-{}", uuid::Uuid::new_v4()));
    let config = Config {
        work_dir,
        handler_timeout_ms: 2_000,
        idle_ttl_ms: 60_000,
        reaper_interval_secs: 3600,
        // generous enough that tests exercising concurrency aren't incidentally
        // throttled by the per-connection invoke rate limiter or mailbox/send-queue caps
        rate_limit_rps: 100_000,
        rate_limit_burst: 100_000,
        max_mailbox: 10_000,
        send_queue_frames: 10_000,
        ..Config::from_env()
    };
    let state = AppState::new(config);
    let app = live_component_runtime::build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    // give the listener a moment to start accepting before the first connect
    tokio::time::sleep(Duration::from_millis(20)).await;
    format!("ws://{addr}/ws")
}

pub struct TestClient {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

impl TestClient {
    pub async fn connect(url: &str) -> Self {
        let (stream, _response) = tokio_tungstenite::connect_async(url).await.expect("connect");
        let (write, read) = stream.split();
        Self { write, read }
    }

    /// Sends a single-update envelope: `{"updates":[{"type":..,"payload":..}]}`.
    pub async fn send(&mut self, update_type: &str, payload: Value) {
        let envelope = json!({ "updates": [ { "type": update_type, "payload": payload } ] });
        self.write.send(Message::Text(envelope.to_string().into())).await.expect("send");
    }

    /// Reads the next text frame's first update, skipping ping/pong control frames.
    pub async fn recv(&mut self) -> Value {
        loop {
            match self.read.next().await.expect("stream ended") {
                Ok(Message::Text(text)) => {
                    let mut v: Value = serde_json::from_str(&text).expect("valid json frame");
                    return v["updates"][0].take();
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(other) => panic!("unexpected frame: {other:?}"),
                Err(e) => panic!("ws error: {e}"),
            }
        }
    }

    /// Reads frames until one satisfies `predicate`, discarding the rest. Used where
    /// a server reply can interleave with unrelated frames (e.g. `upload-progress`
    /// alongside a `function-result`).
    pub async fn recv_matching(&mut self, predicate: impl Fn(&Value) -> bool) -> Value {
        loop {
            let v = self.recv().await;
            if predicate(&v) {
                return v;
            }
        }
    }
}
