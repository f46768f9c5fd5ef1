//! Process-wide configuration — all from environment variables.

use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the WebSocket endpoint and `/healthz`.
    pub listen_addr: String,
    /// Log level filter.
    pub log_level: String,
    /// Directory upload temp sinks live under: `<workDir>/uploads/<uploadId>.part`.
    pub work_dir: PathBuf,

    /// Reject larger inbound non-upload frames. Default 1 MiB.
    pub max_frame_bytes: usize,
    /// Reject larger total uploads. Default 32 MiB.
    pub max_upload_bytes: u64,
    /// Max per-chunk size. Default 256 KiB.
    pub chunk_bytes: usize,
    /// Idle instance eviction, in milliseconds. Default 300000 (5 min).
    pub idle_ttl_ms: u64,
    /// Per-method wall-clock timeout, in milliseconds. Default 15000.
    pub handler_timeout_ms: u64,
    /// Heartbeat ping cadence, in milliseconds. Default 20000.
    pub heartbeat_ms: u64,
    /// Pending work items per instance mailbox. Default 1024.
    pub max_mailbox: usize,
    /// Method invokes per connection per second. Default 50.
    pub rate_limit_rps: u32,
    /// Token bucket burst. Default 100.
    pub rate_limit_burst: u32,
    /// Reaper tick interval, in seconds. Default 30.
    pub reaper_interval_secs: u64,
    /// Per-connection bounded send queue, in frames. Default 256.
    pub send_queue_frames: usize,
    /// Per-connection bounded send queue, in bytes. Default 1 MiB.
    pub send_queue_bytes: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8787".into()),
            log_level: env::var("RUST_LOG")
                .unwrap_or_else(|_| "live_component_runtime=info,tower_http=info".into()),
            work_dir: env::var("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./var/live-component-runtime")),

            max_frame_bytes: env_usize("MAX_FRAME_BYTES", 1024 * 1024),
            max_upload_bytes: env_u64("MAX_UPLOAD_BYTES", 32 * 1024 * 1024),
            chunk_bytes: env_usize("CHUNK_BYTES", 256 * 1024),
            idle_ttl_ms: env_u64("IDLE_TTL_MS", 300_000),
            handler_timeout_ms: env_u64("HANDLER_TIMEOUT_MS", 15_000),
            heartbeat_ms: env_u64("HEARTBEAT_MS", 20_000),
            max_mailbox: env_usize("MAX_MAILBOX", 1024),
            rate_limit_rps: env_u32("RATE_LIMIT_RPS", 50),
            rate_limit_burst: env_u32("RATE_LIMIT_BURST", 100),
            reaper_interval_secs: env_u64("REAPER_INTERVAL_SECS", 30),
            send_queue_frames: env_usize("SEND_QUEUE_FRAMES", 256),
            send_queue_bytes: env_usize("SEND_QUEUE_BYTES", 1024 * 1024),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
