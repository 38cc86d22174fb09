// ABOUTME: Fake Goxel daemon listening on a real Unix socket in a temp directory
//
// Speaks newline-delimited JSON-RPC, one request at a time per connection:
// - ping              -> "pong" (after the configured ping delay)
// - goxel.get_status  -> {"status": "idle"}
// - slow {"ms": N}    -> {"slept": N} after N milliseconds
// - fail              -> error -1001
// - crash             -> connection dropped without a reply
// anything else       -> error -32601

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

#[derive(Default)]
struct DaemonState {
    accepted: AtomicUsize,
    requests: AtomicUsize,
    ping_delay_ms: AtomicU64,
}

pub struct FakeDaemon {
    state: Arc<DaemonState>,
    socket_path: PathBuf,
    accept_loop: JoinHandle<()>,
    _dir: TempDir,
}

impl FakeDaemon {
    pub fn start() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = dir.path().join("goxel.sock");
        let listener = UnixListener::bind(&socket_path).expect("bind daemon socket");
        let state = Arc::new(DaemonState::default());

        let accept_state = Arc::clone(&state);
        let accept_loop = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });

        Self {
            state,
            socket_path,
            accept_loop,
            _dir: dir,
        }
    }

    pub fn connector(&self) -> Arc<goxel_pool::UnixSocketConnector> {
        Arc::new(goxel_pool::UnixSocketConnector::new(&self.socket_path))
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.state.ping_delay_ms.store(millis, Ordering::SeqCst);
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn serve(stream: UnixStream, state: Arc<DaemonState>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        // Notifications get no reply
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        state.requests.fetch_add(1, Ordering::SeqCst);

        let method = request["method"].as_str().unwrap_or_default();
        let reply = match method {
            "ping" => {
                let delay = state.ping_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                json!({"jsonrpc": "2.0", "id": id, "result": "pong"})
            }
            "goxel.get_status" => {
                json!({"jsonrpc": "2.0", "id": id, "result": {"status": "idle"}})
            }
            "slow" => {
                let ms = request["params"]["ms"].as_u64().unwrap_or(50);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                json!({"jsonrpc": "2.0", "id": id, "result": {"slept": ms}})
            }
            "fail" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -1001, "message": "operation failed"}
            }),
            "crash" => return,
            other => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": format!("Method not found: {other}")}
            }),
        };

        let mut frame = reply.to_string();
        frame.push('\n');
        if write_half.write_all(frame.as_bytes()).await.is_err() {
            return;
        }
    }
}
