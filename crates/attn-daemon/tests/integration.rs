//! Integration tests for the worker backend: restart survival and
//! recovery behavior against a real in-process worker.
//!
//! The worker normally runs as a separate `attn pty-worker` process;
//! here it runs as a task inside the test so the suite does not depend
//! on a built binary. The daemon side goes through exactly the same
//! registry + RPC path either way.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use attn_core::config::DaemonConfig;
use attn_daemon::backend::{BackendContext, PtyBackend, WorkerBackend};
use attn_daemon::identity::OwnershipLease;
use attn_daemon::registry;
use attn_daemon::types::{BackendEvents, PtyEvent};
use attn_daemon::worker_proc::run_worker;
use attn_paths::AttnPaths;
use attn_protocol::worker::{REGISTRY_VERSION, RegistryEntry, WorkerSpawnSpec};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

const INSTANCE: &str = "itest-instance";

fn test_config() -> Arc<DaemonConfig> {
    Arc::new(DaemonConfig {
        rpc_default_timeout_ms: 2_000,
        rpc_liveness_timeout_ms: 1_000,
        rpc_reclaim_timeout_ms: 1_000,
        ..DaemonConfig::default()
    })
}

fn make_backend(paths: &AttnPaths) -> WorkerBackend {
    let (exit_tx, _exit_rx) = tokio::sync::mpsc::unbounded_channel();
    let (state_tx, _state_rx) = tokio::sync::mpsc::unbounded_channel();
    WorkerBackend::new(BackendContext {
        paths: paths.clone(),
        instance_id: INSTANCE.to_string(),
        lease: OwnershipLease::generate(),
        config: test_config(),
        events: BackendEvents { exit_tx, state_tx },
    })
}

/// Start an in-process worker for a shell session and write its registry
/// entry, exactly as a previous daemon would have left it.
async fn start_recoverable_worker(
    paths: &AttnPaths,
    session_id: &str,
) -> (RegistryEntry, tokio::task::JoinHandle<()>) {
    let socket_path = paths.worker_socket_path(INSTANCE, session_id).unwrap();
    let spec = WorkerSpawnSpec {
        version: 1,
        session_id: session_id.to_string(),
        socket_path: socket_path.clone(),
        daemon_instance_id: INSTANCE.to_string(),
        control_token: format!("tok-{session_id}"),
        cwd: std::env::temp_dir(),
        command: Some("/bin/sh".to_string()),
        args: vec!["-i".to_string()],
        env: vec![("PS1".to_string(), "$ ".to_string())],
        cols: 80,
        rows: 24,
        scrollback_bytes: 256 * 1024,
        agent: "shell".to_string(),
        capture_path: None,
    };
    let entry = RegistryEntry {
        version: REGISTRY_VERSION,
        session_id: session_id.to_string(),
        socket_path,
        worker_pid: std::process::id(),
        control_token: spec.control_token.clone(),
        daemon_instance_id: INSTANCE.to_string(),
        owner_pid: 4_294_966, // previous daemon, long dead
        owner_started_at: chrono::Utc::now(),
        owner_nonce: "previous-daemon-nonce".to_string(),
    };
    registry::write_entry(paths, INSTANCE, &entry).unwrap();

    let handle = tokio::spawn(async move {
        let _ = run_worker(spec).await;
    });

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !entry.socket_path.exists() && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    (entry, handle)
}

async fn drain_for(
    rx: &mut tokio::sync::mpsc::Receiver<PtyEvent>,
    needle: &str,
    last_seq: &mut u64,
) -> bool {
    let mut collected = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while std::time::Instant::now() < deadline {
        let event = match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(event)) => event,
            _ => break,
        };
        match event {
            PtyEvent::Output { bytes, seq } => {
                assert!(
                    seq > *last_seq,
                    "output sequence must be strictly increasing (got {seq} after {last_seq})"
                );
                *last_seq = seq;
                collected.extend_from_slice(&bytes);
                if String::from_utf8_lossy(&collected).contains(needle) {
                    return true;
                }
            }
            PtyEvent::Desync { .. } | PtyEvent::Exit { .. } => break,
        }
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_survives_daemon_restart() {
    let dir = tempfile::tempdir().unwrap();
    let paths = AttnPaths::from_dir(dir.path().to_path_buf());

    // A worker left behind by a previous daemon process.
    let (_entry, worker) = start_recoverable_worker(&paths, "s1").await;

    // "Restarted" daemon: a fresh backend recovering from the registry.
    let backend = make_backend(&paths);
    let report = backend.recover().await;
    assert_eq!(report.recovered, vec!["s1"]);
    assert!(report.quarantined.is_empty());

    // Attach, drive the shell, and observe the echo.
    let (info, mut events) = backend.attach("s1", "client-1").await.unwrap();
    assert!(info.running);
    let mut last_seq = info.last_seq;

    backend.input("s1", b"echo ok\n").await.unwrap();
    assert!(
        drain_for(&mut events, "ok", &mut last_seq).await,
        "expected to see 'ok' in PTY output after daemon restart"
    );

    backend.remove("s1").await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), worker).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recover_registers_each_session_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let paths = AttnPaths::from_dir(dir.path().to_path_buf());

    let (_e1, w1) = start_recoverable_worker(&paths, "s1").await;
    let (_e2, w2) = start_recoverable_worker(&paths, "s2").await;

    let backend = make_backend(&paths);
    let first = backend.recover().await;
    let ids: HashSet<String> = first.recovered.iter().cloned().collect();
    assert_eq!(ids, HashSet::from(["s1".to_string(), "s2".to_string()]));

    // A second scan is idempotent: no duplicates, no ghosts.
    let second = backend.recover().await;
    assert!(second.recovered.is_empty());
    assert!(second.pruned.is_empty());
    let mut live = backend.session_ids().await;
    live.sort();
    assert_eq!(live, vec!["s1", "s2"]);

    backend.remove("s1").await.unwrap();
    backend.remove("s2").await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), w1).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), w2).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reattach_replays_consistent_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let paths = AttnPaths::from_dir(dir.path().to_path_buf());
    let (_entry, worker) = start_recoverable_worker(&paths, "s1").await;

    let backend = make_backend(&paths);
    backend.recover().await;

    backend.input("s1", b"echo replay-marker\n").await.unwrap();

    // First attach: wait until the marker is in scrollback.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let mut first_replay = Vec::new();
    let mut first_last_seq = 0;
    while std::time::Instant::now() < deadline {
        let (info, _events) = backend.attach("s1", "client-a").await.unwrap();
        first_replay = BASE64.decode(&info.scrollback).unwrap();
        first_last_seq = info.last_seq;
        if String::from_utf8_lossy(&first_replay).contains("replay-marker") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(String::from_utf8_lossy(&first_replay).contains("replay-marker"));

    // Detach and re-attach: the new replay must contain the first one as
    // a prefix (same ring, no intervening exit).
    backend.detach("s1", "client-a").await.unwrap();
    let (info, _events) = backend.attach("s1", "client-a").await.unwrap();
    let second_replay = BASE64.decode(&info.scrollback).unwrap();
    assert!(info.last_seq >= first_last_seq);
    assert!(
        second_replay.starts_with(&first_replay),
        "re-attach replay must extend the previous replay"
    );

    backend.remove("s1").await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), worker).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_operations_on_unknown_session_fail_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let paths = AttnPaths::from_dir(dir.path().to_path_buf());
    let backend = make_backend(&paths);

    assert!(backend.input("ghost", b"x").await.is_err());
    assert!(backend.attach("ghost", "c").await.is_err());
    assert!(backend.remove("ghost").await.is_err());
    assert!(!backend.session_likely_alive("ghost").await);
    assert!(backend.session_ids().await.is_empty());
}
