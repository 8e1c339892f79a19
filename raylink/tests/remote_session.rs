//! Session, command and worker behaviour over the local transport.

use std::sync::Arc;
use std::time::Duration;

use raylink::actors::{ConnectRequest, RemoteSession};
use raylink::host::{HeadlessEngine, Row};
use raylink::orchestrator::{AsyncNode, NodeConfig};
use raylink::remote::{CommandRequest, Globals, RemoteError, SessionPaths, SshTarget, Transport};
use raylink::supervisor::SessionRegistry;
use raylink::workers::{ExecuteCommandWorker, ExecuteOptions, UploadWorker};
use serde_json::json;
use shared_types::{CancelOutcome, ConnectionState, DiagnosticLevel};
use tempfile::TempDir;

fn local_request(root: &TempDir) -> ConnectRequest {
    let root = root.path().to_string_lossy().to_string();
    let mut request = ConnectRequest::new(Transport::local(), SessionPaths::new(&root, &root, "proj"));
    request.cancel_grace = Duration::from_secs(3);
    request
}

async fn connected(root: &TempDir) -> RemoteSession {
    let session = RemoteSession::spawn("test").await.expect("spawn session");
    session.connect(local_request(root)).await.expect("connect local");
    session
}

#[tokio::test(flavor = "multi_thread")]
async fn test_command_output_and_remote_pid() {
    let root = tempfile::tempdir().expect("tempdir");
    let session = connected(&root).await;

    let mut handle = session
        .start_command(CommandRequest::new("echo hello; echo oops 1>&2"))
        .await
        .expect("start");
    let output = tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .expect("finishes")
        .expect("succeeds");

    assert_eq!(output.stdout, "hello\n");
    assert_eq!(output.stderr, "oops\n");
    assert_eq!(output.exit_code, Some(0));
    assert!(output.remote_pid.is_some());
    session.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_mid_command_reports_connection_lost() {
    let root = tempfile::tempdir().expect("tempdir");
    let session = connected(&root).await;

    let mut handle = session
        .start_command(CommandRequest::new("sleep 30"))
        .await
        .expect("start");
    tokio::time::sleep(Duration::from_millis(200)).await;
    session.disconnect().await;

    let result = tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .expect("join returns after disconnect");
    assert_eq!(result, Err(RemoteError::ConnectionLost));
    assert!(!handle.session_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_after_disconnect_is_not_sent() {
    let root = tempfile::tempdir().expect("tempdir");
    let session = connected(&root).await;

    let handle = session
        .start_command(CommandRequest::new("sleep 30"))
        .await
        .expect("start");
    session.disconnect().await;

    assert_eq!(handle.cancel().await, CancelOutcome::NotSent);
    assert!(handle.is_cancelled());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_running_command_terminates_it() {
    let root = tempfile::tempdir().expect("tempdir");
    let session = connected(&root).await;

    let mut handle = session
        .start_command(CommandRequest::new("sleep 30"))
        .await
        .expect("start");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(handle.cancel().await, CancelOutcome::Terminated);
    assert!(handle.is_done());
    assert_eq!(handle.join().await, Err(RemoteError::Cancelled));
    assert_eq!(handle.cancel().await, CancelOutcome::AlreadyFinished);
    session.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_host_leaves_session_disconnected() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let root = tempfile::tempdir().expect("tempdir");
    let session = RemoteSession::spawn("unreachable").await.expect("spawn");

    let mut request = ConnectRequest::new(
        Transport::Ssh(SshTarget::new("127.0.0.1", port)),
        SessionPaths::new("~/raylink", root.path().to_string_lossy(), "proj"),
    );
    request.timeout = Duration::from_secs(1);
    let result = session.connect(request).await;
    assert!(matches!(result, Err(RemoteError::Unreachable(_))), "{result:?}");

    let info = session.info().await;
    assert_eq!(info.state, ConnectionState::Disconnected);
    assert!(info.last_error.is_some());
    assert_eq!(
        session.start_command(CommandRequest::new("true")).await.err(),
        Some(RemoteError::NotConnected)
    );

    let info = session.connect(local_request(&root)).await.expect("reconnect local");
    assert_eq!(info.state, ConnectionState::Connected);
    assert!(info.last_error.is_none());
    session.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upload_and_read_back() {
    let root = tempfile::tempdir().expect("tempdir");
    let session = connected(&root).await;
    let local = root.path().join("scene.rad");
    std::fs::write(&local, "void plastic white 0 0 5 .8 .8 .8 0 0\n").expect("write");

    let target = root.path().join("uploads");
    let remote = session
        .upload(&local, &target.to_string_lossy())
        .await
        .expect("upload");
    assert!(remote.ends_with("/uploads/scene.rad"), "{remote}");

    let contents = session.read_file(&remote).await.expect("read back");
    assert!(contents.starts_with("void plastic white"));

    let missing = session.read_file(&format!("{remote}.missing")).await;
    assert!(matches!(missing, Err(RemoteError::PathNotFound(_))));
    session.disconnect().await;
}

// ============================================================================
// Workers end to end
// ============================================================================

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("runtime")
}

fn commands_row(commands: serde_json::Value) -> Row {
    let mut row = Row::new();
    row.insert("commands".to_string(), commands);
    row.insert("run".to_string(), json!(true));
    row
}

#[test]
fn test_execute_worker_splits_output_per_command() {
    let rt = runtime();
    let root = tempfile::tempdir().expect("tempdir");
    let registry = rt.block_on(SessionRegistry::spawn()).expect("registry");
    let request = local_request(&root);
    let globals = Arc::new(Globals::new());
    globals.set_session_paths(&request.paths);
    let session = rt
        .block_on(registry.connect("exec", request))
        .expect("connect");

    let mut engine = HeadlessEngine::new(vec![
        commands_row(json!(["echo one", "echo two"])),
        commands_row(json!("echo <Project>")),
        commands_row(json!(["echo careful 1>&2"])),
        commands_row(json!(["echo 'error: no scene' 1>&2"])),
    ]);
    let options = ExecuteOptions {
        poll_interval: Duration::from_millis(20),
        ..ExecuteOptions::default()
    };
    let node = AsyncNode::new(NodeConfig::new(
        "execute",
        Some(Box::new(ExecuteCommandWorker::new(session, globals, options))),
        engine.host(),
        rt.handle().clone(),
    ));

    engine
        .settle(&node, Duration::from_secs(20))
        .expect("settles");

    assert_eq!(engine.output(0, "stdout"), Some(&json!(["one", "two"])));
    assert_eq!(engine.output(0, "ran"), Some(&json!(true)));
    assert_eq!(engine.output(1, "stdout"), Some(&json!(["proj"])));

    assert_eq!(engine.output(2, "stderr"), Some(&json!(["careful"])));
    assert_eq!(engine.output(2, "ran"), Some(&json!(false)));
    assert!(engine
        .diagnostics(2)
        .iter()
        .any(|(level, _)| *level == DiagnosticLevel::Warning));
    assert!(engine
        .diagnostics(3)
        .iter()
        .any(|(level, message)| *level == DiagnosticLevel::Error && message.contains("no scene")));

    let state = node.state();
    assert_eq!(state.cached("stdout", 0), Some("one\n_JOIN_\ntwo\n"));
    assert!(state.last_run().is_some());

    rt.block_on(registry.close_all());
}

#[test]
fn test_node_cancellation_stops_remote_command() {
    let rt = runtime();
    let root = tempfile::tempdir().expect("tempdir");
    let session = rt.block_on(connected(&root));
    let marker = root.path().join("finished.marker");

    let mut engine = HeadlessEngine::new(vec![commands_row(json!([format!(
        "sleep 3; touch '{}'",
        marker.display()
    )]))]);
    let options = ExecuteOptions {
        poll_interval: Duration::from_millis(20),
        ..ExecuteOptions::default()
    };
    let node = AsyncNode::new(NodeConfig::new(
        "execute",
        Some(Box::new(ExecuteCommandWorker::new(
            session.clone(),
            Arc::new(Globals::new()),
            options,
        ))),
        engine.host(),
        rt.handle().clone(),
    ));

    engine.run_pass(&node);
    let link = rt.block_on(session.link()).expect("link");
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while link.outstanding_commands() == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(link.outstanding_commands(), 1);

    node.request_cancellation();
    assert!(node.phase().is_idle());

    std::thread::sleep(Duration::from_secs(4));
    assert!(!marker.exists(), "command kept running after cancellation");
    assert_eq!(link.outstanding_commands(), 0);
    assert_eq!(engine.re_evaluations(), 0);
    rt.block_on(session.disconnect());
}

#[test]
fn test_execute_worker_rejects_empty_commands() {
    let rt = runtime();
    let root = tempfile::tempdir().expect("tempdir");
    let session = rt.block_on(connected(&root));

    let mut engine = HeadlessEngine::new(vec![commands_row(json!([]))]);
    let node = AsyncNode::new(NodeConfig::new(
        "execute",
        Some(Box::new(ExecuteCommandWorker::new(
            session.clone(),
            Arc::new(Globals::new()),
            ExecuteOptions::default(),
        ))),
        engine.host(),
        rt.handle().clone(),
    ));

    let passes = engine.settle(&node, Duration::from_secs(5)).expect("settles");
    assert_eq!(passes, 1);
    assert!(engine
        .diagnostics(0)
        .iter()
        .any(|(level, message)| *level == DiagnosticLevel::Error && message.contains("No commands")));
    rt.block_on(session.disconnect());
}

#[test]
fn test_upload_worker_defaults_to_upload_home() {
    let rt = runtime();
    let root = tempfile::tempdir().expect("tempdir");
    let session = rt.block_on(connected(&root));
    let local = root.path().join("sky.rad");
    std::fs::write(&local, "!gensky 3 21 12\n").expect("write");

    let mut row = Row::new();
    row.insert("files".to_string(), json!([local.to_string_lossy()]));
    row.insert("run".to_string(), json!(true));
    let mut engine = HeadlessEngine::new(vec![row]);
    let node = AsyncNode::new(NodeConfig::new(
        "upload",
        Some(Box::new(UploadWorker::new(session.clone(), Arc::new(Globals::new())))),
        engine.host(),
        rt.handle().clone(),
    ));

    engine.settle(&node, Duration::from_secs(10)).expect("settles");

    let expected = std::fs::canonicalize(root.path())
        .expect("canonical root")
        .join("proj")
        .join("sky.rad");
    assert_eq!(
        engine.output(0, "remote_paths"),
        Some(&json!([expected.to_string_lossy()]))
    );
    assert!(expected.exists());
    rt.block_on(session.disconnect());
}
