use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use raylink::config::{load_env_file, RaylinkConfig};
use raylink::host::{HeadlessEngine, Row};
use raylink::observability::TaskJournal;
use raylink::orchestrator::{AsyncNode, NodeConfig};
use raylink::remote::Globals;
use raylink::supervisor::SessionRegistry;
use raylink::workers::ExecuteCommandWorker;
use serde_json::json;
use tracing_subscriber::EnvFilter;

const SESSION_KEY: &str = "default";
const SETTLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    load_env_file();
    let config = RaylinkConfig::load().context("loading configuration")?;

    let commands: Vec<String> = std::env::args().skip(1).collect();
    if commands.is_empty() {
        anyhow::bail!("usage: raylink <command> [<command> ...]");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("raylink-worker")
        .build()
        .context("building tokio runtime")?;

    let registry = runtime.block_on(SessionRegistry::spawn())?;
    let session = runtime.block_on(registry.session(SESSION_KEY))?;
    let info = runtime.block_on(session.connect(config.connect_request()))?;
    tracing::info!(session = %info.key, target = ?info.target, "Connected");

    let globals = Arc::new(Globals::new());
    globals.set_session_paths(&config.session_paths());

    let rows: Vec<Row> = commands
        .iter()
        .map(|command| {
            let mut row = Row::new();
            row.insert("commands".to_string(), json!([command]));
            row.insert("run".to_string(), json!(true));
            row
        })
        .collect();
    let mut engine = HeadlessEngine::new(rows);

    let journal = Arc::new(TaskJournal::default());
    let worker = ExecuteCommandWorker::new(session.clone(), globals, config.execute_options());
    let node = AsyncNode::new(
        NodeConfig::new("execute", Some(Box::new(worker)), engine.host(), runtime.handle().clone())
            .with_progress_interval(config.progress_interval())
            .with_journal(journal.clone()),
    );
    node.with_state(|state| state.log.save = true);

    let cancel_node = node.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            cancel_node.request_cancellation();
        }
    });

    let settled = engine.settle(&node, SETTLE_TIMEOUT);
    match &settled {
        Ok(passes) => tracing::info!(passes, status = %node.status().message, "Node settled"),
        Err(e) => tracing::error!(error = %e, "Node did not settle"),
    }

    let report = json!({
        "status": node.status(),
        "iterations": engine.results(),
        "journal": journal.latest(1, None).iter().map(|entry| entry.render()).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    let closed = runtime.block_on(registry.close_all());
    tracing::debug!(closed, "Sessions closed");
    runtime.shutdown_timeout(Duration::from_secs(2));

    settled?;
    Ok(())
}
