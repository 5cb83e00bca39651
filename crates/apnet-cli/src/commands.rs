//! CLI command implementations

use apnet::cleanup::{sweep_host, HostExecutor};
use apnet::engine::Engine;
use apnet::{persist, EngineConfig, EngineError};
use tracing::info;

async fn load_topology(path: &str, seed: Option<u64>) -> Result<apnet::Topology, EngineError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EngineError::Config(format!("cannot read '{}': {}", path, e)))?;
    let mut config = EngineConfig::default();
    if let Some(seed) = seed {
        config.seed = seed;
    }
    persist::from_json(&text, config)
}

pub async fn cmd_run(
    path: &str,
    server: Option<(String, u16)>,
    seed: Option<u64>,
) -> Result<(), EngineError> {
    let topo = load_topology(path, seed).await?;
    let mut engine = Engine::new(topo)?;
    engine.build().await?;

    if let Some(bind) = server {
        let mailbox = engine.mailbox();
        let cleanup = engine.cleanup_registry();
        let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(apnet::server::serve(bind, mailbox, cleanup, cancel_rx));
    }

    info!("topology up; ctrl-c to stop");
    tokio::select! {
        _ = engine.serve() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
        }
    }
    engine.stop().await;
    Ok(())
}

pub async fn cmd_check(path: &str) -> Result<(), EngineError> {
    let topo = load_topology(path, None).await?;
    topo.config.validate()?;
    println!(
        "ok: {} nodes ({} stations, {} aps, {} hosts, {} switches, {} controllers), {} links",
        topo.node_count(),
        topo.stations.len(),
        topo.aps.len(),
        topo.hosts.len(),
        topo.switches.len(),
        topo.controllers.len(),
        topo.links.len(),
    );
    Ok(())
}

pub async fn cmd_cleanup() -> Result<(), EngineError> {
    let executor = HostExecutor::new();
    // No registry survived if we're here after a crash; sweep by
    // ownership markers instead.
    sweep_host(&executor, &[]).await;
    println!("cleanup done");
    Ok(())
}
