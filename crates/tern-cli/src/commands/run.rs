//! run command - in-process cluster with live background loops

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use console::style;
use tern_config::TernConfig;
use tern_mesh::SystemClock;
use tracing::warn;

use crate::cluster::Cluster;

/// Execute the run command
///
/// Nodes heartbeat and sweep on the configured node intervals; the
/// coordinator runs failure detection, refresh and validation on the
/// configured mesh intervals. Stops after `duration_secs` or on Ctrl-C.
pub async fn execute(
    config: &TernConfig,
    nodes: usize,
    files: usize,
    duration_secs: u64,
    data_dir: Option<&Path>,
) -> Result<()> {
    if nodes == 0 {
        bail!("at least one node is required");
    }

    let mut cluster = Cluster::open(config, Arc::new(SystemClock), nodes, data_dir).await?;
    cluster.start_daemons(config);
    let coordinator = Arc::clone(cluster.coordinator());
    coordinator
        .start()
        .await
        .context("Failed to start coordinator")?;

    println!(
        "{} {} nodes, replication factor {}",
        style("Cluster up:").bold().green(),
        nodes,
        config.mesh.replication_factor
    );

    for i in 1..=files {
        let name = format!("sample-{i}.txt");
        let content = Bytes::from(format!("tern sample file {i}\n"));
        match coordinator
            .add_file(content.clone(), &name, content.len() as u64)
            .await
        {
            Ok(replicas) => println!("  {} stored on {replicas} nodes", style(&name).cyan()),
            Err(e) => {
                warn!(name = %name, error = %e, "Add failed");
                println!("  {} {}", style(&name).cyan(), style(e).red());
            }
        }
    }

    println!(
        "Running for {duration_secs}s, press {} to stop early",
        style("Ctrl-C").bold()
    );
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(duration_secs)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted");
        }
    }

    println!();
    println!("{}", style("Files").bold().underlined());
    for file in coordinator.list_files() {
        println!(
            "  {:<16} v{:<4} {}",
            file.name.as_deref().unwrap_or("-"),
            file.info.version,
            file.node_ids.join(", ")
        );
    }

    println!("{}", style("Nodes").bold().underlined());
    for node in coordinator.list_nodes() {
        let state = if node.alive {
            style("alive").green()
        } else {
            style("dead").red()
        };
        println!("  {:<10} {:<6} files {}", node.id, state, node.file_count);
    }

    println!("{}", style("Metrics").bold().underlined());
    println!("{}", serde_json::to_string_pretty(&coordinator.stats())?);

    cluster.shutdown().await
}
