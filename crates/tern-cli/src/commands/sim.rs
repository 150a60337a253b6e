//! sim command - scripted failure drill on an in-process cluster
//!
//! Adds three files, then corrupts one replica, bumps another replica's
//! version and kills a node, and runs validation passes until the mesh
//! settles. The clock is simulated, so the drill finishes immediately.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use console::style;
use serde_json::{json, Value};
use tern_config::TernConfig;
use tern_mesh::{FileListing, ManualClock, RepairOutcome, ValidationReport};
use tern_proto::UpdateFile;

use crate::cluster::Cluster;

/// Validation passes before the drill gives up on convergence
const MAX_CYCLES: usize = 8;

/// Files the drill starts with
const SAMPLE_FILES: [(&str, &[u8]); 3] = [
    ("alpha.txt", b"the first sample file"),
    ("beta.txt", b"the second sample file"),
    ("gamma.txt", b"the third sample file"),
];

/// Execute the sim command
pub async fn execute(config: &TernConfig, nodes: usize, json_output: bool) -> Result<()> {
    if nodes < 4 {
        bail!("the drill needs at least 4 nodes, got {nodes}");
    }

    let clock = Arc::new(ManualClock::default());
    let cluster = Cluster::open(config, clock.clone(), nodes, None).await?;
    let coordinator = Arc::clone(cluster.coordinator());
    let mut events: Vec<Value> = Vec::new();
    let mut out = Printer { json: json_output };

    out.heading("Adding files");
    for (name, content) in SAMPLE_FILES {
        let content = Bytes::from_static(content);
        let replicas = coordinator
            .add_file(content.clone(), name, content.len() as u64)
            .await
            .with_context(|| format!("Failed to add {name}"))?;
        out.line(format!("{} stored on {replicas} nodes", style(name).cyan()));
        events.push(json!({ "event": "added", "name": name, "replicas": replicas }));
    }

    // Leave the warm-up window before breaking anything
    clock.advance(Duration::from_secs(16));
    cluster.heartbeat_all();

    out.heading("Injecting faults");
    let alpha = find(&coordinator.list_files(), "alpha.txt")?;
    let corrupt_on = first_holder(&alpha)?;
    member_node(&cluster, &corrupt_on)?
        .update_file(UpdateFile {
            id: alpha.id.clone(),
            data: Some(Bytes::from_static(b"bit rot")),
            ..Default::default()
        })
        .await?;
    out.line(format!("corrupted alpha.txt on {}", style(&corrupt_on).yellow()));
    events.push(json!({ "event": "corrupted", "file": alpha.id, "node": corrupt_on }));

    let beta = find(&coordinator.list_files(), "beta.txt")?;
    let bumped_on = first_holder(&beta)?;
    member_node(&cluster, &bumped_on)?
        .update_file(UpdateFile {
            id: beta.id.clone(),
            version: Some(beta.info.version + 1),
            ..Default::default()
        })
        .await?;
    out.line(format!("bumped beta.txt version on {}", style(&bumped_on).yellow()));
    events.push(json!({ "event": "version_bumped", "file": beta.id, "node": bumped_on }));

    let gamma = find(&coordinator.list_files(), "gamma.txt")?;
    let killed = gamma
        .node_ids
        .last()
        .cloned()
        .context("gamma.txt has no holders")?;
    cluster
        .member(&killed)
        .context("unknown node")?
        .channel
        .disconnect();
    out.line(format!("killed {}", style(&killed).red()));
    events.push(json!({ "event": "killed", "node": killed }));

    coordinator.engine().refresh_all().await;

    out.heading("Reconciling");
    let mut settled = false;
    for cycle in 1..=MAX_CYCLES {
        let report = coordinator.engine().validate().await;
        out.cycle(cycle, &report, &coordinator.list_files());
        events.push(json!({ "event": "validated", "cycle": cycle, "report": report }));
        cluster.heartbeat_all();
        if report.attempted == 0 {
            settled = true;
            break;
        }
    }
    if !settled {
        out.line(style("mesh did not settle").red().to_string());
    }

    out.heading("Deleting alpha.txt");
    let acknowledged = coordinator.delete_file(&alpha.id).await?;
    out.line(format!("tombstoned on {acknowledged} nodes"));
    events.push(json!({ "event": "deleted", "file": alpha.id, "replicas": acknowledged }));

    let files = coordinator.list_files();
    let stats = coordinator.stats();
    if json_output {
        let summary = json!({
            "events": events,
            "settled": settled,
            "files": files,
            "nodes": coordinator.list_nodes(),
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        out.heading("Final state");
        for file in &files {
            out.line(format!(
                "{:<12} v{:<4} {}",
                file.name.as_deref().unwrap_or("-"),
                file.info.version,
                file.node_ids.join(", ")
            ));
        }
        out.line(format!(
            "repairs attempted {}, failed {}, validation passes {}",
            stats.repairs_attempted(),
            stats.repairs_failed,
            stats.validations_total
        ));
    }

    cluster.shutdown().await
}

fn find(files: &[FileListing], name: &str) -> Result<FileListing> {
    files
        .iter()
        .find(|f| f.name.as_deref() == Some(name))
        .cloned()
        .with_context(|| format!("{name} is not listed"))
}

fn first_holder(file: &FileListing) -> Result<String> {
    file.node_ids
        .first()
        .cloned()
        .with_context(|| format!("{} has no holders", file.id))
}

fn member_node<'a>(cluster: &'a Cluster, id: &str) -> Result<&'a tern_store::StorageNode> {
    Ok(&cluster.member(id).context("unknown node")?.node)
}

fn describe(outcome: &RepairOutcome) -> String {
    match outcome {
        RepairOutcome::Added { node } => format!("added replica on {node}"),
        RepairOutcome::Removed { node } => format!("removed replica from {node}"),
        RepairOutcome::Fixed { node, from, kind } => {
            format!("fixed {kind} on {node} from {from}")
        }
        RepairOutcome::Unchanged => "already consistent".to_string(),
    }
}

/// Text output, silenced in JSON mode
struct Printer {
    json: bool,
}

impl Printer {
    fn heading(&mut self, title: &str) {
        if !self.json {
            println!();
            println!("{}", style(title).bold().underlined());
        }
    }

    fn line(&mut self, text: String) {
        if !self.json {
            println!("  {text}");
        }
    }

    fn cycle(&mut self, cycle: usize, report: &ValidationReport, files: &[FileListing]) {
        if self.json {
            return;
        }
        println!(
            "  pass {cycle}: examined {}, repaired {}, failed {}, skipped {}",
            report.examined,
            report.attempted - report.failed,
            report.failed,
            report.skipped_locked + report.skipped_warmup
        );
        for (file_id, outcome) in &report.outcomes {
            let name = files
                .iter()
                .find(|f| &f.id == file_id)
                .and_then(|f| f.name.clone())
                .unwrap_or_else(|| file_id.clone());
            println!("    {} {}", style(name).cyan(), describe(outcome));
        }
    }
}
