//! CLI commands implementation

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use slotsched_core::{DaemonConfig, ScenarioConfig};
use slotsched_scheduler::{
    AgentAllocator, Dispatcher, InMemoryRepository, SchedulerLoop, SchedulingRepository,
    TickOutcome,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Check a scenario: parse it, build every agent and validate scheduler settings
pub fn validate(path: &Path) -> Result<()> {
    let scenario = ScenarioConfig::from_file(path)?;

    for group in &scenario.scaling_groups {
        Dispatcher::new(group.name.clone(), group.opts.clone())?;
    }
    let agents = scenario
        .agents
        .iter()
        .map(AgentAllocator::from_spec)
        .collect::<Result<Vec<_>, _>>()?;

    println!("Scenario '{}' is valid", path.display());
    println!("  Scaling groups: {}", scenario.scaling_groups.len());
    for group in &scenario.scaling_groups {
        println!("    {:<16} scheduler={}", group.name, group.opts.scheduler);
    }
    println!("  Agents: {}", agents.len());
    for agent in &agents {
        println!(
            "    {:<16} {:<10} {}",
            agent.id(),
            agent.architecture(),
            agent.capacity()
        );
    }
    println!("  Pending sessions: {}", scenario.pending_sessions.len());
    println!("  Existing sessions: {}", scenario.existing_sessions.len());
    Ok(())
}

fn print_outcome(scaling_group: &str, outcome: &TickOutcome) {
    println!(
        "  [{}] scheduled {}, cancelled {}, still pending {}",
        scaling_group,
        outcome.scheduled.len(),
        outcome.cancelled.len(),
        outcome.pending.len()
    );
    for decision in &outcome.scheduled {
        println!(
            "    + {} -> {}",
            decision.session_id,
            decision.agent_ids().join(", ")
        );
        for placement in &decision.placements {
            for (slot_name, per_device) in &placement.allocation {
                let devices: Vec<String> = per_device
                    .iter()
                    .map(|(device_id, amount)| format!("{}={}", device_id, amount))
                    .collect();
                println!(
                    "        {} {:<14} {}",
                    placement.kernel_id,
                    slot_name,
                    devices.join(" ")
                );
            }
        }
    }
    for cancellation in &outcome.cancelled {
        println!("    x {} ({})", cancellation.session_id, cancellation.reason);
    }
    for update in &outcome.pending {
        let msg = update
            .status_data
            .scheduler
            .as_ref()
            .and_then(|s| s.msg.as_deref())
            .unwrap_or("-");
        println!(
            "    ~ {} {}: {}",
            update.session_id, update.status_info, msg
        );
    }
}

/// Run `ticks` scheduling passes over a scenario
pub async fn simulate(path: &Path, ticks: u64, as_json: bool) -> Result<()> {
    let scenario = ScenarioConfig::from_file(path)?;
    let repository = Arc::new(InMemoryRepository::from_scenario(scenario));
    let scheduler = SchedulerLoop::new(repository.clone()).await?;

    for tick in 1..=ticks {
        if !as_json {
            println!("Tick {}", tick);
        }
        for (scaling_group, result) in scheduler.tick_all(Utc::now()).await {
            match result {
                Ok(outcome) if as_json => println!(
                    "{}",
                    json!({
                        "tick": tick,
                        "scaling_group": scaling_group,
                        "outcome": outcome,
                    })
                ),
                Ok(outcome) => print_outcome(&scaling_group, &outcome),
                Err(error) => eprintln!("  [{}] pass failed: {}", scaling_group, error),
            }
        }
    }

    if as_json {
        return Ok(());
    }

    println!();
    println!(
        "{:<16} {:<16} {:<40} {}",
        "AGENT", "SCALING GROUP", "OCCUPIED", "CAPACITY"
    );
    println!("{}", "-".repeat(100));
    for scaling_group in scheduler.scaling_groups() {
        let snapshot = repository.load_snapshot(scaling_group).await?;
        for agent in &snapshot.agents {
            println!(
                "{:<16} {:<16} {:<40} {}",
                agent.id(),
                scaling_group,
                agent.occupied().nonzero().to_string(),
                agent.capacity()
            );
        }
    }
    println!();
    println!(
        "Pending: {}, running: {}, cancelled: {}",
        repository.pending_sessions().await.len(),
        repository.existing_sessions().await.len(),
        repository.cancelled().await.len()
    );
    Ok(())
}

/// Run the scheduling loop until Ctrl-C or the configured tick limit
pub async fn run(path: &Path, config: &DaemonConfig) -> Result<()> {
    info!("Starting slotsched v{}", env!("CARGO_PKG_VERSION"));

    let scenario = ScenarioConfig::from_file(path)?;
    let repository: Arc<dyn SchedulingRepository> =
        Arc::new(InMemoryRepository::from_scenario(scenario));
    let scheduler = SchedulerLoop::new(repository).await?;

    let interval = Duration::from_secs(config.scheduler.tick_interval_secs.max(1));
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let ticks = scheduler
        .run(interval, config.scheduler.max_ticks, shutdown)
        .await;

    info!(ticks = ticks, "slotsched stopped");
    Ok(())
}
