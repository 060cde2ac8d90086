//! Up command - ensure every configured service is running.
//!
//! Launched services are children of this process, so after reporting the
//! outcome the command stays in the foreground until interrupted, then
//! stops everything it launched. When nothing had to be launched it exits
//! right away.

use anyhow::Result;
use companion_core::{CompanionConfig, ServiceOrchestrator, ServiceState, ServiceStatus};
use tracing::warn;

pub async fn run(config: CompanionConfig, json: bool) -> Result<()> {
    let orchestrator = ServiceOrchestrator::new(config)?;
    let statuses = orchestrator.ensure_all().await;

    print_statuses(&statuses, json)?;

    if statuses.iter().any(|s| s.launched) {
        if !json {
            println!("\nLaunched services stay up until Ctrl-C.");
        }
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl-C: {}", e);
        }
        orchestrator.stop_all().await;
    }

    Ok(())
}

fn print_statuses(statuses: &[ServiceStatus], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(statuses)?);
        return Ok(());
    }

    println!("{:<12} {:<8} {:<10} STATE", "SERVICE", "PORT", "LAUNCHED");
    println!("{}", "-".repeat(44));
    for status in statuses {
        println!(
            "{:<12} {:<8} {:<10} {}",
            status.name,
            status.resolved_port,
            if status.launched { "yes" } else { "no" },
            state_str(status.state)
        );
    }

    Ok(())
}

fn state_str(state: ServiceState) -> &'static str {
    match state {
        ServiceState::Unresolved => "unresolved",
        ServiceState::ConfiguredMatch => "running (configured port)",
        ServiceState::Discovered => "running (shifted port)",
        ServiceState::Launching => "launching",
        ServiceState::Healthy => "healthy",
        ServiceState::TimedOut => "launched, not yet healthy",
        ServiceState::Stopped => "stopped",
    }
}
