//! Config command - show the active configuration.

use anyhow::Result;
use companion_core::{CompanionConfig, ConfigStore};

pub fn show(store: &ConfigStore, config: &CompanionConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    println!("Config file: {}", store.config_path().display());
    println!("Model:       {}", config.model);
    println!(
        "Timeouts:    probe {}s, health {}s, scan range {}",
        config.probe_timeout_secs, config.health_timeout_secs, config.scan_range
    );
    println!();

    for spec in &config.services {
        println!(
            "{} (port {}, {})",
            spec.name,
            spec.port,
            if spec.enabled { "enabled" } else { "disabled" }
        );
        println!("  fingerprint: {:?}", spec.fingerprint);
        println!(
            "  launch:      {} {}",
            spec.launch.program.display(),
            spec.launch.args.join(" ")
        );
        for (key, value) in &spec.launch.env {
            println!("  env:         {}={}", key, value);
        }
    }

    Ok(())
}
