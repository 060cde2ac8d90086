//! Status command - report where each configured service is reachable.
//!
//! Read-only: probes and scans, never launches anything.

use std::time::Duration;

use anyhow::Result;
use companion_core::allocator::scan_for_fingerprint;
use companion_core::{CompanionConfig, HttpProber, Probe};
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceReport {
    name: String,
    configured_port: u16,
    found_port: Option<u16>,
    enabled: bool,
}

pub async fn run(config: CompanionConfig, json: bool) -> Result<()> {
    let prober = HttpProber::with_timeout(Duration::from_secs(config.probe_timeout_secs))?;

    let mut reports = Vec::new();
    for spec in &config.services {
        let found = if prober
            .probe(&spec.root_url(spec.port), &spec.fingerprint)
            .await
        {
            Some(spec.port)
        } else {
            scan_for_fingerprint(&prober, spec.port, config.scan_range, &spec.fingerprint).await
        };

        reports.push(ServiceReport {
            name: spec.name.clone(),
            configured_port: spec.port,
            found_port: found,
            enabled: spec.enabled,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    println!(
        "{:<12} {:<12} {:<8} ENABLED",
        "SERVICE", "CONFIGURED", "FOUND"
    );
    println!("{}", "-".repeat(44));
    for report in &reports {
        let found = report
            .found_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<12} {:<8} {}",
            report.name,
            report.configured_port,
            found,
            if report.enabled { "yes" } else { "no" }
        );
    }

    Ok(())
}
