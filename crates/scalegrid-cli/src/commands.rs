use std::fmt::Write as _;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use tracing::debug;

use scalegrid_core::{ScalegridConfig, ServiceRule, format_duration};

/// What `check` reports about a valid config.
#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    pub health_interval: String,
    pub health_timeout: String,
    pub unhealthy_threshold: u32,
    pub default_strategy: String,
    pub strategy_overrides: Vec<(String, String)>,
    pub autoscale_interval: String,
    pub drain_timeout: String,
    pub rules: Vec<ServiceRule>,
}

impl ConfigSummary {
    pub fn new(config: &ScalegridConfig) -> Self {
        Self {
            health_interval: format_duration(config.health.interval),
            health_timeout: format_duration(config.health.timeout),
            unhealthy_threshold: config.health.unhealthy_threshold,
            default_strategy: config.balancer.strategy.to_string(),
            strategy_overrides: config
                .balancer
                .services
                .iter()
                .map(|(service, strategy)| (service.clone(), strategy.to_string()))
                .collect(),
            autoscale_interval: format_duration(config.autoscale.interval),
            drain_timeout: format_duration(config.autoscale.drain_timeout),
            rules: config.autoscale.rules.clone(),
        }
    }
}

pub fn check(path: &Path, format: &str) -> anyhow::Result<()> {
    let config = ScalegridConfig::from_file(path)
        .with_context(|| format!("invalid config {}", path.display()))?;
    debug!(path = %path.display(), rules = config.autoscale.rules.len(), "config loaded");

    let summary = ConfigSummary::new(&config);
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        _ => print!("{}", format_summary(&summary)),
    }
    Ok(())
}

pub fn defaults() -> anyhow::Result<()> {
    print!("{}", ScalegridConfig::default().to_toml()?);
    Ok(())
}

pub fn format_summary(summary: &ConfigSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "health:    every {}, timeout {}, unhealthy after {} failures",
        summary.health_interval, summary.health_timeout, summary.unhealthy_threshold
    );
    let _ = writeln!(out, "balancer:  {}", summary.default_strategy);
    for (service, strategy) in &summary.strategy_overrides {
        let _ = writeln!(out, "  {service:<16} {strategy}");
    }
    let _ = writeln!(
        out,
        "autoscale: every {}, drain timeout {}",
        summary.autoscale_interval, summary.drain_timeout
    );
    if summary.rules.is_empty() {
        let _ = writeln!(out, "  (no rules)");
    }
    for entry in &summary.rules {
        let rule = &entry.rule;
        let _ = writeln!(
            out,
            "  {:<16} {} up >{} (+{}) down <{} (-{}) bounds {}..={} cooldown {}s",
            entry.service,
            rule.metric,
            rule.threshold_up,
            rule.scale_up_count,
            rule.threshold_down,
            rule.scale_down_count,
            rule.min_instances,
            rule.max_instances,
            rule.cooldown_seconds,
        );
    }
    out
}
