use anyhow::Result;
use autostop_core::{CycleReport, Decision, ProbeOutcome};

use crate::OutputFormat;

pub(crate) fn print_report(report: &CycleReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Ndjson => {
            println!("{}", serde_json::to_string(report)?);
        }
        OutputFormat::Human => {
            print!("{}", render_human(report));
        }
    }

    Ok(())
}

pub(crate) fn render_human(report: &CycleReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("=== Autostop Cycle #{} ===\n", report.cycle));
    out.push_str(&format!("Time:       {}\n", report.ts.to_rfc3339()));
    out.push_str(&format!(
        "State:      {} activity={} idle={}s remaining={}s cycle_ms={}\n",
        report.decision.label(),
        report.any_activity,
        report.idle_secs,
        report.remaining_secs,
        report.cycle_ms,
    ));
    out.push_str(&format!(
        "Last seen:  {}\n",
        report.last_activity.to_rfc3339()
    ));

    if !report.probes.is_empty() {
        out.push_str("Probes:\n");
    }
    for result in &report.probes {
        let value = match &result.outcome {
            ProbeOutcome::Detected { active, .. } => active.to_string(),
            ProbeOutcome::Failed { .. } => "error".to_string(),
        };
        out.push_str(&format!(
            "  {:<12} {:<6} {} ({} ms)\n",
            result.probe,
            value,
            result.detail(),
            result.elapsed_ms
        ));
    }

    if let Decision::ShutdownFailed { error } = &report.decision {
        out.push_str(&format!("Shutdown:   FAILED {error}\n"));
    }

    out
}
