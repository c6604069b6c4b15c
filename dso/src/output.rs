//! Human and JSON rendering of command results.

use console::style;
use serde::Serialize;

use dso_common::{
    Detection, ErrorCode, HistoryEntry, MutationPlan, MutationResult, RestoreReport,
    SnapshotSummary,
};

/// Envelope for `--json` output.
#[derive(Debug, Serialize)]
pub struct JsonResponse<'a, T: Serialize> {
    pub command: &'a str,
    pub success: bool,
    pub data: T,
}

/// Whether to print for people or for machines.
#[derive(Debug, Clone, Copy)]
pub struct OutputContext {
    json: bool,
}

impl OutputContext {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    pub fn json<T: Serialize>(&self, command: &str, success: bool, data: T) -> anyhow::Result<()> {
        let response = JsonResponse {
            command,
            success,
            data,
        };
        println!("{}", serde_json::to_string_pretty(&response)?);
        Ok(())
    }

    pub fn header(&self, title: &str) {
        if !self.json {
            println!("{}", style(title).bold().underlined());
        }
    }
}

pub fn print_detection(device: &str, detection: &Detection) {
    let verdict = match detection.variant() {
        Some(_) => style(detection.to_string()).green(),
        None => style(detection.to_string()).yellow(),
    };
    println!("  {} {}", style(device).bold(), verdict);
}

pub fn print_plan(plan: &MutationPlan) {
    println!(
        "  {} {} ({})",
        style("device").dim(),
        style(&plan.device_id).bold(),
        plan.software_version
    );
    println!("  {} {}", style("layout").dim(), plan.detection);
    for entry in &plan.entries {
        let state = match entry.exists {
            Some(true) => style("present").green(),
            Some(false) => style("absent").dim(),
            None => style("unknown").yellow(),
        };
        println!("    {:<18} {} [{}]", entry.logical.as_str(), entry.path, state);
    }
    for root in &plan.permission_roots {
        println!("    {:<18} {}", "chmod -R", root);
    }
    if !plan.restart_services.is_empty() {
        println!("  {} {}", style("restart").dim(), plan.restart_services.join(", "));
    }
    match &plan.blocked_by {
        Some(reason) => println!("  {} {}", style("blocked").red().bold(), reason),
        None => println!("  {}", style("ready to run").green()),
    }
}

pub fn print_result(result: &MutationResult) {
    let status = if result.success {
        style(format!("{} succeeded", result.operation)).green().bold()
    } else {
        style(format!("{} failed", result.operation)).red().bold()
    };
    println!("{status} on {} ({} ms)", result.device_id, result.elapsed_ms);
    println!("  {} {}", style("step").dim(), result.current_step);
    println!("  {} {}", style("summary").dim(), result.message);
    if let Some(detail) = &result.detail {
        println!("  {} {}", style("detail").dim(), detail);
    }
    if let Some(id) = &result.snapshot_id {
        println!("  {} {}", style("snapshot").dim(), id);
    }
    for name in &result.transferred {
        println!("    {} {}", style("+").green(), name);
    }
    for failed in &result.failed {
        println!("    {} {} {}", style("x").red(), failed.name, style(&failed.error).dim());
    }
    for warning in &result.warnings {
        println!("    {} {}", style("!").yellow(), warning);
    }
    if result.success && result.requires_reboot {
        println!("  {}", style("Respring or reboot the device to apply changes").cyan());
    }
    if !result.success
        && let Some(cause) = result.cause
    {
        println!();
        print_catalog_entry(cause.error_code());
    }
}

pub fn print_restore(report: &RestoreReport) {
    println!("  {} {}", style("from").dim(), report.restored_from);
    for item in &report.items {
        let name = item
            .logical
            .map(|n| n.as_str().to_string())
            .unwrap_or_else(|| item.stored_name.clone());
        println!("    {:<18} {:?}", name, item.outcome);
    }
    print_result(&report.result);
}

pub fn print_catalog_entry(code: ErrorCode) {
    for line in code.entry().format_full().lines() {
        println!("  {}", style(line).dim());
    }
}

pub fn print_snapshots(snapshots: &[SnapshotSummary]) {
    if snapshots.is_empty() {
        println!("  {}", style("no snapshots").dim());
        return;
    }
    for s in snapshots {
        let manifest = if s.has_manifest {
            style("").dim()
        } else {
            style(" (no manifest)").yellow()
        };
        println!(
            "  {}  {}  captured {} absent {}{}",
            style(&s.id).bold(),
            s.created_at.format("%Y-%m-%d %H:%M:%S"),
            s.captured,
            s.absent,
            manifest
        );
    }
}

pub fn print_history(entries: &[HistoryEntry]) {
    if entries.is_empty() {
        println!("  {}", style("no recorded runs").dim());
        return;
    }
    for e in entries {
        let outcome = if e.success {
            style("ok").green()
        } else {
            style("failed").red()
        };
        println!(
            "  {}  {:<12} {:<24} {:<6} {} sent, {} failed{}",
            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
            e.operation.to_string(),
            e.device_id.as_str(),
            outcome,
            e.transferred,
            e.failed,
            e.cause_code
                .as_deref()
                .map(|c| format!(" [{c}]"))
                .unwrap_or_default()
        );
    }
}
