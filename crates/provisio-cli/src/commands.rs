use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use provisio_core::{
    ContentPath, EnvironmentState, ProvisionEnvironmentInstruction, ProvisionUnitInfo,
    UnitUpdatePolicy,
};
use provisio_installer::{
    ApplicationContext, ApplyReport, DirectoryContentSource, EnvironmentRecord, OperationKind,
    UnitOutcome, UnitOutcomeStatus,
};

use crate::render::{render_status_line, OutputStyle, TerminalRenderer};

pub(crate) fn run_apply(
    context: &mut ApplicationContext,
    document: &Path,
    source: &Path,
) -> Result<()> {
    let raw = fs::read_to_string(document)
        .with_context(|| format!("failed to read instruction document: {}", document.display()))?;
    let instruction = ProvisionEnvironmentInstruction::from_toml_str(&raw)
        .with_context(|| format!("invalid instruction document: {}", document.display()))?;
    let source = DirectoryContentSource::new(source);
    let report = context
        .apply(&instruction, &source)
        .with_context(|| format!("failed to apply {}", document.display()))?;
    print_report(&report);
    Ok(())
}

pub(crate) fn run_rollback(context: &mut ApplicationContext) -> Result<()> {
    let renderer = TerminalRenderer::current();
    match context
        .rollback_last()
        .context("failed to roll back the newest record")?
    {
        Some(report) => print_report(&report),
        None => renderer.print_status("skip", "history is empty; nothing to roll back"),
    }
    Ok(())
}

pub(crate) fn run_uninstall(context: &mut ApplicationContext, unit: &str) -> Result<()> {
    let report = context
        .uninstall(unit)
        .with_context(|| format!("failed to uninstall {unit}"))?;
    print_report(&report);
    Ok(())
}

pub(crate) fn run_history(context: &ApplicationContext) -> Result<()> {
    let records = context.history().context("failed to read history")?;
    TerminalRenderer::current().print_lines(&format_history_lines(&records));
    Ok(())
}

pub(crate) fn run_status(context: &ApplicationContext, unit: Option<&str>) -> Result<()> {
    let renderer = TerminalRenderer::current();
    let state = context.state().context("failed to read environment state")?;
    let Some(unit) = unit else {
        renderer.print_lines(&format_status_lines(&state));
        return Ok(());
    };

    let manifest = context
        .manifest(unit)
        .with_context(|| format!("failed to read manifest of {unit}"))?;
    let policy = context.metadata().policy_for(unit);
    renderer.print_section(unit);
    renderer.print_lines(&format_unit_status_lines(
        unit,
        state.unit(unit),
        &policy,
        &manifest,
    ));
    Ok(())
}

fn print_report(report: &ApplyReport) {
    let renderer = TerminalRenderer::current();
    renderer.print_section(report.operation.as_str());
    for (status, message) in report_entries(report) {
        renderer.print_status(status, &message);
    }
}

pub(crate) fn format_report_lines(report: &ApplyReport, style: OutputStyle) -> Vec<String> {
    report_entries(report)
        .into_iter()
        .map(|(status, message)| render_status_line(style, status, &message))
        .collect()
}

fn report_entries(report: &ApplyReport) -> Vec<(&'static str, String)> {
    let mut entries: Vec<(&'static str, String)> = report
        .units
        .iter()
        .map(|outcome| (outcome_badge(outcome.status), format_outcome(outcome)))
        .collect();
    let summary = match &report.record {
        Some(record) => format!(
            "{} complete (record={record} written={} deleted={})",
            report.operation,
            report.files_written(),
            report.files_deleted()
        ),
        None if report.operation == OperationKind::Rollback => {
            format!("{} complete", report.operation)
        }
        None => format!("{}: no changes", report.operation),
    };
    entries.push(("ok", summary));
    entries
}

fn outcome_badge(status: UnitOutcomeStatus) -> &'static str {
    match status {
        UnitOutcomeStatus::Applied | UnitOutcomeStatus::RolledBack => "ok",
        UnitOutcomeStatus::SkippedByPolicy | UnitOutcomeStatus::SkippedByCondition => "skip",
        UnitOutcomeStatus::Unchanged => "..",
    }
}

fn format_outcome(outcome: &UnitOutcome) -> String {
    let mut line = format!(
        "{}: {} ({} -> {})",
        outcome.unit,
        outcome.status.as_str(),
        outcome.kind,
        outcome.version.as_deref().unwrap_or("none")
    );
    if !outcome.status.is_skipped() {
        line.push_str(&format!(
            " written={} deleted={}",
            outcome.written, outcome.deleted
        ));
    }
    if outcome.skipped_items > 0 {
        line.push_str(&format!(" skipped-items={}", outcome.skipped_items));
    }
    line
}

pub(crate) fn format_history_lines(records: &[EnvironmentRecord]) -> Vec<String> {
    if records.is_empty() {
        return vec!["history is empty".to_string()];
    }
    records
        .iter()
        .map(|record| {
            let units = record
                .instruction
                .units()
                .iter()
                .map(|unit| {
                    format!(
                        "{} {} {} -> {}",
                        unit.unit_name(),
                        unit.kind(),
                        unit.required_version().unwrap_or("none"),
                        unit.resulting_version().unwrap_or("none")
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("{}  {units}", record.id)
        })
        .collect()
}

pub(crate) fn format_status_lines(state: &EnvironmentState) -> Vec<String> {
    if state.units.is_empty() {
        return vec!["no units installed".to_string()];
    }
    state
        .units
        .values()
        .map(|info| {
            let version = info.version.as_deref().unwrap_or("none");
            if info.patches.is_empty() {
                format!("{} {version}", info.name)
            } else {
                format!("{} {version} (patches: {})", info.name, info.patches.join(","))
            }
        })
        .collect()
}

pub(crate) fn format_unit_status_lines(
    unit: &str,
    info: Option<&ProvisionUnitInfo>,
    policy: &UnitUpdatePolicy,
    manifest: &BTreeSet<ContentPath>,
) -> Vec<String> {
    let mut lines = vec![format!("unit: {unit}")];
    match info.and_then(|info| info.version.as_deref()) {
        Some(version) => lines.push(format!("version: {version}")),
        None => lines.push("version: not installed".to_string()),
    }
    if let Some(info) = info.filter(|info| !info.patches.is_empty()) {
        lines.push(format!("patches: {}", info.patches.join(",")));
    }
    lines.push(format!(
        "policy: unit={} content={}",
        policy.unit_policy, policy.default_content_policy
    ));
    for (path, override_policy) in &policy.path_overrides {
        lines.push(format!("policy override: {path}={override_policy}"));
    }
    if manifest.is_empty() {
        lines.push("content: none".to_string());
    } else {
        lines.push(format!("content: {} path(s)", manifest.len()));
        lines.extend(manifest.iter().map(|path| format!("  {path}")));
    }
    lines
}
