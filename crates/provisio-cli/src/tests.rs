use super::*;
use std::collections::BTreeSet;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::error::ErrorKind;
use provisio_core::{
    ContentHash, ContentItemInstruction, ContentPath, EnvironmentState, ProvisionEnvironmentInstruction,
    ProvisionUnitInfo, ProvisionUnitInstruction, UnitInstructionKind, UnitUpdatePolicy,
    UpdatePolicy,
};
use provisio_installer::{
    ApplyReport, EnvironmentRecord, OperationKind, RecordId, UnitOutcome, UnitOutcomeStatus,
};

use crate::commands::{
    format_history_lines, format_report_lines, format_status_lines, format_unit_status_lines,
};
use crate::render::{render_status_line, OutputStyle};

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_dir(label: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let sequence = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "provisio-cli-{label}-{}-{nanos}-{sequence}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("must create test dir");
    dir
}

fn path(raw: &str) -> ContentPath {
    raw.parse().expect("must parse content path")
}

fn record_id(raw: &str) -> RecordId {
    RecordId::parse(raw).expect("must parse record id")
}

fn outcome(status: UnitOutcomeStatus) -> UnitOutcome {
    UnitOutcome {
        unit: "app".to_string(),
        kind: UnitInstructionKind::Update,
        status,
        version: Some("1.1".to_string()),
        written: 2,
        deleted: 1,
        skipped_items: 0,
        record: None,
    }
}

#[test]
fn cli_parses_apply_with_global_home() {
    let cli = Cli::try_parse_from([
        "provisio",
        "--home",
        "/tmp/env",
        "apply",
        "plan.toml",
        "--source",
        "/tmp/packages",
    ])
    .expect("must parse");
    assert_eq!(cli.home.as_deref(), Some(std::path::Path::new("/tmp/env")));
    match cli.command {
        Commands::Apply { document, source } => {
            assert_eq!(document, PathBuf::from("plan.toml"));
            assert_eq!(source, PathBuf::from("/tmp/packages"));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_accepts_home_and_verbose_after_the_subcommand() {
    let cli = Cli::try_parse_from(["provisio", "status", "app", "--home", "/env", "-v"])
        .expect("must parse");
    assert!(cli.verbose);
    assert_eq!(cli.home.as_deref(), Some(std::path::Path::new("/env")));
    assert!(matches!(cli.command, Commands::Status { unit: Some(ref unit) } if unit == "app"));
}

#[test]
fn cli_apply_requires_a_source() {
    let err = Cli::try_parse_from(["provisio", "apply", "plan.toml"])
        .expect_err("source is required");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
}

#[test]
fn cli_rejects_unknown_completion_shell() {
    let err = Cli::try_parse_from(["provisio", "completions", "tcsh"])
        .expect_err("tcsh is not supported");
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
}

#[test]
fn completions_script_names_the_binary() {
    let mut output = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut output)
        .expect("must write completions");
    let script = String::from_utf8(output).expect("completion script is UTF-8");
    assert!(script.contains("provisio"));
    assert!(script.contains("rollback"));
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "app: applied"),
        "app: applied"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "app: applied"),
        "[OK] app: applied"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "skip", "app: skipped"),
        "[SKIP] app: skipped"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "..", "app: unchanged"),
        "[..] app: unchanged"
    );
}

#[test]
fn report_lines_summarize_units_and_record() {
    let report = ApplyReport {
        operation: OperationKind::Apply,
        record: Some(record_id("18f-2a-0")),
        units: vec![
            outcome(UnitOutcomeStatus::Applied),
            UnitOutcome {
                unit: "lib".to_string(),
                kind: UnitInstructionKind::Install,
                status: UnitOutcomeStatus::SkippedByPolicy,
                version: None,
                written: 0,
                deleted: 0,
                skipped_items: 0,
                record: None,
            },
        ],
        state: EnvironmentState::new(),
    };
    let lines = format_report_lines(&report, OutputStyle::Rich);
    assert_eq!(
        lines,
        vec![
            "[OK] app: applied (update -> 1.1) written=2 deleted=1".to_string(),
            "[SKIP] lib: skipped-by-policy (install -> none)".to_string(),
            "[OK] apply complete (record=18f-2a-0 written=2 deleted=1)".to_string(),
        ]
    );
}

#[test]
fn report_lines_for_noop_apply_and_rollback() {
    let mut unchanged = outcome(UnitOutcomeStatus::Unchanged);
    unchanged.written = 0;
    unchanged.deleted = 0;
    unchanged.skipped_items = 1;
    let report = ApplyReport {
        operation: OperationKind::Apply,
        record: None,
        units: vec![unchanged],
        state: EnvironmentState::new(),
    };
    assert_eq!(
        format_report_lines(&report, OutputStyle::Plain),
        vec![
            "app: unchanged (update -> 1.1) written=0 deleted=0 skipped-items=1".to_string(),
            "apply: no changes".to_string(),
        ]
    );

    let rollback = ApplyReport {
        operation: OperationKind::Rollback,
        record: None,
        units: vec![outcome(UnitOutcomeStatus::RolledBack)],
        state: EnvironmentState::new(),
    };
    let lines = format_report_lines(&rollback, OutputStyle::Plain);
    assert_eq!(lines.last().map(String::as_str), Some("rollback complete"));
}

#[test]
fn history_lines_list_each_unit_transition() {
    let instruction = ProvisionEnvironmentInstruction::from_units([
        ProvisionUnitInstruction::update("app", "1.0", "1.1").expect("must build update"),
        ProvisionUnitInstruction::install("lib", "2.0").expect("must build install"),
    ])
    .expect("must build instruction");
    let record = EnvironmentRecord {
        id: record_id("18f-2a-1"),
        state: EnvironmentState::new(),
        instruction,
        unit_records: Default::default(),
        detached_units: Default::default(),
    };
    assert_eq!(
        format_history_lines(&[record]),
        vec!["18f-2a-1  app update 1.0 -> 1.1, lib install none -> 2.0".to_string()]
    );
    assert_eq!(format_history_lines(&[]), vec!["history is empty".to_string()]);
}

#[test]
fn status_lines_show_versions_patches_and_policy() {
    let mut state = EnvironmentState::new();
    let mut info = ProvisionUnitInfo::new("app", Some("1.1".to_string()));
    info.patches = vec!["p1".to_string(), "p2".to_string()];
    state.apply_unit(info.clone());
    state.apply_unit(ProvisionUnitInfo::new("lib", Some("2.0".to_string())));
    assert_eq!(
        format_status_lines(&state),
        vec!["app 1.1 (patches: p1,p2)".to_string(), "lib 2.0".to_string()]
    );
    assert_eq!(
        format_status_lines(&EnvironmentState::new()),
        vec!["no units installed".to_string()]
    );

    let policy = UnitUpdatePolicy::new(UpdatePolicy::Forced, UpdatePolicy::Conditioned)
        .with_override(path("$config/app.ini"), UpdatePolicy::Ignored);
    let manifest: BTreeSet<ContentPath> = [path("bin/app"), path("$config/app.ini")]
        .into_iter()
        .collect();
    let lines = format_unit_status_lines("app", Some(&info), &policy, &manifest);
    assert_eq!(lines[0], "unit: app");
    assert_eq!(lines[1], "version: 1.1");
    assert_eq!(lines[2], "patches: p1,p2");
    assert_eq!(lines[3], "policy: unit=forced content=conditioned");
    assert_eq!(lines[4], "policy override: $config/app.ini=ignored");
    assert_eq!(lines[5], "content: 2 path(s)");
    assert_eq!(lines.len(), 8);

    let missing = format_unit_status_lines("ghost", None, &policy, &BTreeSet::new());
    assert_eq!(missing[1], "version: not installed");
    assert_eq!(missing.last().map(String::as_str), Some("content: none"));
}

#[test]
fn run_cli_applies_rolls_back_and_reports_errors() {
    let home = test_dir("home");
    let packages = test_dir("packages");
    fs::create_dir_all(packages.join("app/home/bin")).expect("must create package dirs");
    fs::write(packages.join("app/home/bin/app"), b"#!/bin/sh\n").expect("must write package file");

    let instruction = ProvisionEnvironmentInstruction::from_units([
        ProvisionUnitInstruction::install("app", "1.0")
            .expect("must build install")
            .with_content(ContentItemInstruction::add(
                path("bin/app"),
                ContentHash::of(b"#!/bin/sh\n"),
            )),
    ])
    .expect("must build instruction");
    let document = packages.join("plan.toml");
    fs::write(&document, instruction.to_toml_string().expect("must serialize"))
        .expect("must write document");

    let home_arg = home.display().to_string();
    let document_arg = document.display().to_string();
    let source_arg = packages.display().to_string();
    let apply = Cli::try_parse_from([
        "provisio",
        "--home",
        home_arg.as_str(),
        "apply",
        document_arg.as_str(),
        "--source",
        source_arg.as_str(),
    ])
    .expect("must parse");
    run_cli(apply).expect("must apply");
    assert_eq!(
        fs::read(home.join("bin/app")).expect("must read installed file"),
        b"#!/bin/sh\n"
    );

    let status = Cli::try_parse_from(["provisio", "--home", home_arg.as_str(), "status"])
        .expect("must parse");
    run_cli(status).expect("must print status");

    let err = run_cli(apply_again(&home_arg, &document_arg, &source_arg))
        .expect_err("conditioned reinstall must fail");
    let message = format!("{err:#}");
    assert!(message.contains("failed to apply"), "unexpected error: {message}");
    assert!(message.contains("already installed"), "unexpected error: {message}");

    let rollback = Cli::try_parse_from(["provisio", "--home", home_arg.as_str(), "rollback"])
        .expect("must parse");
    run_cli(rollback).expect("must roll back");
    assert!(!home.join("bin/app").exists());

    let uninstall =
        Cli::try_parse_from(["provisio", "--home", home_arg.as_str(), "uninstall", "app"])
            .expect("must parse");
    let err = run_cli(uninstall).expect_err("app is no longer installed");
    assert!(format!("{err:#}").contains("failed to uninstall app"));

    let _ = fs::remove_dir_all(&home);
    let _ = fs::remove_dir_all(&packages);
}

fn apply_again(home: &str, document: &str, source: &str) -> Cli {
    Cli::try_parse_from([
        "provisio", "--home", home, "apply", document, "--source", source,
    ])
    .expect("must parse")
}
