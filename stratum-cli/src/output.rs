//! Terminal output formatting for stratum commands.
//! Uses comfy-table for the migration listing and colored for status lines.

use std::io::Write;

use colored::Colorize;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, ContentArrangement, Table};
use serde::Serialize;

use stratum_core::{
    DiffReport, DumpReport, ListRow, NewReport, PullReport, PullStatus, PushReport, RepairReport,
    ResetReport, SquashReport,
};

/// Print any report as pretty JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("{} failed to serialize output: {}", "ERROR:".red().bold(), e),
    }
}

/// Warn about drop statements in a generated diff. Always on stderr, so the
/// warning survives `--quiet` and `--json`.
pub fn print_drop_warnings(statements: &[String]) {
    let _ = write_drop_warnings(&mut std::io::stderr().lock(), statements);
}

fn write_drop_warnings(out: &mut impl Write, statements: &[String]) -> std::io::Result<()> {
    if statements.is_empty() {
        return Ok(());
    }
    writeln!(
        out,
        "{} Found drop statements in schema diff. Please double check if these are expected:",
        "WARNING:".yellow().bold()
    )?;
    for statement in statements {
        writeln!(out, "  {}", statement.yellow())?;
    }
    Ok(())
}

pub fn print_new_report(report: &NewReport) {
    println!(
        "{}",
        format!("Created new migration at {}", report.path.display()).green()
    );
}

pub fn print_pull_report(report: &PullReport) {
    match report.status {
        PullStatus::InSync => {
            println!("{}", "No schema changes found.".green());
        }
        PullStatus::Created => {
            if let Some(path) = &report.path {
                let verb = if report.first_pull {
                    "Schema written to"
                } else {
                    "Changes written to"
                };
                println!("{}", format!("{} {}", verb, path.display()).green().bold());
            }
            if report.history_updated {
                if let Some(version) = &report.version {
                    println!(
                        "  {} remote history updated with {}",
                        "→".green(),
                        version
                    );
                }
            }
        }
    }
}

pub fn print_push_report(report: &PushReport) {
    if report.pending.is_empty() {
        println!("{}", "Remote database is up to date.".green());
        return;
    }

    if report.dry_run {
        println!(
            "{}",
            format!("Would push {} migration(s):", report.pending.len()).yellow()
        );
        for version in &report.pending {
            println!("  {} {}", "•".yellow(), version);
        }
        return;
    }

    println!(
        "{}",
        format!("Applied {} migration(s)", report.applied.len())
            .green()
            .bold()
    );
    for version in &report.applied {
        println!("  {} {}", "→".green(), version);
    }
    if report.seeded {
        println!("{}", "Seeded data.".dimmed());
    }
}

pub fn print_reset_report(report: &ResetReport) {
    for schema in &report.dropped_schemas {
        println!("  {} dropped schema {}", "✗".red(), schema);
    }
    for container in &report.restarted {
        println!("  {} restarted {}", "↻".dimmed(), container);
    }
    let upto = report
        .version
        .as_deref()
        .map(|v| format!(" up to {}", v))
        .unwrap_or_default();
    println!(
        "{}",
        format!(
            "Finished resetting {} database{} ({} migration(s) applied{})",
            report.target,
            upto,
            report.applied.len(),
            if report.seeded { ", seeded" } else { "" }
        )
        .green()
        .bold()
    );
}

pub fn print_squash_report(report: &SquashReport) {
    let (Some(anchor), Some(path)) = (&report.anchor, &report.path) else {
        println!("{}", "No migrations to squash.".yellow());
        return;
    };
    println!(
        "{}",
        format!("Squashed migrations into {} ({})", anchor, path.display())
            .green()
            .bold()
    );
    for removed in &report.removed {
        println!("  {} removed {}", "✗".dimmed(), removed.display());
    }
    if report.baselined {
        println!("  {} remote history baselined at {}", "→".green(), anchor);
    }
}

/// The diff itself goes to stdout; status lines go to stderr.
pub fn print_diff_report(report: &DiffReport) {
    if report.is_empty() {
        eprintln!("{}", "No schema changes found.".green());
        return;
    }
    match &report.path {
        Some(path) => {
            eprintln!(
                "{}",
                format!("Diff written to {}", path.display()).green().bold()
            );
        }
        None => print!("{}", report.diff),
    }
}

pub fn print_dump_report(report: &DumpReport) {
    if let Some(path) = &report.path {
        let what = if report.dry_run { "Dump script" } else { "Dumped" };
        eprintln!(
            "{}",
            format!("{} {} database to {}", what, report.target, path.display()).green()
        );
    }
}

/// Three-column Local | Remote | Time table.
pub fn print_list_table(rows: &[ListRow]) {
    if rows.is_empty() {
        println!("{}", "No migrations found.".yellow());
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Local"),
            Cell::new("Remote"),
            Cell::new("Time (UTC)"),
        ]);

    for row in rows {
        let local = row.local.as_deref().unwrap_or("");
        let remote = row.remote.as_deref().unwrap_or("");
        let (local, remote) = match (row.local.is_some(), row.remote.is_some()) {
            (true, true) => (local.to_string(), remote.to_string()),
            (true, false) => (local.yellow().to_string(), String::new()),
            _ => (String::new(), remote.red().to_string()),
        };
        table.add_row(vec![
            Cell::new(local),
            Cell::new(remote),
            Cell::new(row.time.as_deref().unwrap_or("")),
        ]);
    }

    println!("{table}");
}

pub fn print_repair_report(report: &RepairReport) {
    println!(
        "{}",
        format!(
            "Repaired migration history: {} marked as {}",
            report.versions.join(", "),
            report.status
        )
        .green()
        .bold()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_warnings_list_each_statement() {
        colored::control::set_override(false);
        let mut out = Vec::new();
        write_drop_warnings(
            &mut out,
            &["drop table \"public\".\"t\"".to_string()],
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("WARNING: Found drop statements"));
        assert!(text.contains("  drop table \"public\".\"t\"\n"));
    }

    #[test]
    fn test_no_drop_statements_prints_nothing() {
        let mut out = Vec::new();
        write_drop_warnings(&mut out, &[]).unwrap();
        assert!(out.is_empty());
    }
}
