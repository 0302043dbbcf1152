use std::io::{self, Write};

use sqlcheck::control::{
    ControlRun, ControlRunState, ControlStatus, ExecutionTree, GroupChild, ResultGroup,
    StatusSummary, TreeArena,
};

/// Write a plain-text outline of the finished tree.
pub(crate) fn write_tree(out: &mut impl Write, tree: &ExecutionTree) -> io::Result<()> {
    let arena = tree.arena();
    for child in tree.root().children() {
        match child {
            GroupChild::Group(id) => write_group(out, arena, arena.group(*id), 0)?,
            GroupChild::Run(id) => write_run(out, arena.run(*id), 0)?,
        }
    }
    let summary = tree.summary();
    writeln!(out)?;
    writeln!(out, "Summary: {}", counts(&summary.status))?;
    for (severity, band) in &summary.severity {
        writeln!(out, "  {severity}: {}", counts(band))?;
    }
    Ok(())
}

fn write_group(
    out: &mut impl Write,
    arena: &TreeArena,
    group: &ResultGroup,
    depth: usize,
) -> io::Result<()> {
    let title = group.title.as_deref().unwrap_or(&group.group_id);
    writeln!(
        out,
        "{}{title} [{}]",
        indent(depth),
        counts(&group.summary().status)
    )?;
    for child in group.children() {
        match child {
            GroupChild::Group(id) => write_group(out, arena, arena.group(*id), depth + 1)?,
            GroupChild::Run(id) => write_run(out, arena.run(*id), depth + 1)?,
        }
    }
    Ok(())
}

fn write_run(out: &mut impl Write, run: &ControlRun, depth: usize) -> io::Result<()> {
    let snapshot = run.snapshot();
    let title = run.control().title.as_deref().unwrap_or(run.name());
    let marker = match snapshot.state {
        ControlRunState::Error => "ERROR",
        _ if snapshot.summary.failed_count() > 0 => "FAIL",
        _ if snapshot.summary.total_count() == 0 => "SKIP",
        _ => "PASS",
    };
    writeln!(
        out,
        "{}{marker:<5} {title} [{}]",
        indent(depth),
        counts(&snapshot.summary)
    )?;
    if let Some(error) = snapshot.error {
        writeln!(out, "{}      {error}", indent(depth))?;
    }
    run.with_rows(|rows| {
        rows.iter()
            .filter(|row| matches!(row.status, ControlStatus::Alarm | ControlStatus::Error))
            .try_for_each(|row| {
                writeln!(
                    out,
                    "{}      {} {}: {}",
                    indent(depth),
                    row.status,
                    row.resource,
                    row.reason
                )
            })
    })
}

fn counts(summary: &StatusSummary) -> String {
    format!(
        "ok {}, alarm {}, info {}, skip {}, error {}",
        summary.ok, summary.alarm, summary.info, summary.skip, summary.error
    )
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth)
}
