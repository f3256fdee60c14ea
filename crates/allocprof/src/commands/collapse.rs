use crate::collapse::{Collapser, FilterMode, SkipReason};
use crate::error::Result;
use comfy_table::{Cell, CellAlignment, Table};
use std::path::Path;

/// Run the collapse command
pub fn run(
    input: &Path,
    filter: Option<&str>,
    output: &Path,
    exclusive: bool,
    top: Option<usize>,
) -> Result<()> {
    let mut collapser = Collapser::new();
    if let Some(filter) = filter {
        let mode = if exclusive {
            FilterMode::Exclusive
        } else {
            FilterMode::KeepUnmatched
        };
        collapser = collapser.with_filter(filter, mode);
    }

    eprintln!("Collapsing {}...", input.display());
    collapser.collapse_file(input)?;

    for skipped in collapser.skipped() {
        let what = match skipped.reason {
            SkipReason::Incomplete => "Incomplete line",
            SkipReason::BadSize => "Bad size",
        };
        println!("{what}({}): {}", skipped.number, skipped.text);
    }

    let written = collapser.write_file(output)?;
    tracing::debug!(output = %output.display(), written, "collapsed output written");
    println!(
        "Collapsed {} rows into {}",
        collapser.lines(),
        collapser.keys()
    );

    if let Some(n) = top {
        print_top(&collapser, n);
    }
    Ok(())
}

fn print_top(collapser: &Collapser, n: usize) {
    let entries = collapser.top(n);
    if entries.is_empty() {
        return;
    }

    let mut table = Table::new();
    table.set_header(vec!["BYTES", "STACK"]);
    for (key, total) in entries {
        table.add_row(vec![
            Cell::new(format_bytes(total)).set_alignment(CellAlignment::Right),
            Cell::new(key.trim_end_matches(';')),
        ]);
    }
    println!("{table}");
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn writes_collapsed_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("stacks.txt");
        let output = dir.path().join("collapsed.txt");
        std::fs::write(&input, "a;b 100\na;b 50\nonlyonefield\n").unwrap();

        run(&input, None, &output, false, Some(5)).unwrap();
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "a;b; 150\n");
    }
}
