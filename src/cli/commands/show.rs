//! Show command - list what the transform cache holds

use super::open_cache;
use crate::cache::ArchiveFs;
use crate::cli::args::{OutputFormat, ShowArgs};
use crate::config::Config;
use crate::error::{TranscacheError, TranscacheResult};
use crate::ui;
use chrono::{DateTime, Local};
use console::style;
use serde::Serialize;

#[derive(Serialize)]
struct UnitSummary {
    unit: String,
    files: usize,
}

#[derive(Serialize)]
struct ArchiveSummary {
    archive: String,
    size: u64,
    modified: Option<String>,
    entries: usize,
    keys: usize,
    widened_symbols: usize,
    units: Vec<UnitSummary>,
}

/// Execute the show command
pub async fn execute(args: ShowArgs, config: &Config) -> TranscacheResult<()> {
    let cache = open_cache(&args.dir, config);
    let store = cache.store();

    if !store.exists() {
        println!("No transform cache at {}", cache.folder().display());
        return Ok(());
    }
    let archive = store.try_open()?;

    if let Some(unit) = args.unit {
        return list_unit(&archive, &unit, args.format);
    }

    let meta = std::fs::metadata(archive.path())
        .map_err(|e| TranscacheError::artifact_io(archive.path(), e))?;
    let modified = meta
        .modified()
        .ok()
        .map(|t| DateTime::<Local>::from(t).to_rfc3339());
    let widened_symbols = archive
        .access_metadata()?
        .map(|text| text.lines().count())
        .unwrap_or(0);

    let summary = ArchiveSummary {
        archive: archive.path().display().to_string(),
        size: meta.len(),
        modified,
        entries: archive.entry_count(),
        keys: archive.options()?.len(),
        widened_symbols,
        units: archive
            .unit_ids()
            .into_iter()
            .map(|unit| UnitSummary {
                files: archive.list(&unit).len(),
                unit,
            })
            .collect(),
    };

    match args.format {
        OutputFormat::Table => print_table(&summary),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Plain => {
            for unit in &summary.units {
                println!("{}", unit.unit);
            }
        }
    }
    Ok(())
}

fn print_table(summary: &ArchiveSummary) {
    println!("{} {}", style("Archive:").bold(), summary.archive);
    println!(
        "{} {} ({} entries, {} keys, {} widened symbols)",
        style("Size:").bold(),
        ui::human_bytes(summary.size),
        summary.entries,
        summary.keys,
        summary.widened_symbols
    );
    if let Some(ref modified) = summary.modified {
        println!("{} {}", style("Modified:").bold(), modified);
    }
    println!();
    println!("{:<40} {:>8}", "UNIT", "FILES");
    println!("{}", "-".repeat(49));
    for unit in &summary.units {
        println!("{:<40} {:>8}", unit.unit, unit.files);
    }
    println!();
    println!("Total: {} unit(s)", summary.units.len());
}

fn list_unit(archive: &ArchiveFs, unit: &str, format: OutputFormat) -> TranscacheResult<()> {
    let files = archive.list(unit);
    if files.is_empty() {
        return Err(TranscacheError::User(format!(
            "Unit '{}' has no files in the transform cache",
            unit
        )));
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&files)?),
        OutputFormat::Table | OutputFormat::Plain => {
            for file in files {
                println!("{}", file);
            }
        }
    }
    Ok(())
}
