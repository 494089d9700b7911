//! Change rendering: colored text or one JSON object per line

use anyhow::Result;
use dirwatch::{ChangeRecord, FileAction};
use owo_colors::OwoColorize;
use serde_json::json;
use std::io::{self, Write};
use std::path::Path;

pub struct Printer {
    json: bool,
}

impl Printer {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn change(&self, record: &ChangeRecord) -> Result<()> {
        let mut out = io::stdout().lock();
        if self.json {
            writeln!(out, "{}", serde_json::to_string(record)?)?;
            return Ok(());
        }

        let marker = if record.is_directory { "/" } else { "" };
        let size = if record.is_directory || record.action == FileAction::Removed {
            String::new()
        } else {
            format!(" ({} bytes)", record.size)
        };
        writeln!(
            out,
            "{} {}{}{}",
            label(record.action),
            record.path,
            marker,
            size.dimmed()
        )?;
        Ok(())
    }

    pub fn overflow(&self, record: &ChangeRecord) -> Result<()> {
        let mut out = io::stdout().lock();
        if self.json {
            writeln!(out, "{}", serde_json::to_string(record)?)?;
        } else {
            writeln!(
                out,
                "{} {} {}",
                label(record.action),
                record.path,
                "(changes were lost)".dimmed()
            )?;
        }
        Ok(())
    }

    pub fn rescanned(&self, path: &Path) -> Result<()> {
        let mut out = io::stdout().lock();
        if self.json {
            let line = json!({ "rescan": path.to_string_lossy() });
            writeln!(out, "{}", line)?;
        } else {
            writeln!(out, "{} {}", "rescan  ".magenta(), path.display())?;
        }
        Ok(())
    }
}

/// Fixed-width colored action label
fn label(action: FileAction) -> String {
    match action {
        FileAction::Added => "added   ".green().to_string(),
        FileAction::Removed => "removed ".red().to_string(),
        FileAction::Modified => "modified".yellow().to_string(),
        FileAction::RenamedFrom => "renamed ".cyan().to_string(),
        FileAction::RenamedTo => "      ->".cyan().to_string(),
        FileAction::TooManyChanges => "overflow".red().bold().to_string(),
        FileAction::None => "unknown ".dimmed().to_string(),
    }
}
