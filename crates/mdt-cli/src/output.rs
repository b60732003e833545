//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use anyhow::{Context, Result};
use serde::Serialize;

use mdt_core::{ChangeEvent, Entity};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print a list of records
    pub fn print_records<E: Entity>(&self, records: &[E]) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                if records.is_empty() {
                    println!("No {} found.", E::TABLE.replace('_', " "));
                    return Ok(());
                }
                for record in records {
                    println!("{} | {}", short_id(record.id()), truncate(&record.label(), 70));
                }
                println!("\n{} record(s)", records.len());
            }
            OutputFormat::Json => {
                println!("{}", to_json_pretty(records)?);
            }
            OutputFormat::Quiet => {
                for record in records {
                    println!("{}", record.id());
                }
            }
        }
        Ok(())
    }

    /// Print one change from a live feed
    ///
    /// JSON output is one object per line so it can be piped.
    pub fn print_change<E: Entity>(&self, event: &ChangeEvent<E>, total: usize) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                let (marker, description) = match event {
                    ChangeEvent::Inserted(record) => ("+", record.label()),
                    ChangeEvent::Updated(record) => ("~", record.label()),
                    ChangeEvent::Deleted(id) => ("-", format!("(deleted {})", id)),
                };
                println!(
                    "{} {} | {}  [{} total]",
                    marker,
                    short_id(event.id()),
                    truncate(&description, 60),
                    total
                );
            }
            OutputFormat::Json => {
                let line = match event {
                    ChangeEvent::Inserted(record) | ChangeEvent::Updated(record) => {
                        serde_json::json!({
                            "event": event.kind(),
                            "table": E::TABLE,
                            "record": record,
                            "total": total,
                        })
                    }
                    ChangeEvent::Deleted(id) => serde_json::json!({
                        "event": event.kind(),
                        "table": E::TABLE,
                        "id": id,
                        "total": total,
                    }),
                };
                println!("{}", line);
            }
            OutputFormat::Quiet => {
                println!("{}", event.id());
            }
        }
        Ok(())
    }

    /// Print a feed status line (connected, error)
    pub fn status(&self, status: &str, detail: Option<&str>) {
        match self.format {
            OutputFormat::Human => match detail {
                Some(detail) => eprintln!("[{}] {}", status, detail),
                None => eprintln!("[{}]", status),
            },
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": status, "detail": detail})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn to_json_pretty<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("Failed to serialize output")
}

/// First 8 characters of an id
fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((index, _)) => &id[..index],
        None => id,
    }
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("Ünïcödé names here", 8), "Ünïcö...");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("3f2a9c1e-7b4d-4e1a"), "3f2a9c1e");
        assert_eq!(short_id("42"), "42");
    }
}
