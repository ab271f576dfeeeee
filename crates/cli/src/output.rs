//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

impl OutputFormat {
    /// Parse a format name from the config file
    pub fn from_name(name: &str) -> Option<Self> {
        OutputFormat::from_str(name, true).ok()
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Color status based on value
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "healthy" | "running" | "ok" => status.green().to_string(),
        "degraded" | "restarting" | "skipped" => status.yellow().to_string(),
        "unhealthy" | "error" | "failed" | "stopped" => status.red().to_string(),
        _ => status.to_string(),
    }
}

/// First 12 hex characters of a digest or fingerprint
pub fn short_digest(digest: &str) -> String {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    hex.chars().take(12).collect()
}

/// Seconds between two RFC 3339 timestamps
pub fn format_duration(started_at: &str, finished_at: &str) -> String {
    let parse = |s: &str| chrono::DateTime::parse_from_rfc3339(s).ok();
    match (parse(started_at), parse(finished_at)) {
        (Some(start), Some(end)) => {
            let millis = (end - start).num_milliseconds().max(0);
            format!("{:.1}s", millis as f64 / 1000.0)
        }
        _ => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_digest_strips_algorithm() {
        assert_eq!(short_digest("sha256:0123456789abcdef0123"), "0123456789ab");
        assert_eq!(short_digest("abc"), "abc");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(
            format_duration("2024-01-01T00:00:00Z", "2024-01-01T00:00:02.500Z"),
            "2.5s"
        );
        assert_eq!(format_duration("garbage", "2024-01-01T00:00:00Z"), "-");
    }

    #[test]
    fn test_format_from_config_name() {
        assert_eq!(OutputFormat::from_name("JSON"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::from_name("yaml"), None);
    }
}
