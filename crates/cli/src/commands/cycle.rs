//! Update and download cycles

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, CycleQuery, CycleSummary};
use crate::output::{
    format_duration, print_error, print_info, print_json, print_success, print_warning,
    OutputFormat,
};

#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "Container")]
    container: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

pub async fn run_update(client: &ApiClient, query: CycleQuery, format: OutputFormat) -> Result<()> {
    let summary = client.run_cycle("v1/update", &query).await?;
    render(&summary, format)
}

pub async fn run_download(
    client: &ApiClient,
    query: CycleQuery,
    format: OutputFormat,
) -> Result<()> {
    let summary = client.run_cycle("v1/download", &query).await?;
    render(&summary, format)
}

fn render(summary: &CycleSummary, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        print_json(summary)?;
    } else {
        print_table(summary);
    }

    if let Some(fault) = &summary.fault {
        anyhow::bail!("cycle aborted: {fault}");
    }
    if summary.failed > 0 {
        anyhow::bail!("{} container(s) failed to update", summary.failed);
    }
    Ok(())
}

fn print_table(summary: &CycleSummary) {
    println!("{}", format!("{} cycle", capitalize(&summary.kind)).bold());
    println!("{}", "=".repeat(50));
    println!(
        "Scanned: {}  Updated: {}  Failed: {}  Skipped: {}  ({})",
        summary.scanned,
        summary.updated.to_string().green(),
        summary.failed.to_string().red(),
        summary.skipped,
        format_duration(&summary.started_at, &summary.finished_at)
    );

    if let Some(fault) = &summary.fault {
        print_error(fault);
        return;
    }

    if summary.stale.is_empty() {
        print_success("All containers are up to date");
    } else {
        print_info(&format!("Stale: {}", summary.stale.join(", ")));
    }

    if !summary.steps.is_empty() {
        let rows: Vec<StepRow> = summary
            .steps
            .iter()
            .map(|step| StepRow {
                container: step.container.clone(),
                action: step.action.clone(),
                result: if step.ok {
                    "ok".green().to_string()
                } else {
                    "failed".red().to_string()
                },
                detail: step.detail.clone().unwrap_or_default(),
            })
            .collect();
        let table = tabled::Table::new(rows)
            .with(tabled::settings::Style::rounded())
            .to_string();
        println!("{}", table);
    }

    for error in &summary.errors {
        print_warning(&format!("{}: {}", error.container, error.message));
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
