//! Agent health and readiness

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use tabled::Tabled;

use crate::client::{ApiClient, HealthResponse, ReadinessResponse};
use crate::output::{color_status, print_json, print_warning, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
}

#[derive(Serialize)]
struct StatusReport {
    health: HealthResponse,
    readiness: ReadinessResponse,
}

pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let (_, health): (_, HealthResponse) = client.get_status("healthz").await?;
    let (_, readiness): (_, ReadinessResponse) = client.get_status("readyz").await?;

    if format == OutputFormat::Json {
        return print_json(&StatusReport { health, readiness });
    }

    println!("{}", "Agent Status".bold());
    println!("{}", "=".repeat(50));
    println!("Health:  {}", color_status(&health.status));
    let ready = if readiness.ready {
        "ready".green().to_string()
    } else {
        "not ready".red().to_string()
    };
    println!("Ready:   {}", ready);
    if let Some(reason) = &readiness.reason {
        print_warning(reason);
    }
    println!();

    let rows: Vec<ComponentRow> = health
        .components
        .iter()
        .map(|(name, component)| ComponentRow {
            name: name.clone(),
            status: color_status(&component.status),
            message: component.message.clone().unwrap_or_default(),
        })
        .collect();
    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::rounded())
        .to_string();
    println!("{}", table);

    Ok(())
}
