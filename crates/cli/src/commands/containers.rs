//! Container listing

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, ContainerSummary};
use crate::output::{color_status, print_json, print_warning, short_digest, OutputFormat};

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Image")]
    image: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Digest")]
    digest: String,
    #[tabled(rename = "Fingerprint")]
    fingerprint: String,
}

impl From<&ContainerSummary> for ContainerRow {
    fn from(container: &ContainerSummary) -> Self {
        let name = if container.is_self {
            format!("{} (agent)", container.name)
        } else {
            container.name.clone()
        };
        Self {
            name,
            image: container.image.clone(),
            status: color_status(&container.status),
            digest: container
                .digest
                .as_deref()
                .map(short_digest)
                .unwrap_or_else(|| "-".to_string()),
            fingerprint: short_digest(&container.fingerprint),
        }
    }
}

pub async fn list_containers(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let containers: Vec<ContainerSummary> = client.get("v1/containers").await?;

    if format == OutputFormat::Json {
        return print_json(&containers);
    }

    if containers.is_empty() {
        print_warning("No containers found");
        return Ok(());
    }

    let rows: Vec<ContainerRow> = containers.iter().map(ContainerRow::from).collect();
    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::rounded())
        .to_string();
    println!("{}", table);
    println!("\nTotal: {} containers", containers.len());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_marks_agent_and_shortens_digests() {
        colored::control::set_override(false);
        let row = ContainerRow::from(&ContainerSummary {
            name: "fleet-agent".into(),
            id: "abc".into(),
            image: "fleet/agent:1".into(),
            status: "running".into(),
            digest: None,
            is_self: true,
            fingerprint: "f00dfeedbeefcafe0000".into(),
        });
        assert_eq!(row.name, "fleet-agent (agent)");
        assert_eq!(row.digest, "-");
        assert_eq!(row.fingerprint, "f00dfeedbeef");
        assert_eq!(row.status, "running");
    }
}
