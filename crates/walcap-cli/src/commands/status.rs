use anyhow::{Context, Result};
use colored::Colorize;
use walcap_pg::connect_postgres;
use walcap_pg::replication::{check_replication_setup, PublicationStatus, SlotStatus};

use crate::config::ProjectConfig;

pub async fn cmd_status(
    config: ProjectConfig,
    slot: Option<String>,
    publication: Option<String>,
) -> Result<()> {
    let client = connect_postgres(&config.postgres_connection_string()?)
        .await
        .context("Failed to connect to Postgres")?;

    let slot = slot.unwrap_or(config.replication.slot);
    let publication = publication.unwrap_or(config.replication.publication);
    let plugin = config.replication.output_format.plugin_name();

    let status = check_replication_setup(&client, &slot, plugin, &publication).await?;

    println!("\nReplication Status:");
    println!("{:-<60}", "");

    match &status.slot {
        SlotStatus::Ready {
            active,
            confirmed_flush,
        } => {
            let confirmed = confirmed_flush
                .map(|l| l.to_string())
                .unwrap_or_else(|| "-".to_string());
            let state = if *active { "active".green() } else { "idle".yellow() };
            println!("{:<14} {} ({}, {})", "Slot", slot, plugin, state);
            println!("{:<14} {}", "Confirmed", confirmed);
        }
        SlotStatus::WrongPlugin { plugin: actual } => {
            println!(
                "{:<14} {} {}",
                "Slot",
                slot,
                format!(
                    "uses plugin {}, expected {}",
                    actual.as_deref().unwrap_or("<none>"),
                    plugin
                )
                .red()
            );
        }
        SlotStatus::Missing => {
            println!("{:<14} {} {}", "Slot", slot, "missing".yellow());
        }
    }

    match &status.publication {
        PublicationStatus::Exists { tables } => {
            println!("{:<14} {} ({} table(s))", "Publication", publication, tables.len());
            for table in tables {
                println!("{:<14} {}", "", table);
            }
        }
        PublicationStatus::Missing => {
            println!("{:<14} {} {}", "Publication", publication, "missing".yellow());
        }
    }

    println!();
    if status.is_ready() {
        println!("{}", "Ready to stream.".green());
    } else {
        println!("Run 'walcap run' to create what is missing.");
    }
    Ok(())
}
