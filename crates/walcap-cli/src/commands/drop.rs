use anyhow::{Context, Result};
use colored::Colorize;
use walcap_pg::connect_postgres;
use walcap_pg::replication::slot::slot_row;
use walcap_pg::replication::{drop_publication, drop_slot};

use crate::config::ProjectConfig;

/// Remove the slot, and with `drop_pub` the publication, from the catalog.
pub async fn cmd_drop(config: ProjectConfig, slot: Option<String>, drop_pub: bool) -> Result<()> {
    let client = connect_postgres(&config.postgres_connection_string()?)
        .await
        .context("Failed to connect to Postgres")?;

    let slot = slot.unwrap_or(config.replication.slot);
    match slot_row(&client, &slot).await? {
        Some(row) if row.active => {
            anyhow::bail!("Replication slot '{}' is in use; stop the consumer first", slot)
        }
        Some(_) => {
            drop_slot(&client, &slot).await?;
            println!("{}", format!("Dropped replication slot {}", slot).green());
        }
        None => println!("Replication slot {} does not exist", slot),
    }

    if drop_pub {
        let publication = &config.replication.publication;
        drop_publication(&client, publication).await?;
        println!("{}", format!("Dropped publication {}", publication).green());
    }

    Ok(())
}
