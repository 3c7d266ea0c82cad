use anyhow::{Context, Result};
use colored::Colorize;
use tracing::{info, warn};
use walcap_core::LogSink;
use walcap_pg::replication::{ensure_publication, validate_tables_exist, PublicationPlan};
use walcap_pg::{
    bootstrap, connect_postgres, OutputFormat, PgWireTransport, ReplicationSession, SessionEnd,
    ShutdownHandle,
};

use crate::cli::RunArgs;
use crate::config::ProjectConfig;
use crate::env::status_interval_override;

pub async fn cmd_run(mut config: ProjectConfig, args: RunArgs) -> Result<()> {
    apply_overrides(&mut config, args);
    let conn_str = config.postgres_connection_string()?;
    let bootstrap_config = config.bootstrap_config()?;
    let session_config = config.session_config(status_interval_override()?);

    info!(
        slot = %bootstrap_config.slot_name,
        format = %bootstrap_config.output_format,
        "Starting walcap"
    );

    // wal2json decodes every table and has no use for a publication
    if bootstrap_config.output_format == OutputFormat::PgOutput {
        let client = connect_postgres(&conn_str)
            .await
            .context("Failed to connect to Postgres")?;
        let settings = config.publication_settings();
        validate_tables_exist(&client, &settings.tables).await?;
        match ensure_publication(&client, &settings).await? {
            PublicationPlan::Create { .. } => {
                println!("{}", format!("Created publication {}", settings.name).green())
            }
            PublicationPlan::AddTables { missing, .. } => println!(
                "{}",
                format!("Added {} table(s) to publication {}", missing.len(), settings.name).green()
            ),
            PublicationPlan::Reuse => {}
        }
    }

    let mut transport = PgWireTransport::connect(&conn_str)
        .await
        .context("Failed to open replication connection")?;
    let started = bootstrap(&mut transport, &bootstrap_config).await?;
    if started.created {
        println!(
            "{}",
            format!("Created replication slot {}", started.slot.name).green()
        );
    }

    spawn_shutdown_on_ctrl_c(transport.shutdown_handle());

    let mut session = ReplicationSession::new(transport, started.start_lsn, session_config);
    let mut sink = LogSink::new();
    let result = session.run(&mut sink).await;
    let stats = session.stats();
    let lsn = session.confirmed_lsn();

    match result.context("Replication session failed")? {
        SessionEnd::Closed => {
            println!(
                "\n{}",
                format!("Stopped at {} after {} event(s).", lsn, stats.events).green()
            );
            if stats.skipped_rows + stats.skipped_messages > 0 {
                println!(
                    "{}",
                    format!(
                        "Skipped {} row(s) and {} message(s); see the log for details.",
                        stats.skipped_rows, stats.skipped_messages
                    )
                    .yellow()
                );
            }
            Ok(())
        }
        SessionEnd::CopyDone => {
            println!("{}", format!("Server ended the stream at {}.", lsn).yellow());
            Ok(())
        }
        SessionEnd::ServerError(e) => {
            anyhow::bail!("Server ended the stream at {}: {}", lsn, e)
        }
    }
}

fn apply_overrides(config: &mut ProjectConfig, args: RunArgs) {
    let replication = &mut config.replication;
    if let Some(slot) = args.slot {
        replication.slot = slot;
    }
    if let Some(publication) = args.publication {
        replication.publication = publication;
    }
    if let Some(format) = args.output_format {
        replication.output_format = format;
    }
    if args.temporary {
        replication.temporary_slot = true;
    }
    if args.start_lsn.is_some() {
        replication.start_lsn = args.start_lsn;
    }
}

fn spawn_shutdown_on_ctrl_c(shutdown: ShutdownHandle) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt signal (Ctrl+C), closing replication connection");
                shutdown.shutdown();
            }
            Err(e) => warn!(error = %e, "Failed to install Ctrl+C handler"),
        }
    });
}
