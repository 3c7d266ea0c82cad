//! Session bootstrap: identify the system, reuse or create the slot, and
//! switch the connection into streaming mode.

use tracing::{info, warn};

use super::lsn::Lsn;
use super::transport::{
    OutputFormat, ReplicationCommands, ReplicationSlot, SlotInfo, SystemIdentification,
};
use crate::error::{PgError, PgResult};

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub slot_name: String,
    pub publication: String,
    pub output_format: OutputFormat,
    pub temporary_slot: bool,
    /// Overrides the slot's confirmed position as the stream start.
    pub start_lsn: Option<Lsn>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            slot_name: "walcap".to_string(),
            publication: "walcap_pub".to_string(),
            output_format: OutputFormat::PgOutput,
            temporary_slot: false,
            start_lsn: None,
        }
    }
}

/// State of a connection that is now streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrapped {
    pub identity: SystemIdentification,
    pub slot: ReplicationSlot,
    pub start_lsn: Lsn,
    /// Whether this run created the slot.
    pub created: bool,
}

/// Bring a replication connection to the streaming state.
///
/// Every failure here is fatal for the session.
pub async fn bootstrap<C>(commands: &mut C, config: &BootstrapConfig) -> PgResult<Bootstrapped>
where
    C: ReplicationCommands + ?Sized,
{
    let identity = commands.identify_system().await.map_err(|e| match e {
        e @ PgError::IdentifySystem(_) => e,
        other => PgError::IdentifySystem(other.to_string()),
    })?;
    info!(
        system_id = %identity.system_id,
        timeline = identity.timeline,
        xlog_pos = %identity.xlog_pos,
        dbname = %identity.dbname,
        "Identified system"
    );

    let slot = ReplicationSlot {
        name: config.slot_name.clone(),
        output_format: config.output_format,
        temporary: config.temporary_slot,
    };

    let (start_lsn, created) = match commands.find_slot(&slot.name).await? {
        Some(existing) => {
            check_plugin(&existing, config.output_format)?;
            if existing.temporary != slot.temporary {
                warn!(
                    slot = %slot.name,
                    temporary = existing.temporary,
                    "Existing slot differs in persistence from configuration, reusing it"
                );
            }
            let start = config
                .start_lsn
                .or(existing.confirmed_flush)
                .unwrap_or(identity.xlog_pos);
            info!(slot = %slot.name, lsn = %start, "Using existing replication slot");
            (start, false)
        }
        None => {
            commands.create_slot(&slot).await.map_err(|e| match e {
                e @ PgError::SlotCreationFailed(_) => e,
                other => PgError::SlotCreationFailed(other.to_string()),
            })?;
            let start = config.start_lsn.unwrap_or(identity.xlog_pos);
            info!(
                slot = %slot.name,
                plugin = config.output_format.plugin_name(),
                temporary = slot.temporary,
                lsn = %start,
                "Created replication slot"
            );
            (start, true)
        }
    };

    let options = config.output_format.start_options(&config.publication);
    commands
        .start_replication(&slot.name, start_lsn, &options)
        .await
        .map_err(|e| match e {
            e @ PgError::StartReplication(_) => e,
            other => PgError::StartReplication(other.to_string()),
        })?;
    info!(slot = %slot.name, lsn = %start_lsn, "Started streaming replication");

    Ok(Bootstrapped {
        identity,
        slot,
        start_lsn,
        created,
    })
}

// A slot decoding with another plugin belongs to someone else; never drop it.
fn check_plugin(existing: &SlotInfo, expected: OutputFormat) -> PgResult<()> {
    if existing.plugin.as_deref() == Some(expected.plugin_name()) {
        return Ok(());
    }
    Err(PgError::SlotPluginMismatch {
        slot: existing.name.clone(),
        expected: expected.plugin_name().to_string(),
        actual: existing.plugin.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct FakeCommands {
        slot: Option<SlotInfo>,
        fail_identify: bool,
        fail_create: bool,
        fail_start: bool,
        created: Vec<ReplicationSlot>,
        started: Vec<(String, Lsn, Vec<String>)>,
    }

    #[async_trait]
    impl ReplicationCommands for FakeCommands {
        async fn identify_system(&mut self) -> PgResult<SystemIdentification> {
            if self.fail_identify {
                return Err(PgError::ConnectionClosed);
            }
            Ok(SystemIdentification {
                system_id: "7310000000000000000".to_string(),
                timeline: 1,
                xlog_pos: Lsn::new(0x5000),
                dbname: "app".to_string(),
            })
        }

        async fn find_slot(&mut self, name: &str) -> PgResult<Option<SlotInfo>> {
            Ok(self.slot.clone().filter(|s| s.name == name))
        }

        async fn create_slot(&mut self, slot: &ReplicationSlot) -> PgResult<()> {
            if self.fail_create {
                return Err(PgError::Postgres("permission denied".into()));
            }
            self.created.push(slot.clone());
            Ok(())
        }

        async fn start_replication(
            &mut self,
            slot: &str,
            start: Lsn,
            options: &[String],
        ) -> PgResult<()> {
            if self.fail_start {
                return Err(PgError::Postgres("publication does not exist".into()));
            }
            self.started.push((slot.to_string(), start, options.to_vec()));
            Ok(())
        }
    }

    fn existing(plugin: &str, confirmed_flush: Option<u64>) -> SlotInfo {
        SlotInfo {
            name: "walcap".to_string(),
            plugin: Some(plugin.to_string()),
            confirmed_flush: confirmed_flush.map(Lsn::new),
            temporary: false,
        }
    }

    #[tokio::test]
    async fn test_creates_missing_slot_and_starts_at_xlog_pos() {
        let mut commands = FakeCommands::default();
        let result = bootstrap(&mut commands, &BootstrapConfig::default())
            .await
            .unwrap();

        assert!(result.created);
        assert_eq!(result.start_lsn, Lsn::new(0x5000));
        assert_eq!(commands.created.len(), 1);
        assert_eq!(commands.created[0].output_format, OutputFormat::PgOutput);
        assert_eq!(
            commands.started,
            vec![(
                "walcap".to_string(),
                Lsn::new(0x5000),
                vec![
                    "proto_version '1'".to_string(),
                    "publication_names 'walcap_pub'".to_string()
                ]
            )]
        );
    }

    #[tokio::test]
    async fn test_reuses_existing_slot_from_confirmed_flush() {
        let mut commands = FakeCommands {
            slot: Some(existing("pgoutput", Some(0x4000))),
            ..Default::default()
        };
        let result = bootstrap(&mut commands, &BootstrapConfig::default())
            .await
            .unwrap();

        assert!(!result.created);
        assert!(commands.created.is_empty());
        assert_eq!(result.start_lsn, Lsn::new(0x4000));
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let mut commands = FakeCommands::default();
        bootstrap(&mut commands, &BootstrapConfig::default())
            .await
            .unwrap();

        commands.slot = Some(existing("pgoutput", None));
        let second = bootstrap(&mut commands, &BootstrapConfig::default())
            .await
            .unwrap();

        assert!(!second.created);
        assert_eq!(commands.created.len(), 1);
        // no confirmed position yet: fall back to the current WAL position
        assert_eq!(second.start_lsn, Lsn::new(0x5000));
    }

    #[tokio::test]
    async fn test_start_lsn_override_wins() {
        let mut commands = FakeCommands {
            slot: Some(existing("pgoutput", Some(0x4000))),
            ..Default::default()
        };
        let config = BootstrapConfig {
            start_lsn: Some(Lsn::new(0x4800)),
            ..Default::default()
        };
        let result = bootstrap(&mut commands, &config).await.unwrap();
        assert_eq!(result.start_lsn, Lsn::new(0x4800));
    }

    #[tokio::test]
    async fn test_foreign_plugin_is_rejected() {
        let mut commands = FakeCommands {
            slot: Some(existing("test_decoding", Some(0x4000))),
            ..Default::default()
        };
        let err = bootstrap(&mut commands, &BootstrapConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PgError::SlotPluginMismatch { ref actual, .. } if actual.as_deref() == Some("test_decoding")
        ));
        assert!(commands.started.is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_typed() {
        let mut commands = FakeCommands {
            fail_identify: true,
            ..Default::default()
        };
        assert!(matches!(
            bootstrap(&mut commands, &BootstrapConfig::default()).await,
            Err(PgError::IdentifySystem(_))
        ));

        let mut commands = FakeCommands {
            fail_create: true,
            ..Default::default()
        };
        assert!(matches!(
            bootstrap(&mut commands, &BootstrapConfig::default()).await,
            Err(PgError::SlotCreationFailed(_))
        ));

        let mut commands = FakeCommands {
            fail_start: true,
            ..Default::default()
        };
        assert!(matches!(
            bootstrap(&mut commands, &BootstrapConfig::default()).await,
            Err(PgError::StartReplication(_))
        ));
    }

    #[tokio::test]
    async fn test_temporary_wal2json_slot() {
        let mut commands = FakeCommands::default();
        let config = BootstrapConfig {
            output_format: OutputFormat::Wal2Json,
            temporary_slot: true,
            ..Default::default()
        };
        let result = bootstrap(&mut commands, &config).await.unwrap();

        assert!(result.slot.temporary);
        assert_eq!(commands.created[0].output_format, OutputFormat::Wal2Json);
        assert!(commands.started[0]
            .2
            .contains(&"\"format-version\" '2'".to_string()));
    }
}
