use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use walcap_pg::replication::{parse_table_ref, PublicationSettings};
use walcap_pg::{BootstrapConfig, Lsn, OutputFormat, SessionConfig};

/// Project configuration from walcap.toml
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub postgres: PostgresConfig,
    pub replication: ReplicationConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub connection_string: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            connection_string: "${DATABASE_URL}".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub slot: String,
    pub publication: String,
    pub output_format: OutputFormat,
    pub temporary_slot: bool,
    pub create_publication: bool,
    /// `schema.table` or bare `table`; empty publishes every table.
    pub tables: Vec<String>,
    pub status_interval_secs: u64,
    pub start_lsn: Option<String>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            slot: "walcap".to_string(),
            publication: "walcap_pub".to_string(),
            output_format: OutputFormat::PgOutput,
            temporary_slot: false,
            create_publication: true,
            tables: Vec::new(),
            status_interval_secs: 10,
            start_lsn: None,
        }
    }
}

impl ProjectConfig {
    /// Load walcap.toml, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: ProjectConfig = toml::from_str(content)?;
        if config.replication.status_interval_secs == 0 {
            anyhow::bail!("replication.status_interval_secs must be greater than zero");
        }
        Ok(config)
    }

    /// Resolve environment variables in a string.
    /// Supports ${VAR_NAME} syntax.
    pub fn resolve_env(s: &str) -> String {
        let mut result = s.to_string();

        while let Some(start) = result.find("${") {
            if let Some(end) = result[start..].find('}') {
                let var_name = &result[start + 2..start + end];
                let value = std::env::var(var_name).unwrap_or_default();
                result = format!("{}{}{}", &result[..start], value, &result[start + end + 1..]);
            } else {
                break;
            }
        }

        result
    }

    /// Get the resolved Postgres connection string.
    pub fn postgres_connection_string(&self) -> Result<String> {
        let resolved = Self::resolve_env(&self.postgres.connection_string);
        if resolved.trim().is_empty() {
            anyhow::bail!(
                "Postgres connection string is empty.\n\
                Set DATABASE_URL or [postgres].connection_string in walcap.toml."
            );
        }
        Ok(resolved)
    }

    pub fn start_lsn(&self) -> Result<Option<Lsn>> {
        self.replication
            .start_lsn
            .as_deref()
            .map(|s| s.parse::<Lsn>().with_context(|| format!("Invalid start_lsn '{}'", s)))
            .transpose()
    }

    pub fn bootstrap_config(&self) -> Result<BootstrapConfig> {
        Ok(BootstrapConfig {
            slot_name: self.replication.slot.clone(),
            publication: self.replication.publication.clone(),
            output_format: self.replication.output_format,
            temporary_slot: self.replication.temporary_slot,
            start_lsn: self.start_lsn()?,
        })
    }

    pub fn publication_settings(&self) -> PublicationSettings {
        PublicationSettings {
            name: self.replication.publication.clone(),
            tables: self
                .replication
                .tables
                .iter()
                .map(|t| parse_table_ref(t))
                .collect(),
            create_if_missing: self.replication.create_publication,
        }
    }

    /// Session settings; `interval_override` comes from the environment.
    pub fn session_config(&self, interval_override: Option<Duration>) -> SessionConfig {
        SessionConfig {
            status_interval: interval_override
                .unwrap_or(Duration::from_secs(self.replication.status_interval_secs)),
            output_format: self.replication.output_format,
        }
    }
}
