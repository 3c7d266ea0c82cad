//! Control connection setup with TLS support.

use std::sync::Arc;

use rustls::ClientConfig;
use tokio_postgres::Client;
use tokio_postgres_rustls_improved::MakeRustlsConnect;
use tracing::debug;

use crate::conninfo::{control_connection_string, ConnInfo};
use crate::error::{PgError, PgResult};

/// Connect a regular SQL client, with TLS when the connection string's
/// sslmode asks for it. Any `replication` parameter is stripped first.
/// Spawns the connection task and returns only the client.
pub async fn connect_postgres(connection_string: &str) -> PgResult<Client> {
    let info = ConnInfo::parse(connection_string)?;
    let connection_string = control_connection_string(connection_string)?;
    debug!(host = %info.host, port = info.port, database = %info.database, "Opening control connection");

    if info.ssl_mode.requires_tls() {
        let connector = MakeRustlsConnect::new(tls_client_config()?);
        let (client, connection) = tokio_postgres::connect(&connection_string, connector)
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "Postgres connection error");
            }
        });

        Ok(client)
    } else {
        let (client, connection) =
            tokio_postgres::connect(&connection_string, tokio_postgres::NoTls)
                .await
                .map_err(|e| PgError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "Postgres connection error");
            }
        });

        Ok(client)
    }
}

/// rustls client configuration trusting the webpki roots.
pub(crate) fn tls_client_config() -> PgResult<ClientConfig> {
    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| PgError::Tls(format!("TLS config error: {}", e)))?
            .with_root_certificates(root_certs())
            .with_no_client_auth();
    Ok(config)
}

fn root_certs() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}
