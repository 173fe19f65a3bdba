// ABOUTME: TLS-enabled PostgreSQL connection helper shared by the inspector and data transfer
// ABOUTME: Spawns the connection driver task and returns a ready client

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::Client;

use super::models::ConnectionInfo;

pub(crate) async fn connect(info: &ConnectionInfo) -> Result<Client> {
    let tls = TlsConnector::builder()
        .build()
        .context("Failed to build TLS connector")?;
    let connector = MakeTlsConnector::new(tls);

    let (client, connection) = tokio_postgres::connect(&info.to_connection_string(), connector)
        .await
        .with_context(|| {
            format!(
                "Failed to connect to database at {}:{}. Check that the host is reachable and credentials are correct",
                info.host, info.port
            )
        })?;

    let host = info.host.clone();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(host = %host, error = %e, "Database connection error");
        }
    });

    Ok(client)
}
