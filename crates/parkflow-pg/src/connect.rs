//! Postgres connection with TLS support.

use std::future::Future;
use std::sync::Arc;

use rustls::ClientConfig;
use tokio_postgres::{Client, NoTls};
use tokio_postgres_rustls_improved::MakeRustlsConnect;
use tracing::{debug, error};

use crate::error::{PgError, PgResult};

/// sslmode values that mean the server certificate must be checked.
const TLS_MODES: [&str; 3] = ["require", "verify-ca", "verify-full"];

/// Connect with TLS when the connection string asks for it, and drive the
/// connection on a background task.
pub async fn connect_postgres(connection_string: &str) -> PgResult<Client> {
    let tls = requires_tls(connection_string);

    let client = if tls {
        let connector = MakeRustlsConnect::new(tls_config()?);
        let (client, connection) = tokio_postgres::connect(connection_string, connector)
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;
        tokio::spawn(drive(connection));
        client
    } else {
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;
        tokio::spawn(drive(connection));
        client
    };

    debug!(tls, "Connected to Postgres");
    Ok(client)
}

async fn drive(connection: impl Future<Output = Result<(), tokio_postgres::Error>>) {
    if let Err(e) = connection.await {
        error!(error = %e, "Postgres connection error");
    }
}

fn tls_config() -> PgResult<ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Ok(
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| PgError::Connection(format!("TLS config error: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Works for both URL (`?sslmode=require`) and key/value
/// (`sslmode=require`) connection strings.
fn requires_tls(connection_string: &str) -> bool {
    connection_string
        .split(|c: char| c == '?' || c == '&' || c.is_whitespace())
        .filter_map(|param| param.split_once('='))
        .any(|(key, value)| key.trim() == "sslmode" && TLS_MODES.contains(&value.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_tls() {
        assert!(requires_tls("postgres://u:p@db.example.com/parking?sslmode=require"));
        assert!(requires_tls("postgresql://db/parking?application_name=x&sslmode=verify-full"));
        assert!(requires_tls("host=db dbname=parking sslmode=verify-ca"));
        assert!(!requires_tls("postgres://localhost:5432/parking_data"));
        assert!(!requires_tls("postgres://localhost/parking?sslmode=disable"));
        assert!(!requires_tls("host=localhost sslmode=prefer"));
    }
}
