// ABOUTME: PostgreSQL connection helpers shared by the source and destination stores
// ABOUTME: TLS policy is set once at startup; connection URLs are sanitized before logging

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::OnceLock;
use tokio_postgres::Client;

static ALLOW_SELF_SIGNED_CERTS: OnceLock<bool> = OnceLock::new();

/// Set the TLS policy for every later connection. Only the first call has an effect.
pub fn init_tls_policy(allow_self_signed_certs: bool) {
    if ALLOW_SELF_SIGNED_CERTS.set(allow_self_signed_certs).is_err() {
        tracing::debug!("TLS policy already initialized");
    }
    if allow_self_signed_certs {
        tracing::warn!("Accepting self-signed TLS certificates; use only for testing");
    }
}

fn allow_self_signed_certs() -> bool {
    ALLOW_SELF_SIGNED_CERTS.get().copied().unwrap_or(false)
}

fn make_tls() -> Result<MakeTlsConnector> {
    let mut builder = TlsConnector::builder();
    if allow_self_signed_certs() {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Open a connection and drive it on a background task.
pub async fn connect(url: &str) -> Result<Client> {
    let tls = make_tls()?;
    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    tracing::debug!("Connected to {}", sanitize_url(url));
    Ok(client)
}

/// Mask the password of a connection URL.
///
/// Strings that do not parse as URLs (key/value connection strings) are
/// returned with any `password=` value masked.
pub fn sanitize_url(url: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        return parsed.to_string();
    }

    url.split_whitespace()
        .map(|part| {
            if part.to_ascii_lowercase().starts_with("password=") {
                "password=***".to_string()
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
