use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;

use crate::config::ServerConfig;

/// Start the HTTPS server with TLS termination via rustls.
pub async fn serve_tls(app: Router, addr: SocketAddr, config: &ServerConfig) -> Result<()> {
    let (cert_path, key_path) = config.tls_paths()?;

    let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .context("Failed to load TLS certificates")?;

    axum_server::bind_rustls(addr, tls_config)
        .serve(app.into_make_service())
        .await
        .context("HTTPS server error")?;

    Ok(())
}
