use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use common_config::load;
use common_obs::ObsInit;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig as RustlsServerConfig;
use token_verifier::config::{TlsConfig, TokenVerifierConfig};
use token_verifier::verifier::TokenVerifier;
use token_verifier::{build_router, AppState, SERVICE_NAME, VERSION};
use tokio::fs;
use tokio::net::TcpListener;

fn build_sha() -> &'static str {
    option_env!("BUILD_SHA").unwrap_or("unknown")
}

fn build_time() -> &'static str {
    option_env!("BUILD_TIME").unwrap_or("unknown")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ObsInit::init(SERVICE_NAME).map_err(|err| -> Box<dyn std::error::Error> { Box::new(err) })?;

    let config = load::<TokenVerifierConfig>()?;
    let addr = config.socket_addr()?;
    tracing::info!(
        event = "service_start",
        service = SERVICE_NAME,
        version = VERSION,
        build_sha = build_sha(),
        build_time = build_time(),
        listen_addr = %addr,
        provider = %config.provider.domain,
        tls = config.tls.is_some(),
        "starting service"
    );

    let verifier = TokenVerifier::from_config(&config)?;
    let router = build_router(Arc::new(AppState { verifier }));
    let service = router.into_make_service_with_connect_info::<SocketAddr>();

    match &config.tls {
        Some(tls) => {
            let rustls_config = build_rustls_config(tls).await?;
            axum_server::bind_rustls(addr, rustls_config)
                .serve(service)
                .await?;
        }
        None => {
            let listener = TcpListener::bind(addr).await?;
            axum::serve(listener, service).await?;
        }
    }

    tracing::info!(event = "service_stop", service = SERVICE_NAME);

    Ok(())
}

async fn build_rustls_config(
    config: &TlsConfig,
) -> Result<RustlsConfig, Box<dyn std::error::Error>> {
    let certs = load_certs(&config.cert_path).await?;
    let key = load_private_key(&config.key_path).await?;

    let server_config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(RustlsConfig::from_config(Arc::new(server_config)))
}

async fn load_certs(
    path: &Path,
) -> Result<Vec<CertificateDer<'static>>, Box<dyn std::error::Error>> {
    let bytes = fs::read(path).await?;
    let mut reader = std::io::Cursor::new(bytes);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(format!("no certificates found in {}", path.display()).into());
    }
    Ok(certs)
}

async fn load_private_key(
    path: &Path,
) -> Result<PrivateKeyDer<'static>, Box<dyn std::error::Error>> {
    let bytes = fs::read(path).await?;
    let mut reader = std::io::Cursor::new(bytes);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| format!("no private key found in {}", path.display()).into())
}
