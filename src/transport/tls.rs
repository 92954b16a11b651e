//! Optional TLS wrapping of the raw connection (§4.3.x).
//!
//! Grounded on `tunnel::client::build_tls_config` (a
//! `rustls::ClientConfig` built once from the `webpki-roots` bundle, no
//! client auth) and its `is_tls` branch in `connect_and_run`. Generalized
//! from "wrap a WebSocket upgrade" to "wrap the raw TCP stream before
//! compression negotiation and multiplexing begin", since this transport
//! has no HTTP upgrade step of its own.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::error::SessionError;

/// Builds the shared `rustls::ClientConfig` once per process; cheap to
/// clone (it's an `Arc` internally) so every reconnect attempt reuses it
/// rather than re-parsing the root store.
pub fn build_client_config() -> Arc<ClientConfig> {
    let root_store = tokio_rustls::rustls::RootCertStore::from_iter(
        webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
    );
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

/// Perform the TLS client handshake over an already-connected stream.
pub async fn connect<S>(
    config: Arc<ClientConfig>,
    host: &str,
    stream: S,
) -> Result<TlsStream<S>, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| SessionError::Tls(format!("invalid TLS server name {host:?}: {e}")))?;
    TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| SessionError::Tls(e.to_string()))
}
