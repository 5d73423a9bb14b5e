//! TLS adaptor built from in-memory PEM material.
//!
//! Reading PEM files from disk lives in
//! [`config_file::load_tls_material`](super::config_file::load_tls_material);
//! this module only ever sees buffers.

use crate::domain::errors::{EventbusError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::fmt;
use std::io::BufReader;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// PEM buffers for building a [`TlsAdaptor`].
#[derive(Clone, Default)]
pub struct TlsMaterial {
    /// Trusted CA bundle. `None` trusts the bundled web PKI roots.
    pub ca_pem: Option<Vec<u8>>,
    /// Client certificate chain for mutual TLS.
    pub cert_chain_pem: Option<Vec<u8>>,
    /// Client private key for mutual TLS (PKCS#1, PKCS#8 or SEC1).
    pub key_pem: Option<Vec<u8>>,
    /// Name the server certificate must be valid for.
    pub server_name: String,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_pem", &self.ca_pem.as_ref().map(Vec::len))
            .field("cert_chain_pem", &self.cert_chain_pem.as_ref().map(Vec::len))
            .field("key_pem", &self.key_pem.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}

/// Upgrades a transport stream to TLS.
#[derive(Clone)]
pub struct TlsAdaptor {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    mutual: bool,
}

impl TlsAdaptor {
    /// Mutual TLS: verify the server and present a client certificate.
    pub fn with_client_auth(
        ca_pem: Option<&[u8]>,
        cert_chain_pem: &[u8],
        key_pem: &[u8],
        server_name: &str,
    ) -> Result<Self> {
        let certs = parse_certs(cert_chain_pem)?;
        if certs.is_empty() {
            return Err(tls_error("no client certificate found"));
        }
        let key = parse_private_key(key_pem)?;
        let config = client_builder(ca_pem)?
            .with_client_auth_cert(certs, key)
            .map_err(tls_error)?;
        Self::build(config, server_name, true)
    }

    /// Server verification only.
    pub fn without_client_auth(ca_pem: Option<&[u8]>, server_name: &str) -> Result<Self> {
        let config = client_builder(ca_pem)?.with_no_client_auth();
        Self::build(config, server_name, false)
    }

    pub fn from_material(material: &TlsMaterial) -> Result<Self> {
        match (&material.cert_chain_pem, &material.key_pem) {
            (Some(chain), Some(key)) => Self::with_client_auth(
                material.ca_pem.as_deref(),
                chain,
                key,
                &material.server_name,
            ),
            (None, None) => {
                Self::without_client_auth(material.ca_pem.as_deref(), &material.server_name)
            }
            _ => Err(tls_error(
                "client certificate and private key must be given together",
            )),
        }
    }

    fn build(config: ClientConfig, server_name: &str, mutual: bool) -> Result<Self> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| tls_error(format!("invalid server name {server_name:?}: {e}")))?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
            mutual,
        })
    }

    pub fn server_name(&self) -> String {
        self.server_name.to_str().into_owned()
    }

    /// Run the TLS handshake over `stream`.
    pub async fn connect<S>(&self, stream: S) -> Result<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let tls = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(tls_error)?;
        debug!(
            server_name = %self.server_name.to_str(),
            mutual = self.mutual,
            "TLS handshake complete"
        );
        Ok(tls)
    }
}

impl fmt::Debug for TlsAdaptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAdaptor")
            .field("server_name", &self.server_name.to_str())
            .field("mutual", &self.mutual)
            .finish()
    }
}

fn client_builder(
    ca_pem: Option<&[u8]>,
) -> Result<rustls::ConfigBuilder<ClientConfig, rustls::client::WantsClientCert>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?;
    Ok(builder.with_root_certificates(root_store(ca_pem)?))
}

fn root_store(ca_pem: Option<&[u8]>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match ca_pem {
        Some(pem) => {
            let certs = parse_certs(pem)?;
            if certs.is_empty() {
                return Err(tls_error("CA bundle contains no certificates"));
            }
            for cert in certs {
                roots.add(cert).map_err(tls_error)?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| tls_error(format!("invalid certificate PEM: {e}")))
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .map_err(|e| tls_error(format!("invalid private key PEM: {e}")))?
        .ok_or_else(|| tls_error("no private key found"))
}

fn tls_error(e: impl fmt::Display) -> EventbusError {
    EventbusError::TlsHandshake(e.to_string())
}
