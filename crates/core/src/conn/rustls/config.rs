//! TLS configuration for rustls listeners.

use std::fs::File;
use std::io::{Error as IoError, Read, Result as IoResult};
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{
    ServerConfig as TlsServerConfig, SupportedCipherSuite, SupportedProtocolVersion,
};

/// Private key and certificate.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct Keycert {
    /// Private key in PEM form.
    pub key: Vec<u8>,
    /// Certificate chain in PEM form.
    pub cert: Vec<u8>,
}

impl Keycert {
    /// Creates a new, empty keycert.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the TLS private key via file path.
    pub fn key_from_path(mut self, path: impl AsRef<Path>) -> IoResult<Self> {
        let mut file = File::open(path.as_ref())?;
        file.read_to_end(&mut self.key)?;
        Ok(self)
    }

    /// Sets the TLS private key via bytes slice.
    #[must_use]
    pub fn key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = key.into();
        self
    }

    /// Sets the certificate chain via file path.
    pub fn cert_from_path(mut self, path: impl AsRef<Path>) -> IoResult<Self> {
        let mut file = File::open(path)?;
        file.read_to_end(&mut self.cert)?;
        Ok(self)
    }

    /// Sets the certificate chain via bytes slice.
    #[must_use]
    pub fn cert(mut self, cert: impl Into<Vec<u8>>) -> Self {
        self.cert = cert.into();
        self
    }

    fn parsed(&self) -> IoResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let certs = rustls_pemfile::certs(&mut self.cert.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| IoError::other("failed to parse tls certificates"))?;
        if certs.is_empty() {
            return Err(IoError::other("no tls certificate found"));
        }
        let key = rustls_pemfile::private_key(&mut self.key.as_slice())
            .map_err(|_| IoError::other("failed to parse tls private key"))?
            .ok_or_else(|| IoError::other("no tls private key found"))?;
        Ok((certs, key))
    }
}

/// Decides the ordered cipher suite list to offer, given the platform's
/// supported list and its defaults. Returning an empty list fails the
/// listener build.
pub type CipherFilter = Arc<
    dyn Fn(&[SupportedCipherSuite], &[SupportedCipherSuite]) -> Vec<SupportedCipherSuite>
        + Send
        + Sync,
>;

/// Builder for the TLS server configuration.
#[derive(Clone)]
pub struct RustlsConfig {
    keycert: Keycert,
    alpn_protocols: Vec<Vec<u8>>,
    tls_versions: Vec<&'static SupportedProtocolVersion>,
    cipher_filter: Option<CipherFilter>,
}

impl std::fmt::Debug for RustlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsConfig")
            .field("alpn_protocols", &self.alpn_protocols)
            .field("has_cipher_filter", &self.cipher_filter.is_some())
            .finish_non_exhaustive()
    }
}

fn alpn_protocols() -> Vec<Vec<u8>> {
    let mut protocols = Vec::with_capacity(2);
    #[cfg(feature = "http2")]
    protocols.push(b"h2".to_vec());
    protocols.push(b"http/1.1".to_vec());
    protocols
}

impl RustlsConfig {
    /// Creates a config serving the given keycert.
    #[must_use]
    pub fn new(keycert: Keycert) -> Self {
        Self {
            keycert,
            alpn_protocols: alpn_protocols(),
            tls_versions: tokio_rustls::rustls::ALL_VERSIONS.to_vec(),
            cipher_filter: None,
        }
    }

    /// Overrides the ALPN protocol list.
    #[must_use]
    pub fn alpn_protocols(mut self, alpn_protocols: impl Into<Vec<Vec<u8>>>) -> Self {
        self.alpn_protocols = alpn_protocols.into();
        self
    }

    /// Restricts the supported TLS versions.
    #[must_use]
    pub fn tls_versions(mut self, versions: &[&'static SupportedProtocolVersion]) -> Self {
        self.tls_versions = versions.to_vec();
        self
    }

    /// Installs a cipher filter consulted with `(supported, default)` suite
    /// lists when the listener is built.
    #[must_use]
    pub fn cipher_filter(mut self, filter: CipherFilter) -> Self {
        self.cipher_filter = Some(filter);
        self
    }

    pub(crate) fn build_server_config(&self) -> IoResult<TlsServerConfig> {
        let mut provider = ring::default_provider();
        if let Some(filter) = &self.cipher_filter {
            let offered = filter(ring::ALL_CIPHER_SUITES, &provider.cipher_suites);
            if offered.is_empty() {
                return Err(IoError::other("cipher filter selected no cipher suites"));
            }
            provider.cipher_suites = offered;
        }
        let (certs, key) = self.keycert.parsed()?;
        let mut config = TlsServerConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&self.tls_versions)
            .map_err(|e| IoError::other(format!("failed to build server config: {e}")))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| IoError::other(format!("failed to build server config: {e}")))?;
        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_alpn_prefers_h2() {
        let config = RustlsConfig::new(Keycert::new());
        #[cfg(feature = "http2")]
        assert_eq!(config.alpn_protocols[0], b"h2".to_vec());
        assert!(config.alpn_protocols.contains(&b"http/1.1".to_vec()));
    }

    #[test]
    fn test_empty_keycert_fails() {
        let config = RustlsConfig::new(Keycert::new());
        assert!(config.build_server_config().is_err());
    }

    #[test]
    fn test_empty_cipher_filter_fails() {
        let config = RustlsConfig::new(Keycert::new())
            .cipher_filter(Arc::new(|_supported, _default| Vec::new()));
        assert!(config.build_server_config().is_err());
    }
}
