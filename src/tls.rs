//! TLS client configuration for ldaps:// and StartTLS: trust roots, optional
//! client certificate, optional verification bypass.

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::SignatureScheme;
use rustls_pemfile::certs;
use rustls_pki_types::ServerName;
use std::fmt;
use std::fs;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Where trust and identity material comes from.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Load the platform trust store.
    pub use_native_roots: bool,
    /// Extra CA certificates (PEM file).
    pub ca_file: Option<PathBuf>,
    /// Extra CA certificates (PEM bytes).
    pub ca_pem: Option<Vec<u8>>,
    /// Client certificate chain and key (PEM files), e.g. for SASL EXTERNAL.
    pub client_cert_file: Option<PathBuf>,
    pub client_key_file: Option<PathBuf>,
    /// Accept any server certificate. Test setups only.
    pub skip_verify: bool,
    /// Name to verify instead of the endpoint host.
    pub server_name: Option<String>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            use_native_roots: true,
            ca_file: None,
            ca_pem: None,
            client_cert_file: None,
            client_key_file: None,
            skip_verify: false,
            server_name: None,
        }
    }
}

/// A built client configuration, shared by every connection to the endpoints
/// that use it.
#[derive(Clone)]
pub struct TlsSettings {
    config: Arc<ClientConfig>,
    server_name: Option<String>,
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsSettings {
    pub fn from_options(options: &TlsOptions) -> Result<Self> {
        let mut root_store = rustls::RootCertStore::empty();
        if options.use_native_roots && !options.skip_verify {
            for cert in rustls_native_certs::load_native_certs().context("Load system CA certs")? {
                let _ = root_store.add(cert);
            }
        }
        if let Some(path) = &options.ca_file {
            for cert in load_certs_from_file(path)? {
                root_store
                    .add(cert)
                    .with_context(|| format!("Add CA from {}", path.display()))?;
            }
        }
        if let Some(pem) = &options.ca_pem {
            for cert in certs(&mut std::io::Cursor::new(pem)) {
                let cert = cert.context("Parse CA PEM")?;
                root_store.add(cert).context("Add CA from PEM")?;
            }
        }

        let builder = ClientConfig::builder().with_root_certificates(root_store);
        let mut config = match (&options.client_cert_file, &options.client_key_file) {
            (Some(cert_file), Some(key_file)) => {
                let chain = load_certs_from_file(cert_file)?;
                let key = load_private_key_from_file(key_file)?;
                builder
                    .with_client_auth_cert(chain, key)
                    .context("Build ClientConfig with client certificate")?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => anyhow::bail!("client_cert_file and client_key_file must be set together"),
        };
        if options.skip_verify {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(InsecureServerVerifier));
        }
        Ok(Self {
            config: Arc::new(config),
            server_name: options.server_name.clone(),
        })
    }

    /// Trust the platform store only.
    pub fn with_native_roots() -> Result<Self> {
        Self::from_options(&TlsOptions::default())
    }

    /// Accept any certificate.
    pub fn insecure() -> Self {
        let mut config = ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(InsecureServerVerifier));
        Self {
            config: Arc::new(config),
            server_name: None,
        }
    }

    pub fn from_client_config(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            server_name: None,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.config))
    }

    /// SNI / verification name for a connection to `host`.
    pub fn server_name_for(&self, host: &str) -> Result<ServerName<'static>> {
        let name = self.server_name.as_deref().unwrap_or(host);
        ServerName::try_from(name.to_string())
            .map_err(|_| anyhow::anyhow!("Invalid hostname for TLS SNI: {}", name))
    }
}

fn load_certs_from_file(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Open cert file: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_private_key_from_file(path: &PathBuf) -> Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path).with_context(|| format!("Open key file: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .context("Parse PEM private key")?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path.display()))
}

/// Verifier that accepts any server certificate. Only for `skip_verify`.
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_server_name_override() {
        let settings = TlsSettings::insecure().with_server_name("ldap.example.com");
        match settings.server_name_for("10.0.0.1").unwrap() {
            ServerName::DnsName(dns) => assert_eq!(dns.as_ref(), "ldap.example.com"),
            other => panic!("unexpected server name {:?}", other),
        }
    }

    #[test]
    fn test_server_name_from_host() {
        let settings = TlsSettings::insecure();
        assert!(settings.server_name_for("ldap.example.com").is_ok());
        assert!(settings.server_name_for("127.0.0.1").is_ok());
        assert!(settings.server_name_for("not a host!").is_err());
    }

    #[test]
    fn test_empty_ca_file_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not a certificate\n").unwrap();
        let options = TlsOptions {
            use_native_roots: false,
            ca_file: Some(file.path().to_path_buf()),
            ..TlsOptions::default()
        };
        let err = TlsSettings::from_options(&options).unwrap_err();
        assert!(err.to_string().contains("No certificates found"));
    }

    #[test]
    fn test_client_cert_requires_key() {
        let options = TlsOptions {
            use_native_roots: false,
            client_cert_file: Some(PathBuf::from("/nonexistent/cert.pem")),
            ..TlsOptions::default()
        };
        assert!(TlsSettings::from_options(&options).is_err());
    }

    #[test]
    fn test_skip_verify_without_roots_builds() {
        let options = TlsOptions {
            skip_verify: true,
            ..TlsOptions::default()
        };
        assert!(TlsSettings::from_options(&options).is_ok());
    }
}
