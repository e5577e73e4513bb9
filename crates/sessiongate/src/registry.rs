use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, info};

use crate::api::v1::SessionOwner;
use crate::util::errors::{Error, Result, StdError};

/// Registration input from the data-plane controller.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub session_name: String,
    pub owner: SessionOwner,
    /// `https://host:port` of the hosted API server.
    pub backend_url: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: Option<String>,
    pub insecure_skip_verify: bool,
}

/// Resolved per-session upstream: parsed backend address plus the rustls
/// client config carrying the session's client certificate.
pub struct SessionUpstream {
    pub session_name: String,
    pub owner: SessionOwner,
    pub backend_url: String,
    pub host: String,
    pub port: u16,
    pub tls: Arc<ClientConfig>,
    cert_pem: String,
    key_pem: String,
}

impl SessionUpstream {
    fn same_credentials(&self, opts: &SessionOptions) -> bool {
        self.cert_pem == opts.cert_pem
            && self.key_pem == opts.key_pem
            && self.backend_url == opts.backend_url
    }
}

/// sessionName -> upstream map shared between the data-plane controller
/// (writer) and the proxy (reader). Replacement swaps the whole Arc, so a
/// request in flight keeps the config it looked up; no request ever sees a
/// mixed key/cert pair.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<HashMap<String, Arc<SessionUpstream>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: identical credentials are a no-op, changed credentials
    /// atomically replace the upstream.
    pub fn register(&self, opts: SessionOptions) -> Result<()> {
        {
            let inner = self.inner.read().unwrap();
            if let Some(existing) = inner.get(&opts.session_name) {
                if existing.same_credentials(&opts) {
                    debug!(session = %opts.session_name, "registration unchanged");
                    return Ok(());
                }
            }
        }
        let upstream = Arc::new(build_upstream(opts)?);
        info!(session = %upstream.session_name, backend = %upstream.backend_url, "registered session upstream");
        self.inner
            .write()
            .unwrap()
            .insert(upstream.session_name.clone(), upstream);
        Ok(())
    }

    /// Idempotent removal.
    pub fn unregister(&self, session_name: &str) {
        if self.inner.write().unwrap().remove(session_name).is_some() {
            info!(session = %session_name, "unregistered session upstream");
        }
    }

    pub fn get(&self, session_name: &str) -> Option<Arc<SessionUpstream>> {
        self.inner.read().unwrap().get(session_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, upstream: SessionUpstream) {
        self.inner
            .write()
            .unwrap()
            .insert(upstream.session_name.clone(), Arc::new(upstream));
    }
}

#[cfg(test)]
impl SessionUpstream {
    pub(crate) fn for_test(session_name: &str, owner: SessionOwner, host: &str, port: u16) -> Self {
        let tls = ClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        SessionUpstream {
            session_name: session_name.to_string(),
            owner,
            backend_url: format!("https://{host}:{port}"),
            host: host.to_string(),
            port,
            tls: Arc::new(tls),
            cert_pem: "test-cert".to_string(),
            key_pem: "test-key".to_string(),
        }
    }
}

fn build_upstream(opts: SessionOptions) -> Result<SessionUpstream> {
    let (host, port) = parse_backend(&opts.backend_url)?;
    let tls = build_tls_config(&opts)?;
    Ok(SessionUpstream {
        host,
        port,
        tls: Arc::new(tls),
        session_name: opts.session_name,
        owner: opts.owner,
        backend_url: opts.backend_url,
        cert_pem: opts.cert_pem,
        key_pem: opts.key_pem,
    })
}

fn parse_backend(backend_url: &str) -> Result<(String, u16)> {
    let rest = backend_url.strip_prefix("https://").ok_or_else(|| {
        Error::StdError(StdError::InvalidArgument(format!(
            "backend url must be https: {backend_url}"
        )))
    })?;
    let authority = rest.split('/').next().unwrap_or_default();
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                Error::StdError(StdError::InvalidArgument(format!(
                    "invalid backend port in {backend_url}"
                )))
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), 443)),
    }
}

fn build_tls_config(opts: &SessionOptions) -> Result<ClientConfig> {
    let invalid = |msg: String| Error::StdError(StdError::TlsError(msg));

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut opts.cert_pem.as_bytes())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| invalid(format!("invalid client certificate pem: {e}")))?;
    if certs.is_empty() {
        return Err(invalid("client certificate pem contains no certificates".into()));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut opts.key_pem.as_bytes())
        .map_err(|e| invalid(format!("invalid client key pem: {e}")))?
        .ok_or_else(|| invalid("client key pem contains no key".into()))?;

    let config = if let Some(ca_pem) = &opts.ca_pem {
        let mut roots = RootCertStore::empty();
        for ca in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
            let ca = ca.map_err(|e| invalid(format!("invalid ca pem: {e}")))?;
            roots
                .add(ca)
                .map_err(|e| invalid(format!("unusable ca certificate: {e}")))?;
        }
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
    } else if opts.insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_client_auth_cert(certs, key)
    } else {
        return Err(invalid(
            "either a ca bundle or insecure_skip_verify is required".into(),
        ));
    };
    config.map_err(|e| invalid(format!("failed to build client tls config: {e}")))
}

/// Skips upstream certificate verification. The hosted API server presents a
/// cluster-CA-signed certificate the proxy has no trust anchor for unless
/// the credential Secret carries one.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
