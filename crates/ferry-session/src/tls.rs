//! TLS trust gate
//!
//! Server trust is decided before a request leaves. For every HTTPS host a
//! task talks to, the transfer first completes a bare handshake to learn the
//! validated leaf certificate and asks the delegate about it. The HTTP client
//! itself only finishes handshakes whose leaf was approved for that host, so
//! no request bytes reach a server the delegate has not accepted.

use parking_lot::RwLock;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::SessionError;
use crate::Result;

/// Leaf certificates approved per host.
#[derive(Debug, Clone, Default)]
pub(crate) struct TrustApprovals {
    approved: Arc<RwLock<HashMap<String, HashSet<Vec<u8>>>>>,
}

impl TrustApprovals {
    pub(crate) fn approve(&self, host: &str, leaf_certificate: &[u8]) {
        self.approved
            .write()
            .entry(normalize_host(host))
            .or_default()
            .insert(leaf_certificate.to_vec());
    }

    pub(crate) fn is_approved(&self, host: &str, leaf_certificate: &[u8]) -> bool {
        self.approved
            .read()
            .get(&normalize_host(host))
            .is_some_and(|leaves| leaves.contains(leaf_certificate))
    }
}

/// URL hosts carry brackets around IPv6 literals; server names do not.
pub(crate) fn normalize_host(host: &str) -> String {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .to_lowercase()
}

/// Chain validation plus the approval check.
#[derive(Debug)]
struct GatedVerifier {
    inner: Arc<WebPkiServerVerifier>,
    approvals: TrustApprovals,
}

impl ServerCertVerifier for GatedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let verified = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        )?;

        let host = server_name.to_str();
        if !self.approvals.is_approved(&host, end_entity.as_ref()) {
            return Err(rustls::Error::General(format!(
                "server trust for {} was not approved",
                host
            )));
        }
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// TLS setup of one session: the gated config for the HTTP client and the
/// plain one used to learn a host's leaf certificate.
#[derive(Clone)]
pub(crate) struct SessionTls {
    approvals: TrustApprovals,
    gated: ClientConfig,
    inspect: Arc<ClientConfig>,
}

impl SessionTls {
    /// Web PKI roots plus any DER roots the configuration adds.
    pub(crate) fn new(additional_roots: &[Vec<u8>]) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        for der in additional_roots {
            roots.add(CertificateDer::from(der.clone()))?;
        }

        let verifier =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                .build()
                .map_err(|e| SessionError::Tls(e.to_string()))?;

        let approvals = TrustApprovals::default();

        let gated = builder(&provider)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(GatedVerifier {
                inner: Arc::clone(&verifier),
                approvals: approvals.clone(),
            }))
            .with_no_client_auth();

        let inspect = builder(&provider)?
            .with_webpki_verifier(verifier)
            .with_no_client_auth();

        Ok(Self {
            approvals,
            gated,
            inspect: Arc::new(inspect),
        })
    }

    pub(crate) fn approvals(&self) -> &TrustApprovals {
        &self.approvals
    }

    pub(crate) fn client_config(&self) -> ClientConfig {
        self.gated.clone()
    }

    /// Handshake with `host` and return its validated leaf certificate. No
    /// application data is written on the connection.
    pub(crate) async fn peer_leaf_certificate(
        &self,
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> std::io::Result<Option<Vec<u8>>> {
        let host = normalize_host(host);
        let name = ServerName::try_from(host.clone())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;

        let stream = TlsConnector::from(Arc::clone(&self.inspect))
            .connect(name, tcp)
            .await?;

        let (_, connection) = stream.get_ref();
        Ok(connection
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|leaf| leaf.as_ref().to_vec()))
    }
}

fn builder(
    provider: &Arc<CryptoProvider>,
) -> Result<rustls::ConfigBuilder<ClientConfig, rustls::WantsVerifier>> {
    Ok(ClientConfig::builder_with_provider(Arc::clone(provider))
        .with_safe_default_protocol_versions()?)
}
