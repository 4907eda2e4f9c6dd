//! Connexion brute vers un équipement : TCP simple ou TLS.
//!
//! Les routeurs exposent l'API TLS avec des certificats auto-signés ; le
//! vérificateur accepte donc tout certificat, comme le fait l'outillage
//! vendeur. La confidentialité du canal reste assurée, pas l'authenticité.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::session::SessionError;

pub trait RawTransport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawTransport for T {}

pub type DeviceTransport = Box<dyn RawTransport>;

/// Ouvre la connexion dans la limite de `connect_timeout`. Dépassement ->
/// `Timeout`, refus/reset -> `Unreachable`.
pub async fn connect(
    host: &str,
    port: u16,
    use_tls: bool,
    connect_timeout: Duration,
) -> Result<DeviceTransport, SessionError> {
    let addr = format!("{host}:{port}");
    let tcp = match timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Err(_) => return Err(SessionError::Timeout(connect_timeout)),
        Ok(Err(e)) => return Err(SessionError::Unreachable(format!("{addr}: {e}"))),
        Ok(Ok(stream)) => stream,
    };
    tcp.set_nodelay(true).ok();

    if !use_tls {
        return Ok(Box::new(tcp));
    }

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| SessionError::Unreachable(format!("invalid host name {host}: {e}")))?;
    let connector = TlsConnector::from(tls_client_config());
    match timeout(connect_timeout, connector.connect(server_name, tcp)).await {
        Err(_) => Err(SessionError::Timeout(connect_timeout)),
        Ok(Err(e)) => Err(SessionError::Unreachable(format!(
            "{addr}: TLS handshake failed: {e}"
        ))),
        Ok(Ok(stream)) => Ok(Box::new(stream)),
    }
}

fn tls_client_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let config = ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .expect("TLS protocol versions")
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
                .with_no_client_auth();
            Arc::new(config)
        })
        .clone()
}

/// Certificats d'équipements auto-signés : tout certificat est accepté.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
