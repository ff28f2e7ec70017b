//! TLS wrapping for the proxy leg
//!
//! The ClientHello carries the configured SNI rather than the proxy's real
//! name. Strict mode checks the proxy certificate against the webpki roots for
//! that name; permissive mode skips the chain check but still verifies the
//! handshake signatures.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    ring as ring_provider, verify_tls12_signature, verify_tls13_signature,
    WebPkiSupportedAlgorithms,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::{debug, warn};

use super::proxy::ProxyError;

/// Accepts any proxy certificate
#[derive(Debug)]
struct AcceptAnyCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyCertificate {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Build the rustls client config for the proxy connection
pub fn build_client_config(allow_insecure: bool) -> Result<Arc<ClientConfig>, ProxyError> {
    let provider = Arc::new(ring_provider::default_provider());
    let algorithms = provider.signature_verification_algorithms;

    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?;

    let config = if allow_insecure {
        warn!("Proxy certificate verification disabled (allowInsecureProxyTls)");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { algorithms }))
            .with_no_client_auth()
    } else {
        let root_store = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    Ok(Arc::new(config))
}

/// Parse the SNI value that goes into the ClientHello
///
/// IP literals are refused: rustls omits the server_name extension for them.
pub fn server_name(sni: &str) -> Result<ServerName<'static>, ProxyError> {
    let name = ServerName::try_from(sni.trim().to_string())
        .map_err(|e| ProxyError::Tls(format!("Invalid SNI '{}': {}", sni, e)))?;
    match name {
        ServerName::DnsName(_) => Ok(name),
        _ => Err(ProxyError::Tls(format!(
            "Invalid SNI '{}': an IP address cannot be sent as a server name",
            sni
        ))),
    }
}

/// Run the TLS handshake over an already connected proxy socket
pub async fn wrap(
    tcp_stream: TcpStream,
    sni: &str,
    allow_insecure: bool,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, ProxyError> {
    let connector = TlsConnector::from(build_client_config(allow_insecure)?);
    let server_name = server_name(sni)?;

    debug!("Starting TLS handshake with proxy (SNI: {})", sni);

    let tls_stream = tokio::time::timeout(timeout, connector.connect(server_name, tcp_stream))
        .await
        .map_err(|_| ProxyError::Timeout("TLS handshake with proxy"))?
        .map_err(|e| ProxyError::Tls(e.to_string()))?;

    debug!("TLS handshake with proxy completed");
    Ok(tls_stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_both_modes() {
        assert!(build_client_config(false).is_ok());
        assert!(build_client_config(true).is_ok());
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("cdn.example.net").is_ok());
        assert!(server_name(" bug.example.com ").is_ok());
        assert!(matches!(server_name("10.0.0.1"), Err(ProxyError::Tls(_))));
        assert!(matches!(server_name("::1"), Err(ProxyError::Tls(_))));
        assert!(matches!(
            server_name("not a hostname"),
            Err(ProxyError::Tls(_))
        ));
    }
}
