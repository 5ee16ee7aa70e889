//! rustls client configuration shared by the control and data channels
//!
//! One [`TlsContext`] is built per session. Its `ClientConfig` carries an
//! in-memory resumption store, so data-channel handshakes offer the session
//! negotiated on the control channel. Servers that require session reuse on
//! the data connection (vsftpd `require_ssl_reuse`, FileZilla) accept them.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::client::{Resumption, Tls12Resumption};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use secrecy::ExposeSecret;
use zeroize::Zeroizing;

use crate::config::SecureOptions;
use crate::error::{is_timeout, FtpError, FtpResult};
use crate::logging::log_with_session;

/// Number of TLS sessions kept for resumption per session context
const RESUMPTION_CACHE_SIZE: usize = 32;

// Module for insecure certificate verification (for self-signed certs)
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;

    /// Certificate verifier that accepts any certificate
    ///
    /// WARNING: only for servers with trusted self-signed certificates.
    /// Selected by `reject_unauthorized = false`.
    #[derive(Debug)]
    pub struct NoCertificateVerification;

    impl ServerCertVerifier for NoCertificateVerification {
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

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

/// TLS parameters for one session: config plus the name to verify
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsContext {
    /// Builds the context for `host` from the resolved secure options
    pub fn new(host: &str, options: &SecureOptions, session_tag: &str) -> FtpResult<Self> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| FtpError::Config(format!("invalid TLS server name {:?}: {}", host, e)))?;
        let config = build_client_config(options, session_tag)?;
        Ok(TlsContext {
            config: Arc::new(config),
            server_name,
        })
    }

    /// Runs a client handshake over `tcp`, bounded by `timeout`
    ///
    /// Used for the control channel and for every data channel; all of them
    /// share the resumption store of this context.
    pub fn handshake(
        &self,
        mut tcp: TcpStream,
        timeout: Duration,
    ) -> FtpResult<StreamOwned<ClientConnection, TcpStream>> {
        let mut conn = ClientConnection::new(Arc::clone(&self.config), self.server_name.clone())
            .map_err(|e| FtpError::Connection(format!("TLS setup failed: {}", e)))?;

        tcp.set_read_timeout(Some(timeout))
            .and_then(|_| tcp.set_write_timeout(Some(timeout)))
            .map_err(|e| FtpError::Connection(format!("TLS setup failed: {}", e)))?;

        let deadline = Instant::now() + timeout;
        while conn.is_handshaking() {
            if Instant::now() >= deadline {
                return Err(FtpError::Connection("TLS handshake timed out".to_string()));
            }
            match conn.complete_io(&mut tcp) {
                Ok(_) => {}
                Err(e) if is_timeout(&e) => {
                    return Err(FtpError::Connection("TLS handshake timed out".to_string()))
                }
                Err(e) => {
                    return Err(FtpError::Connection(format!("TLS handshake failed: {}", e)))
                }
            }
        }

        Ok(StreamOwned::new(conn, tcp))
    }
}

/// Builds the rustls client configuration
///
/// Server verification uses the platform roots unless
/// `reject_unauthorized` is false. A client certificate is presented only
/// when both the certificate and the key are available.
pub fn build_client_config(options: &SecureOptions, session_tag: &str) -> FtpResult<ClientConfig> {
    let provider = rustls::crypto::ring::default_provider();
    let builder = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| FtpError::Config(format!("TLS configuration: {}", e)))?;

    let builder = if options.reject_unauthorized {
        let mut root_store = rustls::RootCertStore::empty();
        let certs_result = rustls_native_certs::load_native_certs();
        for cert in certs_result.certs {
            root_store.add(cert).ok();
        }
        if !certs_result.errors.is_empty() {
            let _ = log_with_session(
                session_tag,
                format!(
                    "Warning: failed to load some native certificates: {:?}",
                    certs_result.errors
                ),
            );
        }
        builder.with_root_certificates(root_store)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification))
    };

    let mut config = match (&options.cert, &options.key) {
        (Some(cert_pem), Some(key)) => {
            let certs = parse_certificates(cert_pem)?;
            let key_pem = Zeroizing::new(key.expose_secret().as_bytes().to_vec());
            let key = PrivateKeyDer::from_pem_slice(&key_pem)
                .map_err(|e| FtpError::Config(format!("invalid client private key: {}", e)))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| FtpError::Config(format!("client certificate rejected: {}", e)))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            let _ = log_with_session(
                session_tag,
                "Warning: client certificate and private key must be given together; \
                 continuing without client authentication",
            );
            builder.with_no_client_auth()
        }
    };

    config.resumption = Resumption::in_memory_sessions(RESUMPTION_CACHE_SIZE)
        .tls12_resumption(Tls12Resumption::SessionIdOrTickets);

    Ok(config)
}

fn parse_certificates(pem: &str) -> FtpResult<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| FtpError::Config(format!("invalid client certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(FtpError::Config(
            "invalid client certificate: no PEM certificate found".to_string(),
        ));
    }
    Ok(certs)
}
