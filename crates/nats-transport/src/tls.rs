//! TLS upgrade
//!
//! The server may ask for TLS in its greeting, after the TCP connection is
//! already open, so TLS is layered over an established [`TcpStream`] rather
//! than dialled directly.
//!
//! A rustls session cannot be split into read and write halves. Every
//! handle of a [`TlsStream`] shares one session behind a mutex, and the
//! underlying socket uses a short read timeout so that a blocked reader
//! releases the lock often enough for writers to get through.

use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{is_timeout_kind, Result, TransportError};
use crate::traits::Stream;

/// How long a reader holds the session before letting writers in
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Certificate verification and client authentication settings
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// PEM file with the CAs trusted to sign the server certificate.
    /// System roots are used when unset.
    pub ca_file: Option<PathBuf>,
    /// PEM certificate chain presented to the server
    pub cert_file: Option<PathBuf>,
    /// PEM private key matching `cert_file`
    pub key_file: Option<PathBuf>,
    /// Name checked against the server certificate instead of the URL host
    pub expected_hostname: Option<String>,
    /// Accept any server certificate (testing only)
    pub skip_verify: bool,
}

/// Ready-to-use TLS client configuration
#[derive(Clone)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
    expected_hostname: Option<String>,
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("expected_hostname", &self.expected_hostname)
            .finish_non_exhaustive()
    }
}

impl TlsConnector {
    /// Build the rustls configuration described by `options`
    pub fn new(options: &TlsOptions) -> Result<Self> {
        let builder = if options.skip_verify {
            warn!("TLS certificate verification disabled");
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        } else {
            let roots = match &options.ca_file {
                Some(path) => load_ca_file(path)?,
                None => load_system_roots()?,
            };
            ClientConfig::builder().with_root_certificates(roots)
        };

        let config = match (&options.cert_file, &options.key_file) {
            (Some(cert), Some(key)) => {
                let chain = load_certs(cert)?;
                let key = load_key(key)?;
                builder.with_client_auth_cert(chain, key)?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(TransportError::Tls(
                    "client certificate and key must be configured together".to_string(),
                ))
            }
        };

        Ok(Self {
            config: Arc::new(config),
            expected_hostname: options.expected_hostname.clone(),
        })
    }

    /// Wrap an existing rustls configuration
    pub fn from_config(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            expected_hostname: None,
        }
    }

    /// Run the TLS handshake over `sock`
    pub fn connect(&self, sock: TcpStream, host: &str, timeout: Duration) -> Result<TlsStream> {
        let name = self.expected_hostname.as_deref().unwrap_or(host).to_string();
        let server_name = ServerName::try_from(name.clone())
            .map_err(|e| TransportError::Tls(format!("invalid server name '{}': {}", name, e)))?;

        let mut conn = ClientConnection::new(self.config.clone(), server_name)?;
        let mut sock = sock;

        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        sock.set_read_timeout(deadline.map(|_| timeout))?;
        sock.set_write_timeout(deadline.map(|_| timeout))?;

        while conn.is_handshaking() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(TransportError::Timeout);
            }
            match conn.complete_io(&mut sock) {
                Ok(_) => {}
                Err(e) if is_timeout_kind(e.kind()) => return Err(TransportError::Timeout),
                Err(e) => return Err(TransportError::Tls(e.to_string())),
            }
        }
        debug!(
            "TLS handshake with {} complete ({:?})",
            name,
            conn.negotiated_cipher_suite().map(|s| s.suite())
        );

        sock.set_write_timeout(None)?;
        sock.set_read_timeout(Some(POLL_INTERVAL))?;
        let raw = sock.try_clone()?;

        Ok(TlsStream {
            session: Arc::new(Mutex::new(StreamOwned::new(conn, sock))),
            raw,
            read_timeout: Arc::new(Mutex::new(None)),
            nonblocking: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// A TLS session over TCP, cloneable into several handles
pub struct TlsStream {
    session: Arc<Mutex<StreamOwned<ClientConnection, TcpStream>>>,
    /// Second handle on the socket for shutdown and socket options
    raw: TcpStream,
    read_timeout: Arc<Mutex<Option<Duration>>>,
    nonblocking: Arc<AtomicBool>,
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let deadline = self.read_timeout.lock().map(|t| Instant::now() + t);
        loop {
            let result = self.session.lock().read(buf);
            match result {
                Err(e) if is_timeout_kind(e.kind()) => {
                    if self.nonblocking.load(Ordering::Acquire) {
                        return Err(e);
                    }
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(std::io::ErrorKind::TimedOut.into());
                    }
                }
                other => return other,
            }
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.session.lock().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        // One lock for the whole frame so that records are not interleaved.
        let mut session = self.session.lock();
        session.write_all(buf)?;
        session.flush()
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.session.lock().flush()
    }
}

impl Stream for TlsStream {
    fn try_clone(&self) -> Result<Box<dyn Stream>> {
        Ok(Box::new(TlsStream {
            session: self.session.clone(),
            raw: self.raw.try_clone()?,
            read_timeout: self.read_timeout.clone(),
            nonblocking: self.nonblocking.clone(),
        }))
    }

    fn shutdown(&self) -> Result<()> {
        if let Some(mut guard) = self.session.try_lock() {
            let session = &mut *guard;
            session.conn.send_close_notify();
            let _ = session.conn.complete_io(&mut session.sock);
        }
        match self.raw.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        *self.read_timeout.lock() = timeout;
        Ok(())
    }

    fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.nonblocking.store(nonblocking, Ordering::Release);
        self.raw.set_nonblocking(nonblocking)?;
        Ok(())
    }

    fn is_secure(&self) -> bool {
        true
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.raw.peer_addr().ok()
    }
}

fn load_system_roots() -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    let cert_result = rustls_native_certs::load_native_certs();

    for err in &cert_result.errors {
        debug!("Certificate loading error: {}", err);
    }
    for cert in cert_result.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Failed to add system cert: {}", e);
        }
    }

    info!("Loaded {} system root certificates", root_store.len());
    if root_store.is_empty() {
        return Err(TransportError::Tls(
            "No root certificates available".to_string(),
        ));
    }
    Ok(root_store)
}

fn load_ca_file(path: &Path) -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs(path)? {
        if let Err(e) = root_store.add(cert) {
            warn!("Failed to add CA cert from {}: {}", path.display(), e);
        }
    }
    if root_store.is_empty() {
        return Err(TransportError::Tls(format!(
            "no valid CA certificates in {}",
            path.display()
        )));
    }
    Ok(root_store)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| TransportError::Tls(format!("no private key in {}", path.display())))
}

/// Certificate verifier that accepts anything
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
