//! Pool transport: endpoint resolution, plain or TLS streams, line framing.
//!
//! Stratum is newline-delimited JSON over TCP, optionally wrapped in TLS.
//! Both stream flavors hide behind [`PoolStream`] so the session logic reads
//! and writes one interface. Framing is handled by a [`LinesCodec`], which
//! appends the delimiter on write and strips it on read.

use crate::config::{PoolEndpoint, SecureLevel};
use crate::error::{PoolClientError, Result};
use crate::protocol::RpcMessage;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, trace, warn};

#[cfg(not(windows))]
const DEFAULT_CA_BUNDLE: &str = "/etc/ssl/certs/ca-certificates.crt";

/// Resolve a host to its endpoints, in resolver order.
///
/// Load balancers rotate the order between lookups, which is exactly the
/// spread we want across connect attempts, so the result is never sorted.
pub async fn resolve_endpoints(host: &str, port: u16) -> Result<VecDeque<SocketAddr>> {
    let endpoints = lookup_host((host, port))
        .await
        .map_err(|source| PoolClientError::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect::<VecDeque<_>>();
    debug!(host, count = endpoints.len(), "resolved pool endpoints");
    Ok(endpoints)
}

/// A pool-facing byte stream, plain or TLS
pub enum PoolStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for PoolStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PoolStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            PoolStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PoolStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PoolStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            PoolStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PoolStream::Plain(s) => Pin::new(s).poll_flush(cx),
            PoolStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PoolStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            PoolStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Line-framed JSON-RPC connection to one pool endpoint
pub struct PoolConnection {
    framed: Framed<PoolStream, LinesCodec>,
}

impl PoolConnection {
    /// Connect to one endpoint, applying socket options and, when requested,
    /// running the TLS handshake with the endpoint's hostname.
    pub async fn open(addr: SocketAddr, endpoint: &PoolEndpoint) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| PoolClientError::Connection(e.to_string()))?;

        // Keepalive detects dead pools between jobs; nodelay keeps share
        // submission latency down.
        socket2::SockRef::from(&stream)
            .set_keepalive(true)
            .map_err(|e| PoolClientError::Connection(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| PoolClientError::Connection(e.to_string()))?;

        let stream = match endpoint.secure_level {
            SecureLevel::None => PoolStream::Plain(stream),
            level => {
                let connector = tls_connector(level)?;
                let server_name = ServerName::try_from(endpoint.host.clone())
                    .map_err(|e| PoolClientError::Tls(format!("invalid server name: {e}")))?;
                let tls = connector.connect(server_name, stream).await.map_err(|e| {
                    let reason = e.to_string();
                    if reason.contains("certificate") {
                        warn_certificate_failure();
                    }
                    PoolClientError::Tls(format!("SSL/TLS handshake failed: {reason}"))
                })?;
                PoolStream::Tls(Box::new(tls))
            }
        };

        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new()),
        })
    }

    /// Read one message; `None` on clean close by the pool
    pub async fn read_message(&mut self) -> Result<Option<RpcMessage>> {
        loop {
            match self.framed.next().await {
                Some(Ok(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    trace!(rx = %line, "received");
                    let msg = serde_json::from_str(line).map_err(|e| {
                        PoolClientError::InvalidMessage(format!("{e}, line: {line}"))
                    })?;
                    return Ok(Some(msg));
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
                Some(Err(e)) => {
                    return Err(PoolClientError::InvalidMessage(e.to_string()));
                }
                None => return Ok(None),
            }
        }
    }

    /// Write one frame; the codec appends the newline delimiter
    pub async fn write_message(&mut self, frame: &Value) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        trace!(tx = %text, "sending");
        match self.framed.send(text).await {
            Ok(()) => Ok(()),
            Err(LinesCodecError::Io(e)) => Err(e.into()),
            Err(e) => Err(PoolClientError::Connection(e.to_string())),
        }
    }

    /// Initiate the close handshake (close_notify over TLS, FIN otherwise)
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.framed.get_mut().shutdown().await
    }
}

/// Build a TLS connector for the requested security level.
///
/// Peer verification is always on; the trust roots come from the platform
/// (see [`load_root_certs`]). A missing bundle is survivable here but will
/// surface as a handshake failure later.
fn tls_connector(level: SecureLevel) -> Result<TlsConnector> {
    let roots = load_root_certs();
    let builder = match level {
        SecureLevel::Tls12 => {
            ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
        }
        _ => ClientConfig::builder(),
    };
    let config = builder
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Load CA roots from the PEM bundle named by `SSL_CERT_FILE`, falling back
/// to the distribution bundle. Failure to load is a warning, not an error:
/// the session may still work against pools whose chain we can build.
#[cfg(not(windows))]
fn load_root_certs() -> RootCertStore {
    use std::fs::File;
    use std::io::BufReader;
    use std::path::PathBuf;

    let path = std::env::var_os("SSL_CERT_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CA_BUNDLE));

    let mut roots = RootCertStore::empty();
    match File::open(&path) {
        Ok(file) => {
            let mut reader = BufReader::new(file);
            for cert in rustls_pemfile::certs(&mut reader).flatten() {
                let _ = roots.add(cert);
            }
        }
        Err(_) => {
            warn!(
                "Failed to load ca certificates. Either the file '{}' does not exist",
                path.display()
            );
            warn!("or the environment variable SSL_CERT_FILE is set to an invalid or inaccessible file.");
            warn!("It is possible that certificate verification can fail.");
        }
    }
    roots
}

/// Load CA roots from the system ROOT store
#[cfg(windows)]
fn load_root_certs() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                let _ = roots.add(cert);
            }
        }
        Err(e) => {
            warn!("Failed to load system ROOT certificate store: {e}");
            warn!("It is possible that certificate verification can fail.");
        }
    }
    roots
}

fn warn_certificate_failure() {
    warn!("Certificate verification failed. This can have multiple reasons:");
    warn!("* Root certs are either not installed or not found");
    warn!("* Pool uses a self-signed certificate");
    warn!("Possible fixes:");
    #[cfg(not(windows))]
    {
        warn!(
            "* Make sure the file '{}' exists and is accessible",
            DEFAULT_CA_BUNDLE
        );
        warn!("* Export the correct path via 'export SSL_CERT_FILE=<path>' to the correct file");
        warn!("  On most systems you can install the 'ca-certificates' package");
    }
    warn!("* You can also get the latest bundle here: https://curl.haxx.se/docs/caextract.html");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_resolve_loopback() {
        let endpoints = resolve_endpoints("localhost", 3333).await.unwrap();
        assert!(!endpoints.is_empty());
        assert!(endpoints.iter().all(|e| e.port() == 3333));
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Echo one line back, newline-delimited
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                write_half.write_all(line.as_bytes()).await.unwrap();
                write_half.write_all(b"\n").await.unwrap();
            }
        });

        let endpoint = PoolEndpoint {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            user: String::new(),
            pass: String::new(),
            path: String::new(),
            secure_level: SecureLevel::None,
            dialect: Default::default(),
        };
        let mut conn = PoolConnection::open(addr, &endpoint).await.unwrap();

        let frame = json!({"id": 1, "method": "mining.subscribe", "params": []});
        conn.write_message(&frame).await.unwrap();

        let msg = conn.read_message().await.unwrap().unwrap();
        assert_eq!(msg.id_value(), 1);
        assert_eq!(msg.method_text(), "mining.subscribe");
    }

    #[tokio::test]
    async fn test_invalid_json_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"this is not json\n").await.unwrap();
        });

        let endpoint = PoolEndpoint {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            user: String::new(),
            pass: String::new(),
            path: String::new(),
            secure_level: SecureLevel::None,
            dialect: Default::default(),
        };
        let mut conn = PoolConnection::open(addr, &endpoint).await.unwrap();

        match conn.read_message().await {
            Err(PoolClientError::InvalidMessage(_)) => {}
            other => panic!("expected InvalidMessage, got {other:?}"),
        }
    }
}
