//! Inbound TLS acceptor, the TLS half of C6. Grounded on the teacher's own
//! `TlsHyperAcceptor` (same file, same responsibility: wrap a `TcpListener`
//! plus a `TlsAcceptor` behind one `accept`-style entry point), ported to
//! the current `tokio-rustls`/`rustls` API and generalized to negotiate both
//! `h2` and `http/1.1` via ALPN instead of forcing HTTP/1.1 only — the
//! teacher's original comment here read "If we want to add http2 in the
//! future, we can add `b"h2".to_vec()` to the list"; this is that addition.

use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

pub struct TlsServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsServer {
    pub async fn bind(addr: std::net::SocketAddr, cert_pem: &str, key_pem: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let certs = load_certs(cert_pem)?;
        let key = load_private_key(key_pem)?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(TlsServer {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Accept the next raw connection and drive its TLS handshake to
    /// completion, returning the peer address alongside the stream so the
    /// caller can thread it through the same four-phase pipeline a
    /// plaintext connection uses.
    pub async fn accept(&self) -> io::Result<(TlsStream<TcpStream>, std::net::SocketAddr)> {
        let (socket, peer_addr) = self.listener.accept().await?;
        let stream = self.acceptor.accept(socket).await?;
        Ok((stream, peer_addr))
    }
}

/// Whether `stream`'s negotiated ALPN protocol was `h2`; `server.rs` uses
/// this after a TLS handshake completes to choose the HTTP/1.1 vs HTTP/2
/// connection builder.
pub fn negotiated_h2(stream: &TlsStream<TcpStream>) -> bool {
    let (_, session) = stream.get_ref();
    session.alpn_protocol() == Some(b"h2")
}

fn load_certs(pem: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid certificate PEM: {}", e)))
}

fn load_private_key(pem: &str) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid private key PEM: {}", e)))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no private key found in PEM"))
}

/// Read PEM material from disk the way the teacher's `parse_tls_config` did:
/// plain path checks, propagated with `anyhow` rather than asserted.
pub async fn read_pem_pair(cert_path: &Path, key_path: &Path) -> anyhow::Result<(String, String)> {
    let cert = tokio::fs::read_to_string(cert_path).await?;
    let key = tokio::fs::read_to_string(key_path).await?;
    Ok((cert, key))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn load_certs_rejects_non_pem_content() {
        let result = load_certs("not a certificate").unwrap();
        assert!(result.is_empty());
    }

    #[test]
    pub fn load_private_key_rejects_empty_input() {
        let result = load_private_key("");
        assert!(result.is_err());
    }
}
