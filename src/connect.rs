//! The dialer: TCP establishment, optional HTTP CONNECT tunneling, and TLS
//! with ALPN. The negotiated protocol decides whether the connection is
//! handed to the HTTP/1.1 codec or becomes a multiplexed h2 connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::dns::Resolver;
use crate::error::{Error, TimedOut};
use crate::proto::h2;
use crate::proxy::Proxy;

/// Object-safe transport stream.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub(crate) type BoxIo = Box<dyn Io>;

/// A checked-out HTTP/1.1 connection. The read side is buffered; writes
/// pass through.
pub(crate) struct H1Conn {
    pub(crate) io: BufReader<BoxIo>,
}

impl std::fmt::Debug for H1Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H1Conn").finish()
    }
}

impl H1Conn {
    fn new(io: BoxIo) -> H1Conn {
        H1Conn {
            io: BufReader::new(io),
        }
    }
}

/// What a dial produced, decided by ALPN.
pub(crate) enum Dialed {
    H1(H1Conn),
    H2(h2::Connection),
}

pub(crate) struct Connector {
    resolver: Resolver,
    /// Destination TLS: offers `h2` and `http/1.1`.
    tls: TlsConnector,
    /// Proxy TLS: no ALPN, the proxy link always speaks HTTP/1.1.
    proxy_tls: TlsConnector,
    proxy: Option<Proxy>,
    connect_timeout: Option<Duration>,
    nodelay: bool,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("proxy", &self.proxy.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Connector {
    pub(crate) fn new(
        resolver: Resolver,
        proxy: Option<Proxy>,
        connect_timeout: Option<Duration>,
        nodelay: bool,
    ) -> Connector {
        let roots = default_root_store();

        let mut tls_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots.clone())
            .with_no_client_auth();
        tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let proxy_tls_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Connector {
            resolver,
            tls: TlsConnector::from(Arc::new(tls_config)),
            proxy_tls: TlsConnector::from(Arc::new(proxy_tls_config)),
            proxy,
            connect_timeout,
            nodelay,
        }
    }

    /// Dials `host:port`, tunneling through the configured proxy if any,
    /// and performs destination TLS for https. For a negotiated "h2" the
    /// h2 connection handshake runs before returning.
    pub(crate) async fn connect(&self, scheme: &str, host: &str, port: u16) -> crate::Result<Dialed> {
        let io: BoxIo = match &self.proxy {
            Some(proxy) => self.tunnel_through(proxy, host, port).await?,
            None => {
                let addrs = self.resolver.resolve(host, port).await?;
                Box::new(self.tcp_connect(&addrs).await?)
            }
        };

        if scheme != "https" {
            return Ok(Dialed::H1(H1Conn::new(io)));
        }

        let server_name = rustls::ServerName::try_from(host)
            .map_err(|_| Error::tls(format!("invalid TLS server name: {host}")))?;
        let tls = self
            .tls
            .connect(server_name, io)
            .await
            .map_err(Error::tls)?;

        let negotiated = tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
        trace!(
            "ALPN negotiated {:?} with {host}",
            negotiated.as_deref().map(String::from_utf8_lossy)
        );
        match negotiated.as_deref() {
            Some(b"h2") => {
                let conn = h2::Connection::handshake(tls)
                    .await
                    .map_err(Error::connect)?;
                Ok(Dialed::H2(conn))
            }
            _ => Ok(Dialed::H1(H1Conn::new(Box::new(tls)))),
        }
    }

    async fn tcp_connect(&self, addrs: &[SocketAddr]) -> crate::Result<TcpStream> {
        let mut last_err = None;
        for addr in addrs {
            let attempt = TcpStream::connect(addr);
            let res = match self.connect_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, attempt).await {
                    Ok(res) => res,
                    Err(_) => {
                        last_err = Some(Error::connect(TimedOut));
                        continue;
                    }
                },
                None => attempt.await,
            };
            match res {
                Ok(stream) => {
                    if self.nodelay {
                        let _ = stream.set_nodelay(true);
                    }
                    return Ok(stream);
                }
                Err(err) => {
                    debug!("connect to {addr} failed: {err}");
                    last_err = Some(Error::connect(err));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::connect("no addresses to dial")))
    }

    /// Opens the proxy link and issues `CONNECT host:port`, returning the
    /// raw tunnel for the destination handshake to run over.
    async fn tunnel_through(
        &self,
        proxy: &Proxy,
        host: &str,
        port: u16,
    ) -> crate::Result<BoxIo> {
        let addrs = self.resolver.resolve(proxy.host(), proxy.port()).await?;
        let tcp = self.tcp_connect(&addrs).await?;

        let mut link: BoxIo = if proxy.uses_tls() {
            let server_name = rustls::ServerName::try_from(proxy.host())
                .map_err(|_| Error::tls(format!("invalid proxy server name: {}", proxy.host())))?;
            Box::new(
                self.proxy_tls
                    .connect(server_name, tcp)
                    .await
                    .map_err(Error::tls)?,
            )
        } else {
            Box::new(tcp)
        };

        let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
        if let Some(auth) = proxy.basic_auth() {
            request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
        }
        request.push_str("\r\n");
        link.write_all(request.as_bytes())
            .await
            .map_err(Error::connect)?;
        link.flush().await.map_err(Error::connect)?;

        read_tunnel_response(&mut link).await?;
        debug!("CONNECT tunnel to {host}:{port} established via {}", proxy.host());
        Ok(link)
    }
}

/// Reads the proxy's CONNECT response up to the blank line and requires a
/// 2xx. Byte-at-a-time so no tunnel bytes are over-read.
async fn read_tunnel_response(link: &mut BoxIo) -> crate::Result<()> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 16 * 1024 {
            return Err(Error::connect("proxy CONNECT response too large"));
        }
        let n = link.read(&mut byte).await.map_err(Error::connect)?;
        if n == 0 {
            return Err(Error::connect(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed during CONNECT",
            )));
        }
        head.push(byte[0]);
    }

    let line = head
        .split(|b| *b == b'\n')
        .next()
        .unwrap_or_default();
    let line = String::from_utf8_lossy(line);
    let mut parts = line.split_whitespace();
    let _version = parts.next();
    let status = parts.next().unwrap_or_default();
    if status.len() == 3 && status.starts_with('2') {
        Ok(())
    } else {
        Err(Error::connect(format!(
            "proxy CONNECT refused: {}",
            line.trim_end()
        )))
    }
}

fn default_root_store() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            anchor.subject,
            anchor.spki,
            anchor.name_constraints,
        )
    }));
    roots
}

/// Default port for a URL scheme.
pub(crate) fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" => 443,
        _ => 80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_ports() {
        assert_eq!(default_port("http"), 80);
        assert_eq!(default_port("https"), 443);
    }

    #[tokio::test]
    async fn tunnel_response_requires_2xx() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut link: BoxIo = Box::new(server);

        client
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();
        read_tunnel_response(&mut link).await.unwrap();

        client
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();
        let err = read_tunnel_response(&mut link).await.unwrap_err();
        assert!(err.is_connect());
        assert!(err.to_string().contains("407"));
    }
}
