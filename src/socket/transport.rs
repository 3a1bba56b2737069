use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::socket::client::{Connection, SocketType};
use crate::socket::connector::ProtocolChain;
use crate::socket::endpoint::HostPortPair;
use crate::socket::proxy::{ProxySettings, ProxyType};
use crate::socket::tls::TlsConfig;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use url::Url;

/// Everything a transport needs for one connect attempt.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    /// Address to open the socket to (the proxy when one is set).
    pub remote: HostPortPair,
    pub local: Option<SocketAddr>,
    /// Final destination of the request.
    pub url: Url,
    pub proxy: Option<ProxySettings>,
    pub chain: ProtocolChain,
}

impl ConnectTarget {
    /// Secure targets tunnel through HTTP proxies with CONNECT.
    fn needs_tunnel(&self) -> bool {
        self.proxy.is_some() && self.chain.is_secure()
    }
}

/// Opens transport-level connections.
pub trait Transport: Send + Sync {
    fn open(&self, target: ConnectTarget) -> BoxFuture<'static, Result<Connection, NetError>>;
}

/// DNS -> TCP -> (CONNECT tunnel) -> TLS, on tokio sockets and BoringSSL.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

const MAX_TUNNEL_RESPONSE: usize = 8 * 1024;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }

    async fn connect_tcp(
        remote: &HostPortPair,
        local: Option<SocketAddr>,
    ) -> Result<TcpStream, NetError> {
        let addrs = tokio::net::lookup_host((remote.bare_host(), remote.port()))
            .await
            .dns_context(remote.host())?;

        let mut last_err = None;
        for addr in addrs {
            let attempt = match local {
                Some(local) if local.is_ipv4() != addr.is_ipv4() => continue,
                Some(local) => Self::connect_bound(addr, local).await,
                None => TcpStream::connect(addr).await,
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "tcp connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err::<TcpStream, _>(e).connection_context(remote.host(), remote.port()),
            None => Err(NetError::AddressInvalid),
        }
    }

    async fn connect_bound(addr: SocketAddr, local: SocketAddr) -> std::io::Result<TcpStream> {
        let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.bind(local)?;
        socket.connect(addr).await
    }

    async fn tunnel(
        stream: &mut TcpStream,
        url: &Url,
        proxy: &ProxySettings,
    ) -> Result<(), NetError> {
        if proxy.proxy_type() != ProxyType::Http {
            tracing::warn!(proxy = %proxy.url, "unsupported proxy type for tunnelling");
            return Err(NetError::ProxyConnectionFailed);
        }

        let host = url.host_str().ok_or(NetError::InvalidUrl)?;
        let port = url.port_or_known_default().ok_or(NetError::InvalidUrl)?;
        let target = format!("{}:{}", host, port);

        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
        if let Some(auth) = proxy.get_auth_header() {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await.map_err(|_| NetError::TunnelConnectionFailed)?;

        let mut response = Vec::with_capacity(256);
        let mut buf = [0u8; 512];
        while !response.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.map_err(|_| NetError::TunnelConnectionFailed)?;
            if n == 0 || response.len() + n > MAX_TUNNEL_RESPONSE {
                return Err(NetError::TunnelConnectionFailed);
            }
            response.extend_from_slice(&buf[..n]);
        }

        let status = String::from_utf8_lossy(&response);
        if !status.starts_with("HTTP/1.1 200") && !status.starts_with("HTTP/1.0 200") {
            tracing::debug!(tunnel = %target, status = %status.lines().next().unwrap_or(""), "proxy refused tunnel");
            return Err(NetError::TunnelConnectionFailed);
        }
        Ok(())
    }

    async fn handshake(
        stream: TcpStream,
        url: &Url,
        tls: &TlsConfig,
    ) -> Result<SocketType, NetError> {
        let host = url.host_str().ok_or(NetError::InvalidUrl)?;
        let bare = host.trim_start_matches('[').trim_end_matches(']');

        let mut config = tls.connector()?.configure().map_err(|_| NetError::SslProtocolError)?;
        let sni = TlsConfig::should_set_sni(bare);
        config.set_use_server_name_indication(sni);
        config.set_verify_hostname(sni && tls.verify_peer);

        let ssl = tokio_boring::connect(config, bare, stream).await.map_err(|e| {
            tracing::debug!(host = %host, error = ?e, "TLS handshake failed");
            NetError::SslProtocolError
        })?;
        Ok(SocketType::Ssl(ssl))
    }

    async fn establish(target: ConnectTarget) -> Result<Connection, NetError> {
        let mut stream = Self::connect_tcp(&target.remote, target.local).await?;
        if let Err(e) = stream.set_nodelay(target.chain.nodelay) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }

        if let (true, Some(proxy)) = (target.needs_tunnel(), target.proxy.as_ref()) {
            Self::tunnel(&mut stream, &target.url, proxy).await?;
        }

        let socket = match &target.chain.tls {
            Some(tls) => Self::handshake(stream, &target.url, tls).await?,
            None => SocketType::Tcp(stream),
        };

        tracing::debug!(remote = %target.remote, secure = target.chain.is_secure(), "connection established");
        Ok(Connection::new(target.remote, socket))
    }
}

impl Transport for TcpTransport {
    fn open(&self, target: ConnectTarget) -> BoxFuture<'static, Result<Connection, NetError>> {
        Box::pin(Self::establish(target))
    }
}
