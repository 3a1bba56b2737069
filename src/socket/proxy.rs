use base64::{engine::general_purpose, Engine as _};
use url::Url;
use zeroize::Zeroizing;

/// Proxy protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    /// HTTP proxy (CONNECT tunnel)
    Http,
    /// HTTPS proxy (TLS to proxy)
    Https,
    /// SOCKS5 proxy
    Socks5,
}

/// A resolved proxy for one request.
///
/// Choosing the proxy (PAC, NO_PROXY, rotation) happens before a request
/// reaches the connection manager.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Proxy URL (e.g., `http://proxy.com:8080`)
    pub url: Url,
    /// Proxy username for authentication
    pub username: Option<String>,
    /// Proxy password (zeroized on drop)
    pub password: Option<Zeroizing<String>>,
    /// Port as written; `Url` drops one equal to the scheme default.
    port: Option<u16>,
}

impl ProxySettings {
    /// Create proxy settings from URL string.
    pub fn new(url_str: &str) -> Option<Self> {
        let url = Url::parse(url_str).ok()?;
        url.host_str()?;
        let port = url.port().or_else(|| written_port(url_str));
        Some(Self { url, username: None, password: None, port })
    }

    /// The explicit port, if the proxy URL carried one.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Add authentication credentials.
    pub fn with_auth(mut self, user: &str, pass: &str) -> Self {
        self.username = Some(user.to_string());
        self.password = Some(Zeroizing::new(pass.to_string()));
        self
    }

    /// Get proxy type from URL scheme.
    pub fn proxy_type(&self) -> ProxyType {
        match self.url.scheme() {
            "https" => ProxyType::Https,
            "socks5" | "socks5h" | "socks4" | "socks4a" => ProxyType::Socks5,
            _ => ProxyType::Http,
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    /// `Proxy-Authorization` header value for HTTP proxies.
    pub fn get_auth_header(&self) -> Option<String> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => {
                let creds = format!("{}:{}", u, p.as_str());
                Some(format!("Basic {}", general_purpose::STANDARD.encode(creds)))
            }
            _ => None,
        }
    }

    pub fn requires_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

/// Port in the authority of `raw`, read before `Url` normalizes it away.
fn written_port(raw: &str) -> Option<u16> {
    let (_, rest) = raw.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    if host_port.ends_with(']') {
        return None;
    }
    host_port.rsplit_once(':')?.1.parse().ok()
}
