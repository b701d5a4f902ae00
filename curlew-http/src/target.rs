//! Parsed request targets.

use std::net::{IpAddr, SocketAddr};

use url::{Host, Url};

use crate::error::HttpError;

/// Key of an idle-connection cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    pub(crate) tls: bool,
    pub(crate) host: String,
    pub(crate) port: u16,
}

/// A request URL broken into what the engine needs.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub(crate) url: Url,
    pub(crate) tls: bool,
    pub(crate) port: u16,
}

impl Target {
    pub(crate) fn parse(raw: &str) -> Result<Self, HttpError> {
        let url = Url::parse(raw).map_err(|e| HttpError::InvalidUrl(format!("{raw}: {e}")))?;
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(HttpError::InvalidUrl(format!("unsupported scheme {other}"))),
        };
        if url.host_str().is_none_or(str::is_empty) {
            return Err(HttpError::InvalidUrl(format!("{raw}: no host")));
        }
        let port = url
            .port_or_known_default()
            .ok_or_else(|| HttpError::InvalidUrl(format!("{raw}: no port")))?;
        Ok(Target { url, tls, port })
    }

    /// Host as written in the URL, IPv6 literals bracketed.
    pub(crate) fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Host name for SNI and certificate checks, without brackets.
    pub(crate) fn server_name(&self) -> String {
        match self.url.host() {
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => self.host().to_string(),
        }
    }

    /// Address of an IP-literal host; `None` for names that need resolving.
    pub(crate) fn literal_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = match self.url.host()? {
            Host::Ipv4(ip) => ip.into(),
            Host::Ipv6(ip) => ip.into(),
            Host::Domain(_) => return None,
        };
        Some(SocketAddr::new(ip, self.port))
    }

    /// Value of the `Host` header: the default port is omitted.
    pub(crate) fn host_header(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{port}", self.host()),
            None => self.host().to_string(),
        }
    }

    /// Origin-form request target: path plus query.
    pub(crate) fn request_target(&self) -> String {
        let mut target = self.url.path().to_string();
        if target.is_empty() {
            target.push('/');
        }
        if let Some(query) = self.url.query() {
            target.push('?');
            target.push_str(query);
        }
        target
    }

    /// Credentials embedded in the URL.
    pub(crate) fn userinfo(&self) -> Option<(String, String)> {
        if self.url.username().is_empty() {
            return None;
        }
        Some((
            percent_decode(self.url.username()),
            percent_decode(self.url.password().unwrap_or_default()),
        ))
    }

    pub(crate) fn pool_key(&self) -> PoolKey {
        PoolKey {
            tls: self.tls,
            host: self.host().to_ascii_lowercase(),
            port: self.port,
        }
    }

    /// Resolve a `Location` value against this URL.
    pub(crate) fn resolve(&self, location: &str) -> Option<String> {
        self.url.join(location).ok().map(String::from)
    }

    /// The URL without its fragment, as reported for the finished transfer.
    pub(crate) fn effective_url(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url.into()
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let hex = bytes
            .get(i + 1..i + 3)
            .and_then(|h| std::str::from_utf8(h).ok())
            .and_then(|h| u8::from_str_radix(h, 16).ok());
        match (bytes[i], hex) {
            (b'%', Some(b)) => {
                out.push(b);
                i += 3;
            }
            (b, _) => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
