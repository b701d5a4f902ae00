//! Immutable request descriptions.

use std::time::Duration;

use bytes::Bytes;

use crate::error::Error;

/// Caller-chosen value that correlates a [`Completion`](crate::Completion)
/// with the request that produced it.
///
/// Tokens assigned by [`Session::submit`](crate::Session::submit) have the
/// high bit set, so caller values below [`Token::AUTO_BASE`] never collide
/// with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    /// First value handed out to requests submitted without a token.
    pub const AUTO_BASE: u64 = 1 << 63;

    pub const fn new(value: u64) -> Self {
        Token(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// True for tokens assigned at submission rather than by the caller.
    pub const fn is_assigned(self) -> bool {
        self.0 >= Self::AUTO_BASE
    }
}

impl From<u64> for Token {
    fn from(value: u64) -> Self {
        Token(value)
    }
}

/// An HTTP request as submitted to a [`Session`](crate::Session).
///
/// Built with [`Request::builder`] or one of the method shortcuts. Header
/// lines use the wire form `"Name: value"`. Cookies may be `name=value`
/// pairs, `Set-Cookie` values or Netscape cookie-file lines; the engine
/// loads them into the session's cookie store before the transfer starts.
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    url: String,
    headers: Vec<String>,
    cookies: Vec<String>,
    auth: Option<(String, String)>,
    body: Option<Bytes>,
    connect_timeout: Option<Duration>,
    timeout: Option<Duration>,
    token: Option<Token>,
    dummy: bool,
}

impl Request {
    pub fn builder(method: &str, url: &str) -> RequestBuilder {
        RequestBuilder {
            request: Request {
                method: method.to_string(),
                url: url.to_string(),
                headers: Vec::new(),
                cookies: Vec::new(),
                auth: None,
                body: None,
                connect_timeout: None,
                timeout: None,
                token: None,
                dummy: false,
            },
        }
    }

    pub fn get(url: &str) -> RequestBuilder {
        Self::builder("GET", url)
    }

    pub fn post(url: &str) -> RequestBuilder {
        Self::builder("POST", url)
    }

    pub fn put(url: &str) -> RequestBuilder {
        Self::builder("PUT", url)
    }

    pub fn delete(url: &str) -> RequestBuilder {
        Self::builder("DELETE", url)
    }

    pub fn head(url: &str) -> RequestBuilder {
        Self::builder("HEAD", url)
    }

    /// A request that completes immediately with an empty response and never
    /// touches the network.
    pub fn dummy() -> RequestBuilder {
        let mut builder = Self::builder("GET", "");
        builder.request.dummy = true;
        builder
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Extra header lines, in submission order.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn cookies(&self) -> &[String] {
        &self.cookies
    }

    /// Basic-auth credentials as `(user, password)`.
    pub fn auth(&self) -> Option<(&str, &str)> {
        self.auth.as_ref().map(|(u, p)| (u.as_str(), p.as_str()))
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Limit on the whole transfer, from start to last body byte.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn is_dummy(&self) -> bool {
        self.dummy
    }

    /// Check every field. [`Session::submit`](crate::Session::submit) runs
    /// this before the request leaves the calling thread.
    pub fn validate(&self) -> Result<(), Error> {
        if !is_token(&self.method) {
            return Err(Error::InvalidRequest(format!(
                "bad method {:?}",
                self.method
            )));
        }
        if !self.dummy {
            validate_url(&self.url)?;
        }
        for line in &self.headers {
            validate_header_line(line)?;
        }
        for cookie in &self.cookies {
            if cookie.is_empty() || has_line_break(cookie) {
                return Err(Error::InvalidRequest(format!("bad cookie {cookie:?}")));
            }
        }
        if let Some((user, password)) = &self.auth
            && (user.contains(':') || has_line_break(user) || has_line_break(password))
        {
            return Err(Error::InvalidRequest("bad auth credentials".into()));
        }
        Ok(())
    }
}

/// Builder for [`Request`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    /// Add a header as name and value.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.request.headers.push(format!("{name}: {value}"));
        self
    }

    /// Add a raw `"Name: value"` header line.
    pub fn header_line(mut self, line: impl Into<String>) -> Self {
        self.request.headers.push(line.into());
        self
    }

    pub fn cookie(mut self, cookie: impl Into<String>) -> Self {
        self.request.cookies.push(cookie.into());
        self
    }

    pub fn basic_auth(mut self, user: &str, password: &str) -> Self {
        self.request.auth = Some((user.to_string(), password.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.request.body = Some(body.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.request.connect_timeout = Some(timeout);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request.timeout = Some(timeout);
        self
    }

    pub fn token(mut self, token: impl Into<Token>) -> Self {
        self.request.token = Some(token.into());
        self
    }

    pub fn build(self) -> Request {
        self.request
    }
}

impl From<RequestBuilder> for Request {
    fn from(builder: RequestBuilder) -> Self {
        builder.build()
    }
}

// RFC 9110 tchar.
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_tchar)
}

fn has_line_break(s: &str) -> bool {
    s.bytes().any(|b| b == b'\r' || b == b'\n')
}

fn validate_url(url: &str) -> Result<(), Error> {
    let rest = strip_scheme(url)
        .ok_or_else(|| Error::InvalidRequest(format!("unsupported url {url:?}")))?;
    let authority = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host = authority.rsplit('@').next().unwrap_or_default();
    if host.is_empty() || host.starts_with(':') {
        return Err(Error::InvalidRequest(format!("url has no host {url:?}")));
    }
    if url.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(Error::InvalidRequest(format!(
            "url contains whitespace {url:?}"
        )));
    }
    Ok(())
}

fn strip_scheme(url: &str) -> Option<&str> {
    let (scheme, rest) = url.split_once("://")?;
    if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") {
        Some(rest)
    } else {
        None
    }
}

fn validate_header_line(line: &str) -> Result<(), Error> {
    if has_line_break(line) {
        return Err(Error::InvalidRequest(format!(
            "header contains line break {line:?}"
        )));
    }
    match line.split_once(':') {
        Some((name, _)) if is_token(name) => Ok(()),
        _ => Err(Error::InvalidRequest(format!("bad header line {line:?}"))),
    }
}
