//! RFC 6265 cookie store shared by the transfers of one session.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use url::Url;

use crate::error::HttpError;

/// One stored cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Lowercase, without a leading dot.
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    /// Sent only to exactly `domain`, not its subdomains.
    pub host_only: bool,
    /// `None` for session cookies.
    pub expires: Option<DateTime<Utc>>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: &str) -> Self {
        Cookie {
            name: name.into(),
            value: value.into(),
            domain: normalize_domain(domain),
            path: "/".to_string(),
            secure: false,
            http_only: false,
            host_only: true,
            expires: None,
        }
    }

    /// Parse a `Set-Cookie` value received for `url`.
    pub fn from_set_cookie(header: &str, url: &Url) -> Result<Self, HttpError> {
        let host = url
            .host_str()
            .ok_or_else(|| HttpError::Cookie("no host in url".into()))?;
        let mut parts = header.split(';').map(str::trim);
        let (name, value) = parts
            .next()
            .and_then(|p| p.split_once('='))
            .ok_or_else(|| HttpError::Cookie(format!("no = in {header:?}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(HttpError::Cookie("empty cookie name".into()));
        }

        let mut cookie = Cookie::new(name, value.trim(), host);
        cookie.path = default_path(url.path());
        let mut max_age = None;
        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr, ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "domain" if !val.is_empty() => {
                    let domain = normalize_domain(val);
                    if !domain_matches(&host.to_ascii_lowercase(), &domain) {
                        return Err(HttpError::Cookie(format!(
                            "domain {domain} does not cover {host}"
                        )));
                    }
                    cookie.domain = domain;
                    cookie.host_only = false;
                }
                "path" if val.starts_with('/') => cookie.path = val.to_string(),
                "expires" => cookie.expires = parse_cookie_date(val).or(cookie.expires),
                "max-age" => max_age = val.parse::<i64>().ok(),
                _ => {}
            }
        }
        // Max-Age wins over Expires.
        if let Some(secs) = max_age {
            cookie.expires = if secs <= 0 {
                Some(DateTime::<Utc>::MIN_UTC)
            } else {
                chrono::TimeDelta::try_seconds(secs).and_then(|d| Utc::now().checked_add_signed(d))
            };
        }
        Ok(cookie)
    }

    /// Parse a Netscape cookie-file line (seven tab-separated fields).
    pub fn from_netscape_line(line: &str) -> Result<Self, HttpError> {
        let (http_only, line) = match line.strip_prefix("#HttpOnly_") {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 7 {
            return Err(HttpError::Cookie(format!(
                "expected 7 fields, got {}",
                parts.len()
            )));
        }
        Ok(Cookie {
            name: parts[5].to_string(),
            value: parts[6].to_string(),
            domain: normalize_domain(parts[0]),
            path: parts[2].to_string(),
            secure: parts[3].eq_ignore_ascii_case("true"),
            http_only,
            host_only: !parts[1].eq_ignore_ascii_case("true"),
            expires: parts[4]
                .parse::<i64>()
                .ok()
                .filter(|&ts| ts > 0)
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        })
    }

    pub fn to_netscape_line(&self) -> String {
        format!(
            "{}{}{}\t{}\t{}\t{}\t{}\t{}\t{}",
            if self.http_only { "#HttpOnly_" } else { "" },
            if self.host_only { "" } else { "." },
            self.domain,
            if self.host_only { "FALSE" } else { "TRUE" },
            self.path,
            if self.secure { "TRUE" } else { "FALSE" },
            self.expires.map(|dt| dt.timestamp().max(0)).unwrap_or(0),
            self.name,
            self.value
        )
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|e| e <= now)
    }

    /// Whether this cookie belongs in a request to `url`.
    pub fn matches(&self, url: &Url, now: DateTime<Utc>) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        if self.secure && url.scheme() != "https" {
            return false;
        }
        if self.is_expired(now) {
            return false;
        }
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(&host, &self.domain)
        };
        domain_ok && path_matches(url.path(), &self.path)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Cookie store of one session.
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    cookies: BTreeMap<(String, String, String), Cookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a cookie. An already-expired cookie deletes the
    /// stored one with the same domain, path and name.
    pub fn store(&mut self, cookie: Cookie) {
        let key = (
            cookie.domain.clone(),
            cookie.path.clone(),
            cookie.name.clone(),
        );
        if cookie.is_expired(Utc::now()) {
            self.cookies.remove(&key);
        } else {
            self.cookies.insert(key, cookie);
        }
    }

    /// Record a `Set-Cookie` value received for `url`. Invalid values are
    /// ignored.
    pub fn store_set_cookie(&mut self, header: &str, url: &Url) {
        match Cookie::from_set_cookie(header, url) {
            Ok(cookie) => self.store(cookie),
            Err(e) => tracing::debug!(error = %e, "ignoring Set-Cookie"),
        }
    }

    /// Load a caller-supplied cookie line. Accepts a `Set-Cookie:` header
    /// line, a Netscape cookie-file line, or a bare `name=value` (with
    /// optional attributes) scoped to `url`.
    pub fn load(&mut self, line: &str, url: &Url) -> Result<(), HttpError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let cookie = if let Some(rest) = strip_prefix_ignore_case(line, "set-cookie:") {
            Cookie::from_set_cookie(rest.trim(), url)?
        } else if line.contains('\t') {
            Cookie::from_netscape_line(line)?
        } else {
            Cookie::from_set_cookie(line.trim(), url)?
        };
        self.store(cookie);
        Ok(())
    }

    /// `Cookie` header value for a request to `url`, longest paths first.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let now = Utc::now();
        let mut matching: Vec<&Cookie> = self
            .cookies
            .values()
            .filter(|c| c.matches(url, now))
            .collect();
        if matching.is_empty() {
            return None;
        }
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Some(
            matching
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Every live cookie in Netscape format.
    pub fn netscape_lines(&self) -> Vec<String> {
        let now = Utc::now();
        self.cookies
            .values()
            .filter(|c| !c.is_expired(now))
            .map(Cookie::to_netscape_line)
            .collect()
    }

    pub fn get(&self, domain: &str, name: &str) -> Option<&Cookie> {
        let domain = normalize_domain(domain);
        self.cookies
            .values()
            .find(|c| c.domain == domain && c.name == name)
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.strip_prefix('.').unwrap_or(domain).to_ascii_lowercase()
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn path_matches(request: &str, cookie: &str) -> bool {
    request == cookie
        || (request.starts_with(cookie)
            && (cookie.ends_with('/') || request.as_bytes().get(cookie.len()) == Some(&b'/')))
}

// RFC 6265 5.1.4 default-path.
fn default_path(request: &str) -> String {
    match request.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => request[..i].to_string(),
    }
}

fn parse_cookie_date(date: &str) -> Option<DateTime<Utc>> {
    for fmt in [
        "%a, %d %b %Y %H:%M:%S GMT",
        "%a, %d-%b-%Y %H:%M:%S GMT",
        "%a, %d-%b-%y %H:%M:%S GMT",
        "%A, %d-%b-%y %H:%M:%S GMT",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(date, fmt) {
            return Some(dt.and_utc());
        }
    }
    date.parse::<i64>()
        .ok()
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}
