use std::fmt;

use crate::Status;

/// Methods understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Options,
    Delete,
    Trace,
}

impl Method {
    pub fn parse(token: &str) -> Option<Self> {
        let method = match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "OPTIONS" => Method::Options,
            "DELETE" => Method::Delete,
            "TRACE" => Method::Trace,
            _ => return None,
        };
        Some(method)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Options => "OPTIONS",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
        }
    }

    /// Whether requests with this method carry a body the engine reads.
    pub fn has_body(self) -> bool {
        matches!(self, Method::Post | Method::Put)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_1_0: Version = Version { major: 1, minor: 0 };
    pub const HTTP_1_1: Version = Version { major: 1, minor: 1 };

    pub fn parse(token: &str) -> Option<Self> {
        let (major, minor) = token.strip_prefix("HTTP/")?.split_once('.')?;

        Some(Version {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// Ordered header fields with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    entries: Vec<(String, String)>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value of the named field.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Replace all values of the named field.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.entries.push((name.to_string(), value.into()));
    }

    /// Add a value, keeping existing ones.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_string(), value.into()));
    }

    /// Remove the named field, returning its first value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let mut removed = None;

        self.entries.retain(|(key, value)| {
            if !key.eq_ignore_ascii_case(name) {
                return true;
            }

            if removed.is_none() {
                removed = Some(value.clone());
            }
            false
        });

        removed
    }

    /// Whether the comma separated field contains `token`, case-insensitively.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .flat_map(|(_, value)| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A parsed request line and header block.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Decoded resource path, followed by the raw query if there is one.
    pub uri: String,
    pub version: Version,
    pub fields: Fields,
}

impl RequestHead {
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or_default()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, query)| query)
    }

    /// Whether the client asked for, or defaults to, a persistent connection.
    pub fn wants_keep_alive(&self) -> bool {
        if self.fields.has_token("Connection", "close") {
            return false;
        }

        self.version >= Version::HTTP_1_1 || self.fields.has_token("Connection", "keep-alive")
    }

    pub fn is_chunked(&self) -> bool {
        self.fields.has_token("Transfer-Encoding", "chunked")
    }
}

/// Split a request line into its parts.
///
/// Errors carry the status the client should receive.
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version), Status> {
    let mut parts = line.split_ascii_whitespace();

    let (Some(method), Some(uri), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Status::BAD_REQUEST);
    };

    let version = Version::parse(version).ok_or(Status::BAD_REQUEST)?;
    if version.major >= 2 {
        return Err(Status::VERSION_NOT_SUPPORTED);
    }
    if version.major == 0 {
        return Err(Status::BAD_REQUEST);
    }

    let Some(method) = Method::parse(method) else {
        // Well-formed but unsupported methods are distinguished from garbage
        let is_token = method.bytes().all(|b| b.is_ascii_uppercase());
        return Err(if is_token {
            Status::METHOD_NOT_ALLOWED
        } else {
            Status::BAD_REQUEST
        });
    };

    Ok((method, uri.to_string(), version))
}

/// Reduce a request URI to a decoded resource path plus raw query.
pub fn normalize_uri(raw: &str) -> Result<String, Status> {
    if raw == "*" {
        return Ok(raw.to_string());
    }

    if has_traversal(raw) {
        return Err(Status::FORBIDDEN);
    }

    let resource = strip_authority(raw);
    if !resource.starts_with('/') {
        return Err(Status::BAD_REQUEST);
    }

    let (path, query) = match resource.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (resource, None),
    };

    let path = percent_decode(path).ok_or(Status::BAD_REQUEST)?;
    if path.contains(['\0', '?']) {
        return Err(Status::BAD_REQUEST);
    }
    if has_traversal(&path) {
        return Err(Status::FORBIDDEN);
    }

    Ok(match query {
        Some(query) => format!("{}?{}", path, query),
        None => path,
    })
}

/// A `/../` segment with anything after it.
pub fn has_traversal(uri: &str) -> bool {
    uri.match_indices("/../").any(|(i, _)| i + 4 < uri.len())
}

fn strip_authority(raw: &str) -> &str {
    for scheme in ["http://", "https://", "ipp://", "ipps://"] {
        let matches = raw
            .get(..scheme.len())
            .map(|prefix| prefix.eq_ignore_ascii_case(scheme))
            .unwrap_or(false);

        if matches {
            let rest = &raw[scheme.len()..];
            return rest.find('/').map(|i| &rest[i..]).unwrap_or("/");
        }
    }

    raw
}

/// Decode `%XX` escapes, leaving malformed escapes as they are.
///
/// Returns `None` if the result isn't valid UTF-8.
pub fn percent_decode(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());

    let mut i = 0;
    while i < bytes.len() {
        let escape = (bytes[i] == b'%')
            .then(|| bytes.get(i + 1..i + 3))
            .flatten()
            .and_then(|hex| std::str::from_utf8(hex).ok())
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());

        match escape {
            Some(byte) => {
                decoded.push(byte);
                i += 3;
            }
            None => {
                decoded.push(bytes[i]);
                i += 1;
            }
        }
    }

    String::from_utf8(decoded).ok()
}
