//! Collaborators the engine hands decisions to.
//!
//! Each has a permissive or inert default so a `Server` can run without the rest of the
//! print service attached.

use std::{
    fs::File,
    net::{IpAddr, ToSocketAddrs},
    path::Path,
};

use bytes::Bytes;
use quire_resolve::{NoPrinters, PrinterDirectory};
use serde::Deserialize;

use crate::{Fields, Locale, Method, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthScheme {
    #[default]
    None,
    Basic,
    Negotiate,
    /// Local certificate based authentication.
    Local,
}

/// Access rule that applied to a request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccessPolicy {
    pub scheme: AuthScheme,
    /// User names and `@group` entries allowed by the rule.
    pub names: Vec<String>,
}

impl AccessPolicy {
    /// Whether the rule admits one of the system groups, or `@SYSTEM` itself.
    pub fn names_system_group(&self, system_groups: &[String]) -> bool {
        self.names.iter().any(|name| {
            let Some(group) = name.strip_prefix('@') else {
                return false;
            };

            group.eq_ignore_ascii_case("SYSTEM") || system_groups.iter().any(|g| g == group)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub user: Option<String>,
    /// Scheme the client authenticated with.
    pub scheme: AuthScheme,
    /// `OK`, or the status to answer with instead of serving the request.
    pub status: Status,
    pub policy: Option<AccessPolicy>,
}

impl Default for Authorization {
    fn default() -> Self {
        Self {
            user: None,
            scheme: AuthScheme::None,
            status: Status::OK,
            policy: None,
        }
    }
}

pub struct AuthRequest<'a> {
    pub method: Method,
    pub uri: &'a str,
    pub fields: &'a Fields,
    pub peer: IpAddr,
    pub hostname: &'a str,
    pub encrypted: bool,
}

pub trait Authorizer {
    fn authorize(&mut self, request: &AuthRequest) -> Authorization;
}

/// Admits every request anonymously.
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&mut self, _request: &AuthRequest) -> Authorization {
        Authorization::default()
    }
}

pub trait MimeClassifier {
    /// Content type of a file about to be served, if it can be determined.
    fn classify(&self, file: &mut File, name: &str) -> Option<String>;
}

/// Classifies by file suffix alone.
pub struct ExtensionClassifier;

impl MimeClassifier for ExtensionClassifier {
    fn classify(&self, _file: &mut File, name: &str) -> Option<String> {
        let extension = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();

        let mime = match extension.as_str() {
            "html" | "htm" => "text/html",
            "css" => "text/css",
            "js" => "application/javascript",
            "json" => "application/json",
            "xml" | "rss" => "application/xml",
            "txt" | "conf" => "text/plain",
            "strings" => "text/strings",
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "svg" => "image/svg+xml",
            "ico" => "image/x-icon",
            "pdf" => "application/pdf",
            "ppd" => "application/vnd.cups-ppd",
            _ => return None,
        };

        Some(mime.to_string())
    }
}

pub struct IppRequest<'a> {
    pub uri: &'a str,
    pub body: &'a [u8],
    pub peer: IpAddr,
    pub hostname: &'a str,
    pub user: Option<&'a str>,
    pub encrypted: bool,
    pub locale: Option<&'a Locale>,
}

pub struct IppResponse {
    pub status: Status,
    /// Encoded IPP message, sent as `application/ipp`.
    pub body: Bytes,
}

pub trait IppHandler {
    fn process(&mut self, request: &IppRequest) -> IppResponse;
}

/// Refuses every IPP request.
pub struct RejectIpp;

impl IppHandler for RejectIpp {
    fn process(&mut self, _request: &IppRequest) -> IppResponse {
        IppResponse {
            status: Status::BAD_REQUEST,
            body: Bytes::new(),
        }
    }
}

pub trait HostResolver {
    /// Name of a peer address, if it has one.
    fn lookup_addr(&self, addr: IpAddr) -> Option<String>;

    /// Addresses a name resolves to.
    fn lookup_host(&self, name: &str) -> Vec<IpAddr>;
}

/// Never consults a name service; names are only ever address literals.
pub struct LiteralResolver;

impl HostResolver for LiteralResolver {
    fn lookup_addr(&self, _addr: IpAddr) -> Option<String> {
        None
    }

    fn lookup_host(&self, name: &str) -> Vec<IpAddr> {
        name.parse().into_iter().collect()
    }
}

/// Forward lookups through the system resolver.
///
/// The standard library has no reverse lookup, so peers keep their address as name.
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn lookup_addr(&self, _addr: IpAddr) -> Option<String> {
        None
    }

    fn lookup_host(&self, name: &str) -> Vec<IpAddr> {
        (name, 0)
            .to_socket_addrs()
            .map(|addrs| addrs.map(|addr| addr.ip()).collect())
            .unwrap_or_default()
    }
}

/// Everything outside the engine a `Server` consults.
pub struct Services {
    pub authorizer: Box<dyn Authorizer>,
    pub mime: Box<dyn MimeClassifier>,
    pub ipp: Box<dyn IppHandler>,
    pub hosts: Box<dyn HostResolver>,
    pub printers: Box<dyn PrinterDirectory>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            authorizer: Box::new(AllowAll),
            mime: Box::new(ExtensionClassifier),
            ipp: Box::new(RejectIpp),
            hosts: Box::new(LiteralResolver),
            printers: Box::new(NoPrinters),
        }
    }
}
