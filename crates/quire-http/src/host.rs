use std::net::{IpAddr, SocketAddr};

use crate::{ServerConfig, Version};

/// Whether a request's `Host` names this server.
///
/// Only HTTP/1.0 requests may leave it out. Address literals are accepted for loopback, the
/// address the client connected to, and configured interfaces.
pub fn valid_host(host: Option<&str>, version: Version, config: &ServerConfig, local: SocketAddr) -> bool {
    let host = match host.map(str::trim) {
        Some(host) if !host.is_empty() => host,
        _ => return version < Version::HTTP_1_1,
    };

    let name = strip_port(host);
    let name = name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase();

    if let Ok(addr) = name.parse::<IpAddr>() {
        return addr.is_loopback()
            || addr == local.ip()
            || config
                .interfaces
                .iter()
                .any(|interface| interface.parse::<IpAddr>() == Ok(addr));
    }

    if name == "localhost" || name.ends_with(".local") {
        return true;
    }

    if name.eq_ignore_ascii_case(&config.server_name) {
        return true;
    }

    config
        .aliases
        .iter()
        .chain(config.interfaces.iter())
        .any(|alias| alias == "*" || alias.eq_ignore_ascii_case(&name))
}

/// Host part of a `Host` value, brackets removed from IPv6 literals.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }

    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}
