// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunneld Contributors

// Network address helpers shared by the daemon and CLI

use std::net::IpAddr;

/// Format a host:port address, wrapping IPv6 literals in brackets.
///
/// # Examples
/// ```
/// use tunneld_common::format_host_port;
///
/// assert_eq!(format_host_port("127.0.0.1", 8080), "127.0.0.1:8080");
/// assert_eq!(format_host_port("example.com", 443), "example.com:443");
/// assert_eq!(format_host_port("::1", 22), "[::1]:22");
/// ```
pub fn format_host_port(host: &str, port: u16) -> String {
    if let Ok(IpAddr::V6(_)) = host.parse::<IpAddr>() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Split a "host:port" string, undoing IPv6 brackets.
/// Accepts the forms produced by `format_host_port`.
pub fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        // [v6]:port
        let (host, rest) = rest.split_once(']')?;
        (host, rest.strip_prefix(':')?)
    } else {
        addr.rsplit_once(':')?
    };
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}

/// Check whether a host string refers to a loopback address.
/// Only a parseable loopback IP or the literal name "localhost" qualifies.
pub fn is_loopback_address(host: &str) -> bool {
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        Err(_) => host.eq_ignore_ascii_case("localhost"),
    }
}

/// Validate that a string is an IP address (v4 or v6) or an RFC 1123 hostname
pub fn is_valid_host(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }

    if host.parse::<IpAddr>().is_ok() {
        return true;
    }

    // Names made entirely of digits and dots are malformed IP literals
    // (e.g. "10.1.2.256"), never hostnames
    if host.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return false;
    }

    host.split('.').all(valid_dns_label)
}

/// One dot-separated hostname label: 1-63 alphanumeric/hyphen bytes,
/// with hyphens only in the interior
fn valid_dns_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) if bytes.len() <= 63 => {
            first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        }
        _ => false,
    }
}
