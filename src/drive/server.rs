//! Parsing of server strings given with a drive.

use super::{DriveServer, Transport};
use crate::error::{Error, Result};
use std::path::PathBuf;

/// Address part of a [`DriveServer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    Host { hostname: String, port: u16 },
    Socket(PathBuf),
}

/// Parse one of `tcp:host[:port]`, `unix:path`, `host:port` or `host`.
pub fn parse_server(server: &str) -> Result<DriveServer> {
    if let Some(rest) = server.strip_prefix("tcp:") {
        // An explicit tcp: prefix skips the unix: check.
        return parse_host(rest, Transport::Tcp);
    }

    if let Some(path) = server.strip_prefix("unix:") {
        if path.is_empty() {
            return Err(Error::InvalidDrive(
                "missing Unix domain socket path".to_string(),
            ));
        }
        return Ok(DriveServer {
            transport: Transport::Unix,
            address: ServerAddress::Socket(PathBuf::from(path)),
        });
    }

    parse_host(server, Transport::None)
}

pub(crate) fn parse_servers(servers: &[String]) -> Result<Vec<DriveServer>> {
    servers.iter().map(|s| parse_server(s)).collect()
}

fn parse_host(server: &str, transport: Transport) -> Result<DriveServer> {
    if let Some((hostname, port_str)) = split_port(server) {
        let port = match port_str.parse::<u32>() {
            Ok(port @ 1..=65535) => port as u16,
            _ => {
                return Err(Error::InvalidDrive(format!(
                    "invalid port number '{}'",
                    port_str
                )))
            }
        };
        if !valid_hostname(hostname) {
            return Err(Error::InvalidDrive(format!(
                "invalid hostname '{}'",
                hostname
            )));
        }
        return Ok(DriveServer {
            transport,
            address: ServerAddress::Host {
                hostname: hostname.to_string(),
                port,
            },
        });
    }

    if !valid_hostname(server) {
        return Err(Error::InvalidDrive(format!(
            "invalid hostname or server string '{}'",
            server
        )));
    }

    Ok(DriveServer {
        transport,
        address: ServerAddress::Host {
            hostname: server.to_string(),
            port: 0,
        },
    })
}

/// Split a trailing `:digits`, if there is one.
fn split_port(server: &str) -> Option<(&str, &str)> {
    let (host, port) = server.rsplit_once(':')?;
    if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
        Some((host, port))
    } else {
        None
    }
}

pub(crate) fn valid_hostname(hostname: &str) -> bool {
    let mut chars = hostname.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    hostname.len() <= 255
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '[' | ']' | '-'))
}
