//! Rendering a drive source as a hypervisor `file=` parameter.

use super::{DriveServer, DriveSource, Protocol, ServerAddress};
use crate::error::{Error, Result};
use std::fs;
use url::Url;

/// The string the hypervisor needs to open `src`.
///
/// Local paths are made absolute, because overlays live in the temporary
/// directory and a relative backing path would be resolved from there.
pub fn qemu_param(src: &DriveSource) -> Result<String> {
    match src.protocol {
        Protocol::File => {
            let path = fs::canonicalize(&src.exportname).map_err(|e| {
                Error::os(
                    format!(
                        "realpath: could not convert '{}' to absolute path",
                        src.exportname
                    ),
                    e,
                )
            })?;
            Ok(path.to_string_lossy().into_owned())
        }

        Protocol::Ftp
        | Protocol::Ftps
        | Protocol::Http
        | Protocol::Https
        | Protocol::Ssh
        | Protocol::Tftp => make_uri(
            src.protocol.as_str(),
            src.username.as_deref(),
            src.secret.as_deref(),
            first_server(src)?,
            &src.exportname,
        ),

        Protocol::Gluster => {
            let server = first_server(src)?;
            match &server.address {
                ServerAddress::Socket(socket) => Ok(format!(
                    "gluster+unix:///{}?socket={}",
                    src.exportname,
                    socket.display()
                )),
                ServerAddress::Host { .. } => {
                    let scheme = match server.transport {
                        super::Transport::Tcp => "gluster+tcp",
                        _ => "gluster",
                    };
                    make_uri(
                        scheme,
                        None,
                        None,
                        server,
                        &format!("/{}", src.exportname),
                    )
                }
            }
        }

        Protocol::Iscsi => {
            let server = first_server(src)?;
            // The target keeps its slash, it is "iqn/lun".
            let uri = make_uri("iscsi", None, None, server, &format!("/{}", src.exportname))?;
            match (&src.username, &src.secret) {
                (Some(user), Some(secret)) => Ok(format!(
                    "iscsi://{}%{}@{}",
                    user,
                    secret,
                    &uri["iscsi://".len()..]
                )),
                _ => Ok(uri),
            }
        }

        Protocol::Nbd => {
            let server = first_server(src)?;
            let base = match &server.address {
                ServerAddress::Host { hostname, port } => format!("nbd:{}:{}", hostname, port),
                ServerAddress::Socket(socket) => format!("nbd:unix:{}", socket.display()),
            };
            if src.exportname.is_empty() {
                Ok(base)
            } else {
                Ok(format!("{}:exportname={}", base, src.exportname))
            }
        }

        Protocol::Rbd => {
            let hosts: Vec<String> = src
                .servers
                .iter()
                .filter_map(|s| {
                    s.hostname()
                        .map(|h| format!("{}\\:{}", h.replace(':', "\\:"), s.port()))
                })
                .collect();
            let mut param = format!("rbd:{}", src.exportname);
            if !hosts.is_empty() {
                param.push_str(":mon_host=");
                param.push_str(&hosts.join("\\;"));
            }
            if let Some(user) = &src.username {
                param.push_str(&format!(":id={}", user));
            }
            if src.username.is_some() || src.secret.is_some() {
                param.push_str(":auth_supported=cephx\\;none");
            } else {
                param.push_str(":auth_supported=none");
            }
            if let Some(secret) = &src.secret {
                param.push_str(&format!(":key={}", secret));
            }
            Ok(param)
        }

        Protocol::Sheepdog => match src.servers.first() {
            Some(server) => Ok(format!(
                "sheepdog:{}:{}:{}",
                server.hostname().unwrap_or_default(),
                server.port(),
                src.exportname
            )),
            None => Ok(format!("sheepdog:{}", src.exportname)),
        },
    }
}

fn first_server(src: &DriveSource) -> Result<&DriveServer> {
    src.servers.first().ok_or_else(|| {
        Error::InvalidDrive(format!("{}: you must specify exactly one server", src.protocol))
    })
}

fn make_uri(
    scheme: &str,
    username: Option<&str>,
    secret: Option<&str>,
    server: &DriveServer,
    path: &str,
) -> Result<String> {
    let bad_uri = || {
        Error::InvalidDrive(format!(
            "{}: cannot build a URI for server '{}'",
            scheme, server
        ))
    };

    let hostname = server.hostname().ok_or_else(bad_uri)?;
    let mut uri = Url::parse(&format!("{}://{}", scheme, hostname)).map_err(|_| bad_uri())?;
    if let Some(username) = username {
        uri.set_username(username).map_err(|_| bad_uri())?;
    }
    if let Some(secret) = secret {
        uri.set_password(Some(secret)).map_err(|_| bad_uri())?;
    }
    if server.port() != 0 {
        uri.set_port(Some(server.port())).map_err(|_| bad_uri())?;
    }
    uri.set_path(path);
    Ok(uri.to_string())
}
