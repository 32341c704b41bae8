//! Validation of drive parameters.
//!
//! Every check happens before anything is allocated for the drive, so a
//! rejected drive never leaves anything behind.

use super::server::parse_servers;
use super::{CacheMode, Discard, Drive, DriveSource, Protocol, ServerAddress, Transport};
use crate::error::{Error, Result};
use crate::tmpdir::{create_raw_disk, TempDirs};
use nix::unistd::AccessFlags;
use std::fs;
use std::path::Path;
use tracing::debug;

const DEV_NULL: &str = "/dev/null";
const DEV_NULL_SIZE: u64 = 4096;
const NBD_DEFAULT_PORT: u16 = 10809;

/// Optional parameters accepted when adding a drive
#[derive(Debug, Clone, Default)]
pub struct AddDriveOptions {
    pub readonly: bool,
    pub format: Option<String>,
    pub name: Option<String>,
    pub label: Option<String>,
    /// Defaults to `file`.
    pub protocol: Option<String>,
    pub server: Vec<String>,
    pub username: Option<String>,
    pub secret: Option<String>,
    pub cachemode: Option<String>,
    pub discard: Option<String>,
    pub copyonread: bool,
    pub blocksize: Option<u32>,
}

impl AddDriveOptions {
    pub fn readonly() -> Self {
        Self {
            readonly: true,
            ..Default::default()
        }
    }
}

/// Run the validation pipeline and build the drive, without its overlay.
///
/// `/dev/null` is swapped for a small raw image in the temporary directory.
pub(crate) fn prepare_drive(
    exportname: &str,
    opts: &AddDriveOptions,
    tmpdirs: &mut TempDirs,
) -> Result<Drive> {
    let discard = match &opts.discard {
        Some(discard) => discard.parse()?,
        None => Discard::Disable,
    };

    if opts.readonly && discard == Discard::Enable {
        return Err(Error::InvalidDrive(
            "discard support cannot be enabled on read-only drives".to_string(),
        ));
    }
    if let Some(format) = &opts.format {
        if !valid_format(format) {
            return Err(Error::InvalidParameter(
                "format parameter is empty or contains disallowed characters".to_string(),
            ));
        }
    }
    if let Some(label) = &opts.label {
        if !valid_disk_label(label) {
            return Err(Error::InvalidParameter(
                "label parameter is empty, too long, or contains disallowed characters"
                    .to_string(),
            ));
        }
    }
    let cachemode = opts
        .cachemode
        .as_deref()
        .map(str::parse::<CacheMode>)
        .transpose()?;
    let blocksize = match opts.blocksize {
        None | Some(0) => 0,
        Some(size @ (512 | 4096)) => size,
        Some(_) => {
            return Err(Error::InvalidParameter(
                "blocksize parameter is invalid".to_string(),
            ))
        }
    };

    let protocol: Protocol = opts.protocol.as_deref().unwrap_or("file").parse()?;
    let servers = parse_servers(&opts.server)?;

    let mut drive = Drive {
        source: DriveSource {
            protocol,
            servers,
            exportname: exportname.to_string(),
            username: opts.username.clone(),
            secret: opts.secret.clone(),
            format: opts.format.clone(),
        },
        readonly: opts.readonly,
        overlay: None,
        name: opts.name.clone(),
        disk_label: opts.label.clone(),
        cachemode,
        discard,
        copyonread: opts.copyonread,
        blocksize,
    };

    match protocol {
        Protocol::File => {
            check_file(&drive.source)?;
            if exportname == DEV_NULL {
                substitute_dev_null(&mut drive, tmpdirs)?;
            } else {
                nix::unistd::access(Path::new(exportname), AccessFlags::R_OK)
                    .map_err(|e| Error::os(exportname, e))?;
            }
        }
        Protocol::Ftp | Protocol::Ftps | Protocol::Http | Protocol::Https | Protocol::Tftp => {
            check_curl(&drive.source)?
        }
        Protocol::Gluster => check_gluster(&drive.source)?,
        Protocol::Iscsi => check_iscsi(&drive.source)?,
        Protocol::Nbd => check_nbd(&mut drive.source)?,
        Protocol::Rbd => check_rbd(&drive.source)?,
        Protocol::Sheepdog => check_sheepdog(&drive.source)?,
        Protocol::Ssh => check_ssh(&drive.source)?,
    }

    Ok(drive)
}

fn invalid(protocol: Protocol, message: &str) -> Error {
    Error::InvalidDrive(format!("{}: {}", protocol, message))
}

fn no_auth(src: &DriveSource) -> Result<()> {
    if src.username.is_some() {
        return Err(invalid(
            src.protocol,
            "you cannot specify a username with this protocol",
        ));
    }
    if src.secret.is_some() {
        return Err(invalid(
            src.protocol,
            "you cannot specify a secret with this protocol",
        ));
    }
    Ok(())
}

fn exactly_one_server(src: &DriveSource) -> Result<()> {
    if src.servers.len() != 1 {
        return Err(invalid(src.protocol, "you must specify exactly one server"));
    }
    Ok(())
}

fn at_least_one_server(src: &DriveSource) -> Result<()> {
    if src.servers.is_empty() {
        return Err(invalid(src.protocol, "you must specify at least one server"));
    }
    Ok(())
}

fn tcp_only(src: &DriveSource) -> Result<()> {
    if src
        .servers
        .iter()
        .any(|s| !matches!(s.transport, Transport::None | Transport::Tcp))
    {
        return Err(invalid(src.protocol, "only tcp transport is supported"));
    }
    Ok(())
}

fn explicit_ports(src: &DriveSource) -> Result<()> {
    if src.servers.iter().any(|s| s.port() == 0) {
        return Err(invalid(src.protocol, "port number must be specified"));
    }
    Ok(())
}

fn exportname_not_empty(src: &DriveSource, what: &str) -> Result<()> {
    if src.exportname.is_empty() {
        return Err(invalid(
            src.protocol,
            &format!("{} should not be an empty string", what),
        ));
    }
    Ok(())
}

fn absolute_exportname(src: &DriveSource) -> Result<()> {
    exportname_not_empty(src, "pathname")?;
    if !src.exportname.starts_with('/') {
        return Err(invalid(src.protocol, "pathname must begin with a '/'"));
    }
    Ok(())
}

fn relative_exportname(src: &DriveSource, what: &str) -> Result<()> {
    exportname_not_empty(src, what)?;
    if src.exportname.starts_with('/') {
        return Err(invalid(
            src.protocol,
            &format!("{} must not begin with a '/'", what),
        ));
    }
    Ok(())
}

fn check_file(src: &DriveSource) -> Result<()> {
    if !src.servers.is_empty() {
        return Err(Error::InvalidDrive(
            "you cannot specify a server with file-backed disks".to_string(),
        ));
    }
    if src.username.is_some() {
        return Err(Error::InvalidDrive(
            "you cannot specify a username with file-backed disks".to_string(),
        ));
    }
    if src.secret.is_some() {
        return Err(Error::InvalidDrive(
            "you cannot specify a secret with file-backed disks".to_string(),
        ));
    }
    Ok(())
}

fn check_curl(src: &DriveSource) -> Result<()> {
    exactly_one_server(src)?;
    tcp_only(src)?;
    absolute_exportname(src)
}

fn check_gluster(src: &DriveSource) -> Result<()> {
    no_auth(src)?;
    exactly_one_server(src)?;
    relative_exportname(src, "volume/image")
}

fn check_iscsi(src: &DriveSource) -> Result<()> {
    exactly_one_server(src)?;
    tcp_only(src)?;
    relative_exportname(src, "target string")
}

fn check_nbd(src: &mut DriveSource) -> Result<()> {
    no_auth(src)?;
    exactly_one_server(src)?;
    for server in &mut src.servers {
        if let ServerAddress::Host { port, .. } = &mut server.address {
            if *port == 0 {
                *port = nbd_port();
            }
        }
    }
    Ok(())
}

fn check_rbd(src: &DriveSource) -> Result<()> {
    at_least_one_server(src)?;
    tcp_only(src)?;
    explicit_ports(src)?;
    relative_exportname(src, "image name")
}

fn check_sheepdog(src: &DriveSource) -> Result<()> {
    no_auth(src)?;
    at_least_one_server(src)?;
    tcp_only(src)?;
    explicit_ports(src)?;
    relative_exportname(src, "volume parameter")
}

fn check_ssh(src: &DriveSource) -> Result<()> {
    exactly_one_server(src)?;
    tcp_only(src)?;
    absolute_exportname(src)?;
    if src.username.as_deref() == Some("") {
        return Err(invalid(src.protocol, "username should not be an empty string"));
    }
    Ok(())
}

/// Zero-sized and null block devices crash some hypervisor and
/// virtio-scsi combinations, so `/dev/null` becomes a small raw image.
fn substitute_dev_null(drive: &mut Drive, tmpdirs: &mut TempDirs) -> Result<()> {
    match drive.source.format.as_deref() {
        Some("raw") | None => {}
        Some(_) => {
            return Err(Error::InvalidDrive(
                "for device '/dev/null', format must be 'raw'".to_string(),
            ))
        }
    }

    let image = tmpdirs.make_temp_path("devnull", Some("img"))?;
    create_raw_disk(&image, DEV_NULL_SIZE)?;
    debug!(image = %image.display(), "substituted /dev/null drive");

    drive.source.exportname = image.to_string_lossy().into_owned();
    drive.source.format = Some("raw".to_string());
    // Nothing can harm a throwaway image, so skip the overlay.
    drive.readonly = false;
    drive.discard = Discard::Disable;
    drive.copyonread = false;
    Ok(())
}

/// The `nbd` entry of the services database, or the IANA default.
fn nbd_port() -> u16 {
    fs::read_to_string("/etc/services")
        .ok()
        .and_then(|services| lookup_service(&services, "nbd", "tcp"))
        .unwrap_or(NBD_DEFAULT_PORT)
}

fn lookup_service(services: &str, name: &str, proto: &str) -> Option<u16> {
    services.lines().find_map(|line| {
        let line = line.split('#').next().unwrap_or("");
        let mut fields = line.split_whitespace();
        let service = fields.next()?;
        let (port, p) = fields.next()?.split_once('/')?;
        let aliases: Vec<&str> = fields.collect();
        if p == proto && (service == name || aliases.contains(&name)) {
            port.parse().ok()
        } else {
            None
        }
    })
}

fn valid_format(format: &str) -> bool {
    !format.is_empty()
        && format
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn valid_disk_label(label: &str) -> bool {
    (1..=20).contains(&label.len()) && label.chars().all(|c| c.is_ascii_alphabetic())
}
