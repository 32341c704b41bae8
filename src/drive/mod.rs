//! Block-device sources attached to a session.
//!
//! A [`Drive`] is created once, when it is added, and is never changed
//! afterwards except for attaching an overlay.  Drives are kept in a
//! [`DriveRegistry`] owned by the session.

mod qemu;
mod registry;
mod server;
mod validate;

pub use qemu::qemu_param;
pub use registry::DriveRegistry;
pub use server::{parse_server, ServerAddress};
pub use validate::AddDriveOptions;

pub(crate) use validate::prepare_drive;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// The protocol used to reach a drive's data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    File,
    Ftp,
    Ftps,
    Gluster,
    Http,
    Https,
    Iscsi,
    Nbd,
    Rbd,
    Sheepdog,
    Ssh,
    Tftp,
}

impl Protocol {
    /// All known protocols
    pub const ALL: [Protocol; 12] = [
        Protocol::File,
        Protocol::Ftp,
        Protocol::Ftps,
        Protocol::Gluster,
        Protocol::Http,
        Protocol::Https,
        Protocol::Iscsi,
        Protocol::Nbd,
        Protocol::Rbd,
        Protocol::Sheepdog,
        Protocol::Ssh,
        Protocol::Tftp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::File => "file",
            Protocol::Ftp => "ftp",
            Protocol::Ftps => "ftps",
            Protocol::Gluster => "gluster",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Iscsi => "iscsi",
            Protocol::Nbd => "nbd",
            Protocol::Rbd => "rbd",
            Protocol::Sheepdog => "sheepdog",
            Protocol::Ssh => "ssh",
            Protocol::Tftp => "tftp",
        }
    }

    /// Protocols served through the curl block driver
    pub fn is_curl(&self) -> bool {
        matches!(
            self,
            Protocol::Ftp | Protocol::Ftps | Protocol::Http | Protocol::Https | Protocol::Tftp
        )
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Protocol::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::UnknownProtocol(s.to_string()))
    }
}

/// How a server is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// No transport was named; the protocol default (tcp) applies.
    None,
    Tcp,
    Unix,
}

/// One network endpoint of a drive source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveServer {
    pub transport: Transport,
    pub address: ServerAddress,
}

impl DriveServer {
    pub fn hostname(&self) -> Option<&str> {
        match &self.address {
            ServerAddress::Host { hostname, .. } => Some(hostname),
            ServerAddress::Socket(_) => None,
        }
    }

    /// The port, where `0` means "protocol default".
    pub fn port(&self) -> u16 {
        match &self.address {
            ServerAddress::Host { port, .. } => *port,
            ServerAddress::Socket(_) => 0,
        }
    }
}

impl fmt::Display for DriveServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.transport, &self.address) {
            (_, ServerAddress::Socket(path)) => write!(f, "unix:{}", path.display()),
            (Transport::Tcp, ServerAddress::Host { hostname, port }) => {
                write!(f, "tcp:{}:{}", hostname, port)
            }
            (_, ServerAddress::Host { hostname, port: 0 }) => write!(f, "{}", hostname),
            (_, ServerAddress::Host { hostname, port }) => write!(f, "{}:{}", hostname, port),
        }
    }
}

/// Whether guest discard requests are passed down to the drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discard {
    #[default]
    Disable,
    Enable,
    BestEffort,
}

impl Discard {
    pub fn as_str(&self) -> &'static str {
        match self {
            Discard::Disable => "disable",
            Discard::Enable => "enable",
            Discard::BestEffort => "besteffort",
        }
    }
}

impl FromStr for Discard {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disable" => Ok(Discard::Disable),
            "enable" => Ok(Discard::Enable),
            "besteffort" => Ok(Discard::BestEffort),
            _ => Err(Error::InvalidParameter(
                "discard parameter must be 'disable', 'enable' or 'besteffort'".to_string(),
            )),
        }
    }
}

/// Host page-cache policy for a drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Writeback,
    Unsafe,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Writeback => "writeback",
            CacheMode::Unsafe => "unsafe",
        }
    }
}

impl FromStr for CacheMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "writeback" => Ok(CacheMode::Writeback),
            "unsafe" => Ok(CacheMode::Unsafe),
            _ => Err(Error::InvalidParameter(
                "cachemode parameter must be 'writeback' (default) or 'unsafe'".to_string(),
            )),
        }
    }
}

/// Where a drive's data comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveSource {
    pub protocol: Protocol,
    pub servers: Vec<DriveServer>,
    /// Local path for `file`, otherwise a protocol-specific resource name.
    pub exportname: String,
    pub username: Option<String>,
    pub secret: Option<String>,
    pub format: Option<String>,
}

/// A drive attached to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drive {
    pub source: DriveSource,
    pub readonly: bool,
    /// Copy-on-write layer in front of a read-only source.
    pub overlay: Option<PathBuf>,
    pub name: Option<String>,
    pub disk_label: Option<String>,
    pub cachemode: Option<CacheMode>,
    pub discard: Discard,
    pub copyonread: bool,
    /// `0` when unset, otherwise 512 or 4096.
    pub blocksize: u32,
}

impl Drive {
    /// The placeholder that keeps appliance device numbering aligned.
    pub(crate) fn dummy() -> Self {
        Drive {
            source: DriveSource {
                protocol: Protocol::File,
                servers: Vec::new(),
                exportname: String::new(),
                username: None,
                secret: None,
                format: None,
            },
            readonly: false,
            overlay: None,
            name: None,
            disk_label: None,
            cachemode: None,
            discard: Discard::Disable,
            copyonread: false,
            blocksize: 0,
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.source.protocol == Protocol::File && self.source.exportname.is_empty()
    }
}

impl fmt::Display for Drive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dummy() {
            return write!(f, "(appliance)");
        }
        write!(f, "{}", self.source.exportname)?;
        if self.readonly {
            write!(f, " readonly")?;
        }
        if let Some(format) = &self.source.format {
            write!(f, " format={}", format)?;
        }
        write!(f, " protocol={}", self.source.protocol)?;
        if let Some(name) = &self.name {
            write!(f, " name={}", name)?;
        }
        if let Some(label) = &self.disk_label {
            write!(f, " label={}", label)?;
        }
        if let Some(cache) = &self.cachemode {
            write!(f, " cache={}", cache.as_str())?;
        }
        if self.discard != Discard::Disable {
            write!(f, " discard={}", self.discard.as_str())?;
        }
        if self.copyonread {
            write!(f, " copyonread")?;
        }
        if self.blocksize != 0 {
            write!(f, " blocksize={}", self.blocksize)?;
        }
        Ok(())
    }
}
