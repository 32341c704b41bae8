//! Attach to a daemon that is already listening on a Unix socket

use super::Backend;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::launch::{LaunchContext, Launched};
use std::os::unix::net::UnixStream;
use std::path::Path;
use tracing::debug;

/// The `unix:<path>` backend.
///
/// Nothing is started, so there is no console, no process id and no way
/// to add read-only drives.
#[derive(Debug, Default)]
pub struct UnixBackend;

impl UnixBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for UnixBackend {
    fn launch(&mut self, ctx: &mut LaunchContext<'_>, arg: Option<&str>) -> Result<Launched> {
        let path = match arg {
            Some(path) if Path::new(path).is_absolute() => Path::new(path),
            _ => {
                return Err(Error::InvalidParameter(
                    "unix backend: socket path must be an absolute path, use 'unix:/path'"
                        .to_string(),
                ))
            }
        };

        ctx.send_progress(0);
        debug!(socket = %path.display(), "connecting to daemon");
        let stream = UnixStream::connect(path)
            .map_err(|e| Error::os(format!("connect: {}", path.display()), e))?;

        let connection = Connection::connected(stream, None)?.with_verbose(ctx.verbose());
        Ok(Launched {
            connection,
            appliance_drive: false,
        })
    }
}
