//! Per-session temporary directory.
//!
//! The directory is created the first time something needs it and is
//! removed, with everything in it, when the session is dropped.  Overlays,
//! scratch disks and sockets all live here, so none of them need to be
//! cleaned up individually.

use crate::error::{Error, Result};
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

const PREFIX: &str = "vmappliance";

pub struct TempDirs {
    base: PathBuf,
    dir: Option<TempDir>,
    unique: u32,
}

impl TempDirs {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            dir: None,
            unique: 0,
        }
    }

    /// The temporary directory, creating it if necessary.
    pub fn path(&mut self) -> Result<&Path> {
        let dir = match self.dir.take() {
            Some(dir) => dir,
            None => self.create()?,
        };
        Ok(self.dir.insert(dir).path())
    }

    fn create(&self) -> Result<TempDir> {
        let dir = tempfile::Builder::new()
            .prefix(PREFIX)
            .tempdir_in(&self.base)
            .map_err(|e| {
                Error::os(
                    format!(
                        "{}/{}XXXXXX: cannot create temporary directory",
                        self.base.display(),
                        PREFIX
                    ),
                    e,
                )
            })?;

        // The hypervisor may run as another user when we are root.
        if nix::unistd::geteuid().is_root() {
            fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755))
                .map_err(|e| Error::os(dir.path().display().to_string(), e))?;
        }

        debug!(tmpdir = %dir.path().display(), "created temporary directory");
        Ok(dir)
    }

    /// Whether the directory has been created yet.
    pub fn is_created(&self) -> bool {
        self.dir.is_some()
    }

    /// A fresh, unique path `<name><N>[.<extension>]` inside the directory.
    pub fn make_temp_path(&mut self, name: &str, extension: Option<&str>) -> Result<PathBuf> {
        self.unique += 1;
        let file_name = match extension {
            Some(ext) => format!("{}{}.{}", name, self.unique, ext),
            None => format!("{}{}", name, self.unique),
        };
        Ok(self.path()?.join(file_name))
    }
}

/// Create a sparse raw disk image of `size` bytes.
pub fn create_raw_disk(path: &Path, size: u64) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::os(path.display().to_string(), e))?;
    file.set_len(size)
        .map_err(|e| Error::os(format!("{}: truncate", path.display()), e))?;
    Ok(())
}
