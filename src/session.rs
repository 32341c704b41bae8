//! The session: drives, backend selection and the launch state machine.

use crate::backend::{Backend, BackendEntry, BackendRegistry};
use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::drive::{prepare_drive, AddDriveOptions, DriveRegistry};
use crate::error::{Error, Result};
use crate::events::Events;
use crate::launch::{LaunchContext, Launched, ProgressTracker, PROGRESS_TOTAL};
use crate::tmpdir::{create_raw_disk, TempDirs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::sync::Arc;
use tracing::{debug, info};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Drives may be added and the backend changed.
    Config,
    Launching,
    /// The appliance is up.
    Ready,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Config => "config",
            SessionState::Launching => "launching",
            SessionState::Ready => "ready",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The most recent failure of a public session call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub message: String,
    pub errno: Option<i32>,
}

/// One appliance and the drives it is given.
///
/// Drives are added while the session is in [`SessionState::Config`];
/// [`launch`](Session::launch) then hands them to the selected backend.
/// Everything the session created on disk lives in its temporary
/// directory and is removed when the session is dropped.
pub struct Session {
    registry: Arc<BackendRegistry>,
    config: SessionConfig,
    state: SessionState,
    method: String,
    backend_arg: Option<String>,
    entry: BackendEntry,
    conn: Option<Connection>,
    backend: Box<dyn Backend>,
    drives: DriveRegistry,
    events: Events,
    last_error: Option<LastError>,
    // Last, so overlays outlive the hypervisor using them.
    tmpdirs: TempDirs,
}

impl Session {
    /// A session using the backend named in `config`.
    pub fn new(registry: Arc<BackendRegistry>, config: SessionConfig) -> Result<Self> {
        let (entry, method, backend_arg) = registry.resolve(&config.backend)?;
        let entry = entry.clone();
        let backend = entry.instantiate(&config);
        let tmpdirs = TempDirs::new(&config.tmpdir);

        Ok(Self {
            registry,
            config,
            state: SessionState::Config,
            method,
            backend_arg,
            entry,
            conn: None,
            backend,
            drives: DriveRegistry::new(),
            events: Events::default(),
            last_error: None,
            tmpdirs,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_config(&self) -> bool {
        self.state == SessionState::Config
    }

    pub fn is_launching(&self) -> bool {
        self.state == SessionState::Launching
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// The backend method in use, including any `:argument`.
    pub fn backend(&self) -> &str {
        &self.method
    }

    /// Switch to another backend.  Only allowed before launch.
    pub fn set_backend(&mut self, method: &str) -> Result<()> {
        self.trace_call("set_backend");
        let result = self.set_backend_inner(method);
        self.record(result)
    }

    fn set_backend_inner(&mut self, method: &str) -> Result<()> {
        self.require_config("set_backend")?;
        let (entry, method, arg) = self.registry.resolve(method)?;
        let entry = entry.clone();
        self.backend = entry.instantiate(&self.config);
        self.entry = entry;
        self.method = method;
        self.backend_arg = arg;
        debug!(backend = %self.method, "backend selected");
        Ok(())
    }

    pub fn set_log_callback<F>(&mut self, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.events.log = Some(Arc::new(callback));
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.events.progress = Some(Arc::new(callback));
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    pub fn drives(&self) -> &DriveRegistry {
        &self.drives
    }

    /// One line per drive, for debugging.
    pub fn debug_drives(&self) -> Vec<String> {
        self.drives.debug_drives()
    }

    /// Add a drive and return its index.
    ///
    /// A rejected drive leaves the session unchanged.  Read-only drives
    /// get a copy-on-write overlay from the backend.
    pub fn add_drive(&mut self, filename: &str, opts: &AddDriveOptions) -> Result<usize> {
        self.trace_call("add_drive");
        let result = self.add_drive_inner(filename, opts);
        self.record(result)
    }

    fn add_drive_inner(&mut self, filename: &str, opts: &AddDriveOptions) -> Result<usize> {
        if self.state != SessionState::Config {
            return Err(Error::InvalidState(
                "hotplugging support was removed".to_string(),
            ));
        }

        let mut drive = prepare_drive(filename, opts, &mut self.tmpdirs)?;
        if drive.readonly {
            debug!("creating COW overlay to protect original drive content");
            let overlay = self.backend.create_cow_overlay(&mut self.tmpdirs, &drive)?;
            drive.overlay = Some(overlay);
        }

        debug!(%drive, "adding drive");
        Ok(self.drives.push(drive))
    }

    /// Add `filename` read-only.
    pub fn add_drive_ro(&mut self, filename: &str) -> Result<usize> {
        self.add_drive(filename, &AddDriveOptions::readonly())
    }

    /// Add a new sparse raw disk of `size` bytes, discarded with the session.
    ///
    /// Only `name`, `label` and `blocksize` are taken from `opts`.
    pub fn add_drive_scratch(&mut self, size: u64, opts: &AddDriveOptions) -> Result<usize> {
        self.trace_call("add_drive_scratch");
        let result = self.add_drive_scratch_inner(size, opts);
        self.record(result)
    }

    fn add_drive_scratch_inner(&mut self, size: u64, opts: &AddDriveOptions) -> Result<usize> {
        self.require_config("add_drive_scratch")?;
        let path = self.tmpdirs.make_temp_path("scratch", Some("img"))?;
        create_raw_disk(&path, size)?;

        let scratch = AddDriveOptions {
            format: Some("raw".to_string()),
            cachemode: Some("unsafe".to_string()),
            name: opts.name.clone(),
            label: opts.label.clone(),
            blocksize: opts.blocksize,
            ..Default::default()
        };
        let result = self.add_drive_inner(&path.to_string_lossy(), &scratch);
        if result.is_err() {
            if let Err(e) = fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "cannot remove rejected scratch disk");
            }
        }
        result
    }

    /// Hot-unplugging is not supported; this always fails.
    pub fn remove_drive(&mut self, label: &str) -> Result<()> {
        self.trace_call("remove_drive");
        debug!(label, "remove_drive requested");
        self.record(Err(Error::InvalidState(
            "hotplugging support was removed".to_string(),
        )))
    }

    /// Mark the drive list for a later [`rollback`](Self::rollback).
    pub fn checkpoint(&self) -> usize {
        self.drives.checkpoint()
    }

    /// Forget every drive added since `mark`.  Only allowed before launch.
    pub fn rollback(&mut self, mark: usize) -> Result<()> {
        self.trace_call("rollback");
        let result = self
            .require_config("rollback")
            .map(|()| self.truncate_drives(mark));
        self.record(result)
    }

    fn truncate_drives(&mut self, mark: usize) {
        if mark < self.drives.len() {
            debug!(from = self.drives.len(), to = mark, "rolling back drives");
        }
        self.drives.rollback(mark);
    }

    /// Add several drives, all or nothing.
    pub fn add_drives_atomic<I, S>(&mut self, drives: I) -> Result<Vec<usize>>
    where
        I: IntoIterator<Item = (S, AddDriveOptions)>,
        S: AsRef<str>,
    {
        let mark = self.checkpoint();
        let mut indices = Vec::new();
        for (filename, opts) in drives {
            match self.add_drive(filename.as_ref(), &opts) {
                Ok(index) => indices.push(index),
                Err(e) => {
                    self.truncate_drives(mark);
                    return Err(e);
                }
            }
        }
        Ok(indices)
    }

    /// How many drives the backend can take, if it can say.
    pub fn max_disks(&mut self) -> Result<usize> {
        self.trace_call("max_disks");
        let result = self.backend.max_disks();
        self.record(result)
    }

    /// Process id of the hypervisor.
    pub fn get_pid(&mut self) -> Result<u32> {
        self.trace_call("get_pid");
        let result = if self.state == SessionState::Ready {
            self.backend.get_pid()
        } else {
            Err(Error::InvalidState(
                "get_pid: call launch before using this function".to_string(),
            ))
        };
        self.record(result)
    }

    /// Start the appliance.
    ///
    /// A failed launch puts the session back in [`SessionState::Config`]
    /// with fresh backend state, so it may be retried.
    pub fn launch(&mut self) -> Result<()> {
        self.trace_call("launch");
        let result = self.launch_inner();
        self.record(result)
    }

    fn launch_inner(&mut self) -> Result<()> {
        if self.state != SessionState::Config {
            return Err(Error::InvalidState(
                "the session has already been launched".to_string(),
            ));
        }

        // Some backends cannot report a limit; then there is nothing to check.
        if let Ok(max) = self.backend.max_disks() {
            if self.drives.len() > max {
                return Err(Error::TooManyDrives(max));
            }
        }

        let mut progress = ProgressTracker::start();
        let tmpdir = self.tmpdirs.path()?.to_path_buf();
        debug!(
            backend = %self.method,
            tmpdir = %tmpdir.display(),
            drives = self.drives.len(),
            euid = nix::unistd::geteuid().as_raw(),
            "launch"
        );

        self.state = SessionState::Launching;
        let launched = {
            let mut ctx = LaunchContext::new(
                &self.drives,
                &self.config,
                &mut self.tmpdirs,
                &self.events,
                &mut progress,
            );
            self.backend.launch(&mut ctx, self.backend_arg.as_deref())
        };

        match launched {
            Ok(Launched {
                connection,
                appliance_drive,
            }) => {
                self.conn = Some(connection);
                self.state = SessionState::Ready;
                if progress.should_send(PROGRESS_TOTAL) {
                    self.events.progress(PROGRESS_TOTAL, PROGRESS_TOTAL);
                }
                if appliance_drive {
                    self.drives.add_dummy();
                }
                info!(backend = %self.method, "appliance ready");
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "launch failed, returning to config state");
                if let Err(shutdown) = self.backend.shutdown() {
                    debug!(error = %shutdown, "backend shutdown after failed launch");
                }
                self.backend = self.entry.instantiate(&self.config);
                self.conn = None;
                self.state = SessionState::Config;
                Err(e)
            }
        }
    }

    /// The connection to the appliance daemon.
    pub fn connection(&mut self) -> Result<&mut Connection> {
        match self.conn.as_mut() {
            Some(conn) if self.state == SessionState::Ready => Ok(conn),
            _ => Err(Error::InvalidState(
                "call launch before using this function".to_string(),
            )),
        }
    }

    /// Stop the appliance and release everything the session holds.
    pub fn shutdown(mut self) -> Result<()> {
        self.trace_call("shutdown");
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        self.conn = None;
        self.backend.shutdown()
    }

    fn require_config(&self, call: &str) -> Result<()> {
        if self.state == SessionState::Config {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "{}: this function can only be called in the config state",
                call
            )))
        }
    }

    fn trace_call(&self, call: &str) {
        if self.config.trace {
            info!(target: "vm_appliance::trace", call, "trace");
        }
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            debug!(error = %e, "call failed");
            self.last_error = Some(LastError {
                message: e.to_string(),
                errno: e.raw_os_error(),
            });
        }
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(error = %e, "error closing session");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("backend", &self.method)
            .field("drives", &self.drives.len())
            .finish_non_exhaustive()
    }
}
