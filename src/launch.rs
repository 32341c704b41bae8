//! Shared pieces of the launch sequence used by every backend.

use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::drive::DriveRegistry;
use crate::error::{Error, Result};
use crate::events::{ConsoleSink, Events};
use crate::tmpdir::TempDirs;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Sent by the daemon, as a big-endian length word, once it is ready.
pub const LAUNCH_FLAG: u32 = 0xf5f5_5ff5;

/// Progress is reported in twelfths.
pub const PROGRESS_TOTAL: u64 = 12;

/// Fast launches report no progress at all.
const PROGRESS_QUIET_PERIOD: Duration = Duration::from_secs(5);

/// Launch progress, throttled so that each milestone is sent at most once
/// and only for slow launches.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    started: Instant,
    sent: [bool; PROGRESS_TOTAL as usize + 1],
}

impl ProgressTracker {
    pub(crate) fn start() -> Self {
        Self::started_at(Instant::now())
    }

    pub(crate) fn started_at(started: Instant) -> Self {
        Self {
            started,
            sent: [false; PROGRESS_TOTAL as usize + 1],
        }
    }

    pub(crate) fn started(&self) -> Instant {
        self.started
    }

    /// Whether milestone `perdozen` should be reported now.
    pub(crate) fn should_send(&mut self, perdozen: u64) -> bool {
        if perdozen > PROGRESS_TOTAL || self.started.elapsed() < PROGRESS_QUIET_PERIOD {
            return false;
        }
        let sent = &mut self.sent[perdozen as usize];
        !std::mem::replace(sent, true)
    }
}

/// What a backend gets to work with while launching.
pub struct LaunchContext<'a> {
    drives: &'a DriveRegistry,
    config: &'a SessionConfig,
    tmpdirs: &'a mut TempDirs,
    events: &'a Events,
    progress: &'a mut ProgressTracker,
}

impl<'a> LaunchContext<'a> {
    pub(crate) fn new(
        drives: &'a DriveRegistry,
        config: &'a SessionConfig,
        tmpdirs: &'a mut TempDirs,
        events: &'a Events,
        progress: &'a mut ProgressTracker,
    ) -> Self {
        Self {
            drives,
            config,
            tmpdirs,
            events,
            progress,
        }
    }

    pub fn drives(&self) -> &DriveRegistry {
        self.drives
    }

    pub fn config(&self) -> &SessionConfig {
        self.config
    }

    pub fn tmpdirs(&mut self) -> &mut TempDirs {
        self.tmpdirs
    }

    pub fn verbose(&self) -> bool {
        self.config.verbose
    }

    /// When the launch began.
    pub fn started(&self) -> Instant {
        self.progress.started()
    }

    /// Report reaching milestone `perdozen` out of [`PROGRESS_TOTAL`].
    pub fn send_progress(&mut self, perdozen: u64) {
        if self.progress.should_send(perdozen) {
            self.events.progress(perdozen, PROGRESS_TOTAL);
        }
    }

    /// Where console output should go: the debug log and the caller's
    /// log callback.
    pub fn console_sink(&self) -> ConsoleSink {
        let events = self.events.clone();
        Arc::new(move |buf: &[u8]| {
            for line in String::from_utf8_lossy(buf).lines() {
                debug!(target: "vm_appliance::console", "{}", line);
            }
            events.log(buf);
        })
    }
}

/// Result of a successful backend launch.
#[derive(Debug)]
pub struct Launched {
    pub connection: Connection,
    /// The appliance booted from a root disk of its own, which takes up
    /// a device slot in the guest.
    pub appliance_drive: bool,
}

/// Wait for the daemon to announce itself.
///
/// Connecting to the socket only shows the hypervisor is up; the daemon
/// is ready once it has sent [`LAUNCH_FLAG`].
pub fn wait_for_launch_flag(conn: &mut Connection, verbose: bool) -> Result<()> {
    let mut word = [0u8; 4];
    if conn.read(&mut word)? == 0 {
        return Err(Error::launch_failed(verbose));
    }
    let flag = u32::from_be_bytes(word);
    if flag != LAUNCH_FLAG {
        debug!(flag = %format!("{:#010x}", flag), "unexpected launch message");
        return Err(Error::launch_failed(verbose));
    }
    debug!("appliance is up");
    Ok(())
}
