//! Callbacks through which a session reports to its caller.

use std::fmt;
use std::sync::Arc;

/// Receives raw console output from the appliance, one chunk at a time.
pub type LogCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Receives `(position, total)` launch progress.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Where a [`Connection`](crate::Connection) sends console chunks.
pub type ConsoleSink = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Events {
    pub log: Option<LogCallback>,
    pub progress: Option<ProgressCallback>,
}

impl Events {
    pub fn log(&self, buf: &[u8]) {
        if let Some(log) = &self.log {
            log(buf);
        }
    }

    pub fn progress(&self, position: u64, total: u64) {
        if let Some(progress) = &self.progress {
            progress(position, total);
        }
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("log", &self.log.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}
