//! vm-appliance: launch and talk to a disk-access appliance VM
//!
//! A [`Session`] collects the block devices the appliance should see,
//! validating each one as it is added, then launches the appliance through
//! a pluggable [`Backend`] chosen by name from a [`BackendRegistry`].  Once
//! the appliance is up, the session's [`Connection`] carries bytes to and
//! from the daemon running inside it, while console output is passed to a
//! log callback.

pub mod backend;
pub mod config;
pub mod connection;
pub mod drive;
pub mod error;
pub mod events;
pub mod launch;
pub mod logging;
pub mod session;
pub mod tmpdir;

pub use backend::{Backend, BackendRegistry};
pub use config::SessionConfig;
pub use connection::Connection;
pub use drive::{AddDriveOptions, Drive, DriveRegistry, Protocol};
pub use error::{Error, ErrorKind, Result};
pub use launch::{LaunchContext, Launched};
pub use session::{LastError, Session, SessionState};
