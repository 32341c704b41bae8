//! Backend trait and the registry backends are selected from

mod direct;
mod unix;

pub use direct::{DirectBackend, DirectConfig};
pub use unix::UnixBackend;

use crate::config::SessionConfig;
use crate::drive::Drive;
use crate::error::{Error, Result};
use crate::launch::{LaunchContext, Launched};
use crate::tmpdir::TempDirs;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A way of starting, or attaching to, an appliance.
///
/// Only [`launch`](Backend::launch) is required.  The other operations
/// default to a capability error, which callers treat as "this backend
/// cannot do that" rather than as a bad argument.
pub trait Backend: Send {
    /// Start the appliance and return a connection to its daemon.
    ///
    /// `arg` is whatever followed `name:` in the backend method.
    fn launch(&mut self, ctx: &mut LaunchContext<'_>, arg: Option<&str>) -> Result<Launched>;

    /// Create a writable overlay in front of a read-only drive.
    fn create_cow_overlay(&mut self, _tmpdirs: &mut TempDirs, _drive: &Drive) -> Result<PathBuf> {
        Err(Error::NotSupported(
            "this backend does not support adding read-only drives".to_string(),
        ))
    }

    /// Process id of the hypervisor.
    fn get_pid(&self) -> Result<u32> {
        Err(Error::NotSupported(
            "the current backend does not support 'get_pid'".to_string(),
        ))
    }

    /// The most drives the appliance can be given.
    fn max_disks(&self) -> Result<usize> {
        Err(Error::NotSupported(
            "the current backend does not allow max disks to be queried".to_string(),
        ))
    }

    /// Stop the appliance, if this backend started one.
    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds the per-session state of a backend.
pub type BackendFactory = Arc<dyn Fn(&SessionConfig) -> Box<dyn Backend> + Send + Sync>;

/// One registered backend
#[derive(Clone)]
pub struct BackendEntry {
    name: String,
    factory: BackendFactory,
}

impl BackendEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fresh per-session state for this backend.
    pub fn instantiate(&self, config: &SessionConfig) -> Box<dyn Backend> {
        (self.factory)(config)
    }
}

impl fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The backends a process knows about.
///
/// Built once at startup and shared, read-only, by every session.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    entries: Vec<BackendEntry>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the `direct` and `unix` backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("direct", |config: &SessionConfig| {
            Box::new(DirectBackend::new(DirectConfig::from(config))) as Box<dyn Backend>
        });
        registry.register("unix", |_: &SessionConfig| {
            Box::new(UnixBackend::new()) as Box<dyn Backend>
        });
        registry
    }

    /// Add a backend.  Registering a name twice replaces the first entry.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&SessionConfig) -> Box<dyn Backend> + Send + Sync + 'static,
    {
        let entry = BackendEntry {
            name: name.to_string(),
            factory: Arc::new(factory),
        };
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Find the backend for `method`, which is `name` or `name:argument`.
    ///
    /// Returns the entry, the method with aliases resolved and the
    /// argument, if any.
    pub fn resolve(&self, method: &str) -> Result<(&BackendEntry, String, Option<String>)> {
        // Older callers still ask for "appliance".
        let method = if method == "appliance" {
            "direct"
        } else {
            method
        };

        for entry in &self.entries {
            if method == entry.name {
                return Ok((entry, method.to_string(), None));
            }
            if let Some(arg) = method
                .strip_prefix(entry.name.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
            {
                return Ok((entry, method.to_string(), Some(arg.to_string())));
            }
        }

        Err(Error::UnknownBackend(method.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    struct Nothing;

    impl Backend for Nothing {
        fn launch(&mut self, _: &mut LaunchContext<'_>, _: Option<&str>) -> Result<Launched> {
            Err(Error::NotSupported("nothing to launch".to_string()))
        }
    }

    fn nothing(_: &SessionConfig) -> Box<dyn Backend> {
        Box::new(Nothing)
    }

    #[test]
    fn resolves_exact_and_prefixed_names() {
        let registry = BackendRegistry::with_defaults();

        let (entry, method, arg) = registry.resolve("direct").unwrap();
        assert_eq!((entry.name(), method.as_str(), arg), ("direct", "direct", None));

        let (entry, _, arg) = registry.resolve("unix:/run/appliance.sock").unwrap();
        assert_eq!(entry.name(), "unix");
        assert_eq!(arg.as_deref(), Some("/run/appliance.sock"));

        let (entry, method, _) = registry.resolve("appliance").unwrap();
        assert_eq!(entry.name(), "direct");
        assert_eq!(method, "direct");
    }

    #[test]
    fn prefix_needs_a_colon() {
        let registry = BackendRegistry::with_defaults();
        assert!(matches!(
            registry.resolve("directly"),
            Err(Error::UnknownBackend(m)) if m == "directly"
        ));
        assert!(registry.resolve("libvirt").is_err());
    }

    #[test]
    fn registering_twice_replaces() {
        let mut registry = BackendRegistry::new();
        registry.register("test", nothing);
        registry.register("test", nothing);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["test"]);
    }

    #[test]
    fn optional_operations_are_capability_errors() {
        let mut backend = Nothing;
        assert_eq!(backend.get_pid().unwrap_err().kind(), ErrorKind::Capability);
        assert_eq!(backend.max_disks().unwrap_err().kind(), ErrorKind::Capability);
        assert!(backend.shutdown().is_ok());

        let base = tempfile::tempdir().unwrap();
        let mut tmpdirs = TempDirs::new(base.path());
        let err = backend
            .create_cow_overlay(&mut tmpdirs, &Drive::dummy())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capability);
    }
}
