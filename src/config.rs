//! Session configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings a session is created with.
///
/// Every field has a default, so a JSON file only needs the keys it
/// wants to change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub verbose: bool,
    /// Log every public session call.
    pub trace: bool,
    /// Backend method, `name` or `name:argument`.
    pub backend: String,
    /// Parent of the per-session temporary directory.
    pub tmpdir: PathBuf,
    /// Hypervisor binary; searched for on `PATH` when unset.
    pub hv: Option<PathBuf>,
    pub qemu_img: PathBuf,
    /// Appliance memory in MiB.
    pub memsize: u32,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    pub append: Option<String>,
    /// Root disk image the appliance boots from, if it has one.
    pub appliance: Option<PathBuf>,
    pub accept_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            trace: false,
            backend: "direct".to_string(),
            tmpdir: PathBuf::from("/tmp"),
            hv: None,
            qemu_img: PathBuf::from("qemu-img"),
            memsize: 1280,
            kernel: None,
            initrd: None,
            append: None,
            appliance: None,
            accept_timeout_secs: 20 * 60,
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `VM_APPLIANCE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).map_err(|e| Error::os(path.display().to_string(), e))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Apply environment overrides on top of `self`.
    pub fn with_env(self) -> Result<Self> {
        self.apply(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Self::default().apply(lookup)
    }

    fn apply(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(backend) = lookup("VM_APPLIANCE_BACKEND").filter(|s| !s.is_empty()) {
            self.backend = backend;
        }
        if let Some(debug) = lookup("VM_APPLIANCE_DEBUG") {
            self.verbose = is_true(&debug);
        }
        if let Some(trace) = lookup("VM_APPLIANCE_TRACE") {
            self.trace = is_true(&trace);
        }
        if let Some(tmpdir) = lookup("VM_APPLIANCE_TMPDIR")
            .or_else(|| lookup("TMPDIR"))
            .filter(|s| !s.is_empty())
        {
            self.tmpdir = PathBuf::from(tmpdir);
        }
        if let Some(hv) = lookup("VM_APPLIANCE_HV").filter(|s| !s.is_empty()) {
            self.hv = Some(PathBuf::from(hv));
        }
        if let Some(memsize) = lookup("VM_APPLIANCE_MEMSIZE") {
            self.memsize = match memsize.trim().parse::<u32>() {
                Ok(n) if n >= 128 => n,
                _ => {
                    return Err(Error::InvalidParameter(format!(
                        "non-numeric or too small value for VM_APPLIANCE_MEMSIZE: '{}'",
                        memsize
                    )))
                }
            };
        }
        Ok(self)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }
}

fn is_true(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = SessionConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.backend, "direct");
        assert_eq!(config.accept_timeout(), Duration::from_secs(1200));
    }

    #[test]
    fn environment_overrides() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("VM_APPLIANCE_BACKEND", "unix:/run/daemon.sock"),
            ("VM_APPLIANCE_DEBUG", "1"),
            ("VM_APPLIANCE_TRACE", "no"),
            ("TMPDIR", "/var/tmp"),
            ("VM_APPLIANCE_MEMSIZE", "2048"),
        ]))
        .unwrap();
        assert_eq!(config.backend, "unix:/run/daemon.sock");
        assert!(config.verbose);
        assert!(!config.trace);
        assert_eq!(config.tmpdir, PathBuf::from("/var/tmp"));
        assert_eq!(config.memsize, 2048);
    }

    #[test]
    fn appliance_tmpdir_wins_over_tmpdir() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("VM_APPLIANCE_TMPDIR", "/srv/tmp"),
            ("TMPDIR", "/var/tmp"),
        ]))
        .unwrap();
        assert_eq!(config.tmpdir, PathBuf::from("/srv/tmp"));
    }

    #[test]
    fn bad_memsize_is_rejected() {
        for value in ["lots", "64", "-1"] {
            let result =
                SessionConfig::from_lookup(lookup(&[("VM_APPLIANCE_MEMSIZE", value)]));
            assert!(matches!(result, Err(Error::InvalidParameter(_))), "{value}");
        }
    }

    #[test]
    fn load_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "memsize": 4096, "verbose": true }"#).unwrap();

        let config = SessionConfig::load(&path).unwrap();
        assert_eq!(config.memsize, 4096);
        assert!(config.verbose);
        assert_eq!(config.backend, "direct");
    }
}
