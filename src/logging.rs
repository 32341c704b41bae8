//! Logging initialisation for the vm-appliance binary.
//!
//! Logs go to stderr, filtered by `RUST_LOG`.  Without `RUST_LOG` only
//! warnings are shown, or everything from this crate when verbose, which
//! includes the appliance console under the `vm_appliance::console` target.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialise the global tracing subscriber.  Call once from `main`.
pub fn init(verbose: bool) {
    let default = if verbose { "vm_appliance=debug,warn" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
