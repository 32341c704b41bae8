//! vm-appliance CLI - Check drives and launch the appliance

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use vm_appliance::{
    logging, AddDriveOptions, BackendRegistry, ErrorKind, Result, Session, SessionConfig,
};

#[derive(Parser)]
#[command(name = "vm-appliance")]
#[command(about = "Launch a disk-access appliance VM", long_about = None)]
#[command(version)]
struct Cli {
    /// Backend to use, e.g. "direct" or "unix:/path/to/socket"
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Show debug messages and the appliance console
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available backends
    Backends,

    /// Validate drives and show how they would be attached
    Check {
        /// PATH[,key=value...], may be repeated
        #[arg(long = "drive", required = true)]
        drives: Vec<DriveArg>,
    },

    /// Launch the appliance with the given drives, then shut it down
    Launch {
        /// PATH[,key=value...], may be repeated
        #[arg(long = "drive", required = true)]
        drives: Vec<DriveArg>,
    },
}

/// A `--drive` argument.
///
/// Keys: protocol, server (`;` separated), format, readonly, label, name,
/// cache, discard, copyonread, blocksize, username, secret.
#[derive(Debug, Clone)]
struct DriveArg {
    path: String,
    opts: AddDriveOptions,
}

impl FromStr for DriveArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.split(',');
        let path = parts.next().unwrap_or_default().to_string();
        let mut opts = AddDriveOptions::default();

        for part in parts {
            let (key, value) = match part.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (part, None),
            };
            let text = || {
                value
                    .map(str::to_string)
                    .ok_or_else(|| format!("drive option '{}' needs a value", key))
            };
            match key {
                "protocol" => opts.protocol = Some(text()?),
                "server" => opts.server = text()?.split(';').map(str::to_string).collect(),
                "format" => opts.format = Some(text()?),
                "label" => opts.label = Some(text()?),
                "name" => opts.name = Some(text()?),
                "cache" => opts.cachemode = Some(text()?),
                "discard" => opts.discard = Some(text()?),
                "username" => opts.username = Some(text()?),
                "secret" => opts.secret = Some(text()?),
                "readonly" => opts.readonly = parse_flag(key, value)?,
                "copyonread" => opts.copyonread = parse_flag(key, value)?,
                "blocksize" => {
                    opts.blocksize = Some(
                        text()?
                            .parse()
                            .map_err(|_| format!("invalid blocksize '{}'", part))?,
                    )
                }
                _ => return Err(format!("unknown drive option '{}'", key)),
            }
        }

        Ok(DriveArg { path, opts })
    }
}

fn parse_flag(key: &str, value: Option<&str>) -> std::result::Result<bool, String> {
    match value {
        None | Some("true") | Some("on") | Some("1") => Ok(true),
        Some("false") | Some("off") | Some("0") => Ok(false),
        Some(other) => Err(format!("invalid value '{}' for {}", other, key)),
    }
}

fn info(msg: &str) {
    println!("{} {}", "[INFO]".blue(), msg);
}

fn success(msg: &str) {
    println!("{} {}", "[OK]".green(), msg);
}

fn warn(msg: &str) {
    println!("{} {}", "[WARN]".yellow(), msg);
}

fn error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red(), msg);
}

fn cmd_backends(registry: &BackendRegistry, config: &SessionConfig) -> Result<()> {
    info("Available backends:");
    for name in registry.names() {
        let marker = if config.backend == name || config.backend.starts_with(&format!("{}:", name))
        {
            " (selected)"
        } else {
            ""
        };
        println!("  {}{}", name, marker);
    }
    Ok(())
}

fn add_drives(session: &mut Session, drives: &[DriveArg]) -> Result<()> {
    let added = session.add_drives_atomic(
        drives
            .iter()
            .map(|drive| (drive.path.as_str(), drive.opts.clone())),
    )?;
    success(&format!("{} drive(s) added", added.len()));
    Ok(())
}

fn print_drives(session: &Session) {
    for (index, line) in session.debug_drives().iter().enumerate() {
        println!("  [{:>3}] {}", index, line);
    }
}

fn cmd_check(registry: Arc<BackendRegistry>, config: SessionConfig, drives: &[DriveArg]) -> Result<()> {
    let mut session = Session::new(registry, config)?;
    info(&format!("Using backend '{}'", session.backend()));

    add_drives(&mut session, drives)?;
    print_drives(&session);

    match session.max_disks() {
        Ok(max) => info(&format!("Backend supports up to {} drives", max)),
        Err(e) if e.kind() == ErrorKind::Capability => {
            warn("Backend cannot report a drive limit")
        }
        Err(e) => return Err(e),
    }

    session.shutdown()
}

fn cmd_launch(registry: Arc<BackendRegistry>, config: SessionConfig, drives: &[DriveArg]) -> Result<()> {
    let mut session = Session::new(registry, config)?;
    session.set_progress_callback(|position, total| {
        info(&format!("Launching... {}/{}", position, total));
    });

    add_drives(&mut session, drives)?;

    info(&format!("Launching appliance with backend '{}'...", session.backend()));
    session.launch()?;
    success("Appliance is up");
    print_drives(&session);

    match session.get_pid() {
        Ok(pid) => info(&format!("Hypervisor pid: {}", pid)),
        Err(e) if e.kind() == ErrorKind::Capability => {
            warn("Backend does not report a process id")
        }
        Err(e) => return Err(e),
    }

    info("Shutting down...");
    session.shutdown()?;
    success("Appliance stopped");

    Ok(())
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)?.with_env()?,
        None => SessionConfig::from_env()?,
    };
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if cli.verbose {
        config.verbose = true;
    }
    logging::init(config.verbose);

    let registry = Arc::new(BackendRegistry::with_defaults());

    match cli.command {
        Commands::Backends => cmd_backends(&registry, &config),
        Commands::Check { drives } => cmd_check(registry, config, &drives),
        Commands::Launch { drives } => cmd_launch(registry, config, &drives),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}
