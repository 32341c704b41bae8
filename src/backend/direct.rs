//! Direct backend: run the hypervisor as a child process

use super::Backend;
use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::drive::{qemu_param, Discard, Drive, DriveRegistry};
use crate::error::{Error, Result};
use crate::launch::{wait_for_launch_flag, LaunchContext, Launched};
use crate::tmpdir::TempDirs;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Limit on drives, from the number of targets on one virtio-scsi bus.
const MAX_DISKS: usize = 255;

/// `sun_path` is 108 bytes including the terminating NUL.
const UNIX_PATH_MAX: usize = 108;

const CHANNEL_NAME: &str = "org.vmappliance.channel.0";

/// Configuration for the direct backend
#[derive(Debug, Clone)]
pub struct DirectConfig {
    /// Hypervisor binary; `qemu-system-<arch>` from `PATH` when unset.
    pub hv: Option<PathBuf>,
    pub qemu_img: PathBuf,
    pub memsize: u32,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    pub append: Option<String>,
    /// Root disk the appliance boots from, attached after every user drive.
    pub appliance: Option<PathBuf>,
    pub accept_timeout: Duration,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for DirectConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            hv: config.hv.clone(),
            qemu_img: config.qemu_img.clone(),
            memsize: config.memsize,
            kernel: config.kernel.clone(),
            initrd: config.initrd.clone(),
            append: config.append.clone(),
            appliance: config.appliance.clone(),
            accept_timeout: config.accept_timeout(),
        }
    }
}

/// Direct backend implementation
///
/// Starts the hypervisor with every drive on a virtio-scsi bus, the
/// daemon channel on a virtio-serial port backed by a Unix socket in the
/// session's temporary directory, and the serial console on a socketpair.
pub struct DirectBackend {
    config: DirectConfig,
    child: Option<Child>,
    socket: Option<PathBuf>,
}

impl DirectBackend {
    pub fn new(config: DirectConfig) -> Self {
        Self {
            config,
            child: None,
            socket: None,
        }
    }

    fn find_hypervisor(&self) -> Result<PathBuf> {
        if let Some(hv) = &self.config.hv {
            return Ok(hv.clone());
        }
        let name = format!("qemu-system-{}", std::env::consts::ARCH);
        which::which(&name).map_err(|_| {
            Error::InvalidParameter(format!(
                "{}: hypervisor not found on PATH, set VM_APPLIANCE_HV",
                name
            ))
        })
    }

    /// Hypervisor arguments for `drives`, talking to the daemon on `socket`.
    fn command_line(&self, drives: &DriveRegistry, socket: &Path) -> Result<Vec<String>> {
        let mut args: Vec<String> = [
            "-no-user-config",
            "-nodefaults",
            "-display",
            "none",
            "-machine",
            "accel=kvm:tcg",
            "-no-reboot",
            "-rtc",
            "driftfix=slew",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push("-m".to_string());
        args.push(self.config.memsize.to_string());

        if let Some(kernel) = &self.config.kernel {
            args.push("-kernel".to_string());
            args.push(kernel.display().to_string());
        }
        if let Some(initrd) = &self.config.initrd {
            args.push("-initrd".to_string());
            args.push(initrd.display().to_string());
        }

        args.push("-device".to_string());
        args.push("virtio-scsi-pci,id=scsi".to_string());

        for (index, drive) in drives.iter() {
            if drive.is_dummy() {
                continue;
            }
            args.push("-drive".to_string());
            args.push(drive_param(index, drive)?);
            args.push("-device".to_string());
            args.push(device_param(index, drive));
        }

        if let Some(appliance) = &self.config.appliance {
            args.push("-drive".to_string());
            args.push(format!(
                "file={},snapshot=on,id=appliance,cache=unsafe,if=none,format=raw",
                quote(&appliance.display().to_string())
            ));
            args.push("-device".to_string());
            args.push("scsi-hd,drive=appliance".to_string());
        }

        args.push("-device".to_string());
        args.push("virtio-serial-pci".to_string());
        args.push("-serial".to_string());
        args.push("stdio".to_string());
        args.push("-chardev".to_string());
        args.push(format!(
            "socket,path={},id=channel0",
            quote(&socket.display().to_string())
        ));
        args.push("-device".to_string());
        args.push(format!(
            "virtserialport,chardev=channel0,name={}",
            CHANNEL_NAME
        ));

        if let Some(append) = &self.config.append {
            args.push("-append".to_string());
            args.push(append.clone());
        }

        Ok(args)
    }

    /// Run a command, returning stdout on success
    fn run_command(&self, program: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new(program).args(args).output()?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(Error::CommandFailed {
                command: format!("{} {}", program.display(), args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    fn spawn(&mut self, hv: &Path, args: &[String], console: UnixStream) -> Result<()> {
        let stdio = |stream: &UnixStream| -> Result<Stdio> {
            let fd: OwnedFd = stream
                .try_clone()
                .map_err(|e| Error::os("dup console socket", e))?
                .into();
            Ok(Stdio::from(fd))
        };

        // stderr goes to the console as well, so hypervisor errors show
        // up in the log callback.
        let child = Command::new(hv)
            .args(args)
            .stdin(stdio(&console)?)
            .stdout(stdio(&console)?)
            .stderr(stdio(&console)?)
            .spawn()
            .map_err(|e| Error::os(format!("{}: cannot run hypervisor", hv.display()), e))?;

        info!(pid = child.id(), hv = %hv.display(), "hypervisor started");
        self.child = Some(child);
        Ok(())
    }

    fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.remove_socket();
    }

    fn remove_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            if let Err(e) = fs::remove_file(&socket) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(socket = %socket.display(), error = %e, "cannot remove daemon socket");
                }
            }
        }
    }
}

impl Backend for DirectBackend {
    fn launch(&mut self, ctx: &mut LaunchContext<'_>, arg: Option<&str>) -> Result<Launched> {
        if arg.is_some() {
            return Err(Error::InvalidParameter(
                "direct backend does not take arguments".to_string(),
            ));
        }
        if ctx.drives().is_empty() {
            return Err(Error::InvalidState(
                "you must call add_drive before launch".to_string(),
            ));
        }

        ctx.send_progress(0);
        let hv = self.find_hypervisor()?;

        let socket = ctx.tmpdirs().make_temp_path("daemon", Some("sock"))?;
        if socket.as_os_str().len() >= UNIX_PATH_MAX {
            return Err(Error::os(
                socket.display().to_string(),
                io::Error::from_raw_os_error(nix::libc::ENAMETOOLONG),
            ));
        }
        let listener = UnixListener::bind(&socket)
            .map_err(|e| Error::os(format!("bind: {}", socket.display()), e))?;
        self.socket = Some(socket.clone());

        let (console, console_peer) =
            UnixStream::pair().map_err(|e| Error::os("socketpair", e))?;

        let args = self.command_line(ctx.drives(), &socket)?;
        debug!(hv = %hv.display(), ?args, "hypervisor command line");
        if let Err(e) = self.spawn(&hv, &args, console_peer) {
            self.remove_socket();
            return Err(e);
        }
        ctx.send_progress(3);

        let verbose = ctx.verbose();
        let mut connection = Connection::listening(listener, Some(console.into()))?
            .with_sink(ctx.console_sink())
            .with_timeout(self.config.accept_timeout)
            .with_verbose(verbose);

        if let Err(e) = connection.accept() {
            self.kill_child();
            return Err(e);
        }
        ctx.send_progress(6);

        if let Err(e) = wait_for_launch_flag(&mut connection, verbose) {
            self.kill_child();
            return Err(e);
        }
        ctx.send_progress(9);

        Ok(Launched {
            connection,
            appliance_drive: self.config.appliance.is_some(),
        })
    }

    fn create_cow_overlay(&mut self, tmpdirs: &mut TempDirs, drive: &Drive) -> Result<PathBuf> {
        let backing = qemu_param(&drive.source)?;
        let overlay = tmpdirs.make_temp_path("overlay", Some("qcow2"))?;
        let overlay_str = overlay.to_string_lossy().into_owned();

        let mut args = vec!["create", "-f", "qcow2", "-b", backing.as_str()];
        if let Some(format) = &drive.source.format {
            args.push("-F");
            args.push(format.as_str());
        }
        args.push(overlay_str.as_str());

        self.run_command(&self.config.qemu_img, &args)?;
        debug!(overlay = %overlay.display(), backing = %backing, "created overlay");
        Ok(overlay)
    }

    fn get_pid(&self) -> Result<u32> {
        self.child
            .as_ref()
            .map(Child::id)
            .ok_or_else(|| Error::InvalidState("get_pid: no qemu subprocess".to_string()))
    }

    fn max_disks(&self) -> Result<usize> {
        Ok(MAX_DISKS)
    }

    fn shutdown(&mut self) -> Result<()> {
        let result = match self.child.take() {
            Some(mut child) => {
                debug!(pid = child.id(), "sending SIGTERM to hypervisor");
                if let Ok(pid) = i32::try_from(child.id()) {
                    let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
                }
                match child.wait() {
                    Ok(status) => {
                        debug!(%status, "hypervisor exited");
                        Ok(())
                    }
                    Err(e) => Err(Error::os("wait for hypervisor", e)),
                }
            }
            None => Ok(()),
        };
        self.remove_socket();
        result
    }
}

impl Drop for DirectBackend {
    fn drop(&mut self) {
        self.kill_child();
    }
}

/// Commas in option values are doubled.
fn quote(value: &str) -> String {
    value.replace(',', ",,")
}

fn drive_param(index: usize, drive: &Drive) -> Result<String> {
    let mut opts = Vec::new();

    match &drive.overlay {
        None => {
            opts.push(format!("file={}", quote(&qemu_param(&drive.source)?)));
            if drive.readonly {
                opts.push("snapshot=on".to_string());
            }
            let cache = drive.cachemode.map_or("writeback", |c| c.as_str());
            opts.push(format!("cache={}", cache));
            if let Some(format) = &drive.source.format {
                opts.push(format!("format={}", format));
            }
            if let Some(label) = &drive.disk_label {
                opts.push(format!("serial={}", label));
            }
            if drive.copyonread {
                opts.push("copy-on-read=on".to_string());
            }
            if drive.discard != Discard::Disable {
                opts.push("discard=unmap".to_string());
            }
        }
        Some(overlay) => {
            opts.push(format!("file={}", quote(&overlay.display().to_string())));
            opts.push("format=qcow2".to_string());
            opts.push("cache=unsafe".to_string());
            if let Some(label) = &drive.disk_label {
                opts.push(format!("serial={}", label));
            }
        }
    }

    opts.push(format!("id=hd{}", index));
    opts.push("if=none".to_string());
    Ok(opts.join(","))
}

fn device_param(index: usize, drive: &Drive) -> String {
    let mut device = format!("scsi-hd,drive=hd{}", index);
    if drive.blocksize != 0 {
        device.push_str(&format!(
            ",physical_block_size={0},logical_block_size={0}",
            drive.blocksize
        ));
    }
    device
}
