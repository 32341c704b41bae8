//! Byte channel between the library and the appliance daemon.
//!
//! A [`Connection`] starts out either *listening*, holding a bound socket
//! the appliance will connect back to, or already *connected*.  Either way
//! it may also hold a console endpoint carrying boot messages.  Every
//! blocking operation polls the console alongside the daemon socket so
//! console output is forwarded while waiting, and is never interleaved
//! with daemon bytes.

use crate::error::{Error, Result};
use crate::events::ConsoleSink;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// How long the appliance has to connect back after the listener is created.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

const CONSOLE_BUFSIZ: usize = 8192;

// The emulated 16550A has a 16 byte FIFO; waiting a little groups its
// tiny reads into whole lines.
const CONSOLE_COALESCE: Duration = Duration::from_millis(1);

/// ISO/IEC 6429 Device Status Report query.
const DSR_REQUEST: &[u8] = b"\x1b[6n";

/// A fake 24x80 geometry, padded with backspaces: sgabios stalls on
/// replies shorter than 14 bytes and ignores NULs.
const DSR_REPLY: &[u8] =
    b"\x1b[24;80R\x08\x08\x08\x08\x08\x08\x08\x08\x08\x08\x08\x08\x08\x08\x08\x08";

enum Endpoint {
    Listening {
        listener: UnixListener,
        started: Instant,
    },
    Connected(UnixStream),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleStatus {
    Forwarded,
    Idle,
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum Polled {
    TimedOut,
    Interrupted,
    Ready { daemon: bool, console: bool },
}

pub struct Connection {
    daemon: Endpoint,
    console: Option<File>,
    sink: Option<ConsoleSink>,
    timeout: Duration,
    verbose: bool,
}

impl Connection {
    /// Wait for the appliance to connect to `listener`.
    ///
    /// The accept timeout is counted from here.
    pub fn listening(listener: UnixListener, console: Option<OwnedFd>) -> Result<Self> {
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::os("listening socket: set_nonblocking", e))?;
        Ok(Self {
            daemon: Endpoint::Listening {
                listener,
                started: Instant::now(),
            },
            console: console.map(open_console).transpose()?,
            sink: None,
            timeout: DEFAULT_ACCEPT_TIMEOUT,
            verbose: false,
        })
    }

    /// Wrap a socket already connected to the daemon.
    pub fn connected(stream: UnixStream, console: Option<OwnedFd>) -> Result<Self> {
        stream
            .set_nonblocking(true)
            .map_err(|e| Error::os("daemon socket: set_nonblocking", e))?;
        Ok(Self {
            daemon: Endpoint::Connected(stream),
            console: console.map(open_console).transpose()?,
            sink: None,
            timeout: DEFAULT_ACCEPT_TIMEOUT,
            verbose: false,
        })
    }

    pub fn with_sink(mut self, sink: ConsoleSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Verbose connections leave the troubleshooting advice out of errors.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.daemon, Endpoint::Connected(_))
    }

    /// Block until the appliance connects, forwarding console output meanwhile.
    pub fn accept(&mut self) -> Result<()> {
        let stream = {
            let (listener, started) = match &self.daemon {
                Endpoint::Listening { listener, started } => (listener, *started),
                Endpoint::Connected(_) => {
                    return Err(Error::InvalidState(
                        "accept called on a connected socket".to_string(),
                    ))
                }
            };

            loop {
                let remaining = match self.timeout.checked_sub(started.elapsed()) {
                    Some(remaining) if !remaining.is_zero() => remaining,
                    _ => return Err(Error::launch_timeout(self.verbose)),
                };
                let timeout = PollTimeout::try_from(remaining).unwrap_or(PollTimeout::MAX);

                let (daemon, console) = match poll_endpoints(
                    listener.as_fd(),
                    PollFlags::POLLIN,
                    self.console_borrow(),
                    timeout,
                    "accept",
                )? {
                    Polled::Ready { daemon, console } => (daemon, console),
                    Polled::Interrupted => continue,
                    Polled::TimedOut => return Err(Error::launch_timeout(self.verbose)),
                };

                if console && self.handle_console()? == ConsoleStatus::Closed {
                    return Err(Error::launch_failed(self.verbose));
                }

                if daemon {
                    match listener.accept() {
                        Ok((stream, _)) => break stream,
                        Err(e) if is_transient(&e) => continue,
                        Err(e) => return Err(Error::os("accept: accept", e)),
                    }
                }
            }
        };

        stream
            .set_nonblocking(true)
            .map_err(|e| Error::os("accept: set_nonblocking", e))?;
        debug!("appliance connected");
        // Dropping the listener closes it.
        self.daemon = Endpoint::Connected(stream);
        Ok(())
    }

    /// Fill `buf` from the daemon.
    ///
    /// Returns `buf.len()`, or `0` if the appliance closed the connection
    /// first.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream("read")?;
        let mut done = 0;

        while done < buf.len() {
            let (daemon, console) = match poll_endpoints(
                stream.as_fd(),
                PollFlags::POLLIN,
                self.console_borrow(),
                PollTimeout::NONE,
                "read",
            )? {
                Polled::Ready { daemon, console } => (daemon, console),
                Polled::Interrupted | Polled::TimedOut => continue,
            };

            if console && self.handle_console()? == ConsoleStatus::Closed {
                return Ok(0);
            }

            if daemon {
                let mut reader = stream;
                match reader.read(&mut buf[done..]) {
                    Ok(0) => return Ok(self.closed()),
                    Ok(n) => done += n,
                    Err(e) if is_transient(&e) => continue,
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                        return Ok(self.closed())
                    }
                    Err(e) => return Err(Error::os("read", e)),
                }
            }
        }

        trace!(len = buf.len(), "read from daemon");
        Ok(buf.len())
    }

    /// Write all of `buf` to the daemon.
    ///
    /// Returns `buf.len()`, or `0` if the appliance has gone away.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let stream = self.stream("write")?;
        let mut done = 0;

        while done < buf.len() {
            let (daemon, console) = match poll_endpoints(
                stream.as_fd(),
                PollFlags::POLLOUT,
                self.console_borrow(),
                PollTimeout::NONE,
                "write",
            )? {
                Polled::Ready { daemon, console } => (daemon, console),
                Polled::Interrupted | Polled::TimedOut => continue,
            };

            if console && self.handle_console()? == ConsoleStatus::Closed {
                return Ok(0);
            }

            if daemon {
                let mut writer = stream;
                match writer.write(&buf[done..]) {
                    Ok(n) => done += n,
                    Err(e) if is_transient(&e) => continue,
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(0),
                    Err(e) => return Err(Error::os("write", e)),
                }
            }
        }

        trace!(len = buf.len(), "wrote to daemon");
        Ok(buf.len())
    }

    /// Whether a read would make progress without blocking.
    pub fn can_read(&self) -> Result<bool> {
        let stream = self.stream("can_read")?;
        loop {
            match poll_endpoints(
                stream.as_fd(),
                PollFlags::POLLIN,
                None,
                PollTimeout::ZERO,
                "can_read",
            )? {
                Polled::Interrupted => continue,
                Polled::TimedOut => return Ok(false),
                Polled::Ready { daemon, .. } => return Ok(daemon),
            }
        }
    }

    /// The console endpoint, for backends that need to hand it on.
    pub fn console_fd(&self) -> Result<BorrowedFd<'_>> {
        self.console_borrow()
            .ok_or_else(|| Error::InvalidState("console socket not connected".to_string()))
    }

    fn stream(&self, what: &str) -> Result<&UnixStream> {
        match &self.daemon {
            Endpoint::Connected(stream) => Ok(stream),
            Endpoint::Listening { .. } => Err(Error::InvalidState(format!(
                "{}: socket not connected",
                what
            ))),
        }
    }

    fn console_borrow(&self) -> Option<BorrowedFd<'_>> {
        self.console.as_ref().map(|console| console.as_fd())
    }

    /// The daemon went away; pick up whatever the console still has.
    fn closed(&self) -> usize {
        debug!("appliance closed the daemon connection");
        while let Ok(ConsoleStatus::Forwarded) = self.handle_console() {}
        0
    }

    fn handle_console(&self) -> Result<ConsoleStatus> {
        let Some(console) = &self.console else {
            return Ok(ConsoleStatus::Idle);
        };

        thread::sleep(CONSOLE_COALESCE);

        let mut buf = [0u8; CONSOLE_BUFSIZ];
        let mut reader = console;
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(ConsoleStatus::Closed),
            Ok(n) => n,
            Err(e) if is_transient(&e) => return Ok(ConsoleStatus::Idle),
            Err(e) => {
                return Err(Error::os(
                    "error reading console messages from the appliance",
                    e,
                ))
            }
        };
        let chunk = &buf[..n];

        if chunk.windows(DSR_REQUEST.len()).any(|w| w == DSR_REQUEST) {
            debug!("responding to serial console Device Status Report");
            let mut writer = console;
            let _ = writer.write(DSR_REPLY);
        }

        if let Some(sink) = &self.sink {
            sink(chunk);
        }
        Ok(ConsoleStatus::Forwarded)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.is_connected())
            .field("console", &self.console.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn open_console(fd: OwnedFd) -> Result<File> {
    let raw = fd.as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL)
        .map_err(|e| Error::os("console: fcntl F_GETFL", e))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(|e| Error::os("console: fcntl F_SETFL", e))?;
    Ok(File::from(fd))
}

/// Poll the daemon for `events` and the console for input.
///
/// `EINTR` and `EAGAIN` come back as [`Polled::Interrupted`] so each caller
/// can go round its own loop again.
fn poll_endpoints(
    daemon: BorrowedFd<'_>,
    events: PollFlags,
    console: Option<BorrowedFd<'_>>,
    timeout: PollTimeout,
    what: &str,
) -> Result<Polled> {
    let mut fds = Vec::with_capacity(2);
    fds.push(PollFd::new(daemon, events));
    if let Some(console) = console {
        fds.push(PollFd::new(console, PollFlags::POLLIN));
    }

    match poll(&mut fds, timeout) {
        Ok(0) => Ok(Polled::TimedOut),
        Ok(_) => {
            let daemon = fds[0].revents().unwrap_or(PollFlags::empty());
            let console = fds
                .get(1)
                .and_then(|fd| fd.revents())
                .unwrap_or(PollFlags::empty());
            Ok(Polled::Ready {
                daemon: daemon.intersects(events | PollFlags::POLLHUP | PollFlags::POLLERR),
                console: console
                    .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR),
            })
        }
        Err(Errno::EINTR | Errno::EAGAIN) => Ok(Polled::Interrupted),
        Err(e) => Err(Error::os(format!("{}: poll", what), e)),
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collecting_sink() -> (ConsoleSink, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: ConsoleSink = Arc::new(move |buf: &[u8]| {
            sink_seen.lock().unwrap().extend_from_slice(buf);
        });
        (sink, seen)
    }

    fn echo(len: usize) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut conn = Connection::connected(ours, None).unwrap();

        let peer = thread::spawn(move || {
            let mut theirs = theirs;
            let mut buf = vec![0u8; len];
            theirs.read_exact(&mut buf).unwrap();
            theirs.write_all(&buf).unwrap();
        });

        let sent: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        assert_eq!(conn.write(&sent).unwrap(), len);

        let mut received = vec![0u8; len];
        assert_eq!(conn.read(&mut received).unwrap(), len);
        assert_eq!(received, sent);
        peer.join().unwrap();
    }

    #[test]
    fn echo_small() {
        echo(11);
    }

    #[test]
    fn echo_larger_than_socket_buffer() {
        echo(1 << 20);
    }

    #[test]
    fn accept_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("daemon.sock")).unwrap();
        let mut conn = Connection::listening(listener, None)
            .unwrap()
            .with_timeout(Duration::from_millis(200));

        let start = Instant::now();
        let err = conn.accept().unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!conn.is_connected());
    }

    #[test]
    fn accept_then_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let mut conn = Connection::listening(listener, None).unwrap();

        let peer = thread::spawn(move || {
            let mut stream = UnixStream::connect(&path).unwrap();
            stream.write_all(b"ping").unwrap();
        });

        conn.accept().unwrap();
        assert!(conn.is_connected());
        assert!(matches!(conn.accept(), Err(Error::InvalidState(_))));

        let mut buf = [0u8; 4];
        assert_eq!(conn.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ping");
        peer.join().unwrap();
    }

    #[test]
    fn console_close_during_accept_fails_launch() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("daemon.sock")).unwrap();
        let (console, console_peer) = UnixStream::pair().unwrap();
        let (sink, seen) = collecting_sink();
        let mut conn = Connection::listening(listener, Some(console.into()))
            .unwrap()
            .with_sink(sink)
            .with_verbose(true);

        let mut console_peer = console_peer;
        console_peer.write_all(b"kernel panic\n").unwrap();
        drop(console_peer);

        let err = conn.accept().unwrap_err();
        assert!(matches!(err, Error::LaunchFailed(_)));
        assert_eq!(seen.lock().unwrap().as_slice(), b"kernel panic\n");
    }

    #[test]
    fn dsr_query_gets_one_reply() {
        let (daemon, mut daemon_peer) = UnixStream::pair().unwrap();
        let (console, mut console_peer) = UnixStream::pair().unwrap();
        let (sink, seen) = collecting_sink();
        let mut conn = Connection::connected(daemon, Some(console.into()))
            .unwrap()
            .with_sink(sink);

        console_peer.write_all(b"SeaBIOS\x1b[6n").unwrap();
        daemon_peer.write_all(b"data").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(conn.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"data");
        assert_eq!(seen.lock().unwrap().as_slice(), b"SeaBIOS\x1b[6n");

        let mut reply = [0u8; 24];
        console_peer.read_exact(&mut reply).unwrap();
        assert_eq!(&reply[..], DSR_REPLY);

        console_peer.set_nonblocking(true).unwrap();
        let mut extra = [0u8; 1];
        let err = console_peer.read(&mut extra).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn peer_close_reads_and_writes_zero() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut conn = Connection::connected(ours, None).unwrap();
        drop(theirs);

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).unwrap(), 0);
        assert_eq!(conn.write(b"hello").unwrap(), 0);
    }

    #[test]
    fn can_read_does_not_block() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let conn = Connection::connected(ours, None).unwrap();
        assert!(!conn.can_read().unwrap());
        theirs.write_all(b"x").unwrap();
        assert!(conn.can_read().unwrap());
    }

    #[test]
    fn listening_connection_rejects_io() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("s")).unwrap();
        let mut conn = Connection::listening(listener, None).unwrap();
        assert!(matches!(conn.write(b"x"), Err(Error::InvalidState(_))));
        assert!(conn.console_fd().is_err());
    }
}
